pub const PRICE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionAllocation {
    pub quantity: u64,
    pub trade_value: f64,
}

#[derive(Debug, PartialEq)]
pub enum PositionSizingOutcome {
    Sized(PositionAllocation),
    TooSmall { lot_size: u64, affordable: u64 },
}

pub struct PositionSizingParams {
    pub price: f64,
    pub equity: f64,
    pub max_position_pct: f64,
    pub lot_size: u64,
}

/// Whole lots worth at most `equity * max_position_pct` at `price`.
pub fn determine_position_size(params: PositionSizingParams) -> PositionSizingOutcome {
    let PositionSizingParams {
        price,
        equity,
        max_position_pct,
        lot_size,
    } = params;
    let lot_size = lot_size.max(1);

    if price <= 0.0 || !price.is_finite() || !equity.is_finite() {
        return PositionSizingOutcome::TooSmall {
            lot_size,
            affordable: 0,
        };
    }

    let budget = equity.max(0.0) * max_position_pct.max(0.0);
    let affordable = (budget / price.max(0.01)).floor().max(0.0) as u64;
    let quantity = (affordable / lot_size) * lot_size;
    if quantity < lot_size {
        return PositionSizingOutcome::TooSmall {
            lot_size,
            affordable,
        };
    }

    PositionSizingOutcome::Sized(PositionAllocation {
        quantity,
        trade_value: quantity as f64 * price,
    })
}

pub fn initial_stop_loss(entry_price: f64, stop_loss_mul: f64) -> f64 {
    entry_price * stop_loss_mul.max(0.0)
}

/// Reward-to-risk of an entry at `entry_price` targeting `target_price` with a
/// multiplicative stop. Returns -1 when there is no risk to measure against.
pub fn reward_to_risk(entry_price: f64, target_price: f64, stop_loss_mul: f64) -> f64 {
    let risk = entry_price - initial_stop_loss(entry_price, stop_loss_mul);
    if risk > 0.0 {
        (target_price - entry_price) / risk
    } else {
        -1.0
    }
}
