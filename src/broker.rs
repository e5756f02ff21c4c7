use crate::config::BrokerConfig;
use crate::error::OrderRejection;
use crate::models::*;
use crate::trading_rules::PRICE_EPSILON;
use chrono::NaiveDate;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub cash: f64,
    pub equity: f64,
    pub positions: HashMap<String, Position>,
}

/// Everything that happened while executing one day's pending orders.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub fills: Vec<Fill>,
    pub trades: Vec<Trade>,
    pub rejected: Vec<(Order, OrderRejection)>,
    /// Orders whose symbol has no bar on the execution day.
    pub unexecutable: Vec<Order>,
}

/// Position limits enforced when an order is submitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingLimits {
    pub max_positions: usize,
    pub max_position_pct: f64,
}

/// Owns the account for one run. Orders are queued by `submit_order` and
/// filled at the open of their scheduled day by `execute_pending`.
pub struct PortfolioBroker {
    config: BrokerConfig,
    limits: SizingLimits,
    account: Account,
    pending: Vec<Order>,
    next_order_id: u64,
    last_prices: HashMap<String, f64>,
}

impl PortfolioBroker {
    pub fn new(config: BrokerConfig, initial_cash: f64, limits: SizingLimits) -> Self {
        Self {
            config,
            limits,
            account: Account {
                cash: initial_cash,
                equity: initial_cash,
                positions: HashMap::new(),
            },
            pending: Vec::new(),
            next_order_id: 1,
            last_prices: HashMap::new(),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn cash(&self) -> f64 {
        self.account.cash
    }

    pub fn equity(&self) -> f64 {
        self.account.equity
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.account.positions
    }

    pub fn lot_size(&self) -> u64 {
        self.config.lot_size
    }

    pub fn open_position_count(&self) -> usize {
        self.account.positions.len()
    }

    pub fn pending_orders(&self) -> &[Order] {
        &self.pending
    }

    fn pending_buy_count(&self) -> usize {
        self.pending
            .iter()
            .filter(|order| order.side == Side::Buy)
            .count()
    }

    /// Marked value of all open positions at the last known prices.
    pub fn exposure(&self) -> f64 {
        self.account
            .positions
            .values()
            .map(|position| {
                let price = self
                    .last_prices
                    .get(&position.symbol)
                    .copied()
                    .unwrap_or(position.entry_price);
                position.market_value(price)
            })
            .sum()
    }

    /// Validates and queues an order. The returned id is assigned here.
    pub fn submit_order(&mut self, mut order: Order) -> Result<u64, OrderRejection> {
        if order.quantity == 0 {
            return Err(OrderRejection::InvalidQuantity);
        }

        match order.side {
            Side::Buy => {
                let open = self.open_position_count() + self.pending_buy_count();
                let max = self.limits.max_positions.max(1);
                if open >= max {
                    return Err(OrderRejection::MaxPositionsReached { open, max });
                }
                let notional = order.quantity as f64 * order.reference_price;
                let limit = self.account.equity * self.limits.max_position_pct;
                if notional > limit + PRICE_EPSILON {
                    return Err(OrderRejection::PositionLimitExceeded { notional, limit });
                }
            }
            Side::Sell => {
                if !self.account.positions.contains_key(&order.symbol) {
                    return Err(OrderRejection::NoPosition(order.symbol.clone()));
                }
            }
        }

        order.id = self.next_order_id;
        self.next_order_id += 1;
        trace!(
            "queued order {} {} {} x{} for {}",
            order.id,
            order.side.as_str(),
            order.symbol,
            order.quantity,
            order.scheduled_date
        );
        let id = order.id;
        self.pending.push(order);
        Ok(id)
    }

    /// Fills every order scheduled for `date` at that day's open. Sells run
    /// before buys so freed cash is available the same morning. Orders for
    /// later days stay queued.
    pub fn execute_pending(
        &mut self,
        date: NaiveDate,
        day_index: usize,
        bars: &HashMap<&str, &Bar>,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let (mut due, later): (Vec<Order>, Vec<Order>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|order| order.scheduled_date <= date);
        self.pending = later;
        due.sort_by_key(|order| match order.side {
            Side::Sell => 0,
            Side::Buy => 1,
        });

        for order in due {
            let Some(bar) = bars.get(order.symbol.as_str()).copied() else {
                report.unexecutable.push(order);
                continue;
            };
            let outcome = match order.side {
                Side::Buy => self.fill_buy(&order, bar, day_index),
                Side::Sell => self.fill_sell(&order, bar, day_index),
            };
            match outcome {
                Ok((fill, closed)) => {
                    report.fills.push(fill);
                    if let Some(trade) = closed {
                        report.trades.push(trade);
                    }
                }
                Err(reason) => report.rejected.push((order, reason)),
            }
        }
        report
    }

    fn commission(&self, notional: f64) -> f64 {
        if self.config.commission_rate <= 0.0 {
            return 0.0;
        }
        (notional * self.config.commission_rate).max(self.config.min_commission)
    }

    fn fill_buy(
        &mut self,
        order: &Order,
        bar: &Bar,
        day_index: usize,
    ) -> Result<(Fill, Option<Trade>), OrderRejection> {
        if order.symbol != bar.symbol {
            return Err(OrderRejection::SymbolMismatch {
                order: order.symbol.clone(),
                bar: bar.symbol.clone(),
            });
        }

        let mut price = bar.open * (1.0 + self.config.slippage_rate);
        if let Some(limit) = order.limit_price {
            if bar.open > limit {
                if bar.low <= limit {
                    price = limit;
                } else {
                    return Err(OrderRejection::LimitNotReached {
                        limit,
                        open: bar.open,
                    });
                }
            }
            price = price.min(limit);
        }

        let notional = order.quantity as f64 * price;
        let fee = self.commission(notional);
        let required = notional + fee;
        if required > self.account.cash + PRICE_EPSILON {
            return Err(OrderRejection::InsufficientCash {
                required,
                available: self.account.cash,
            });
        }

        self.account.cash = (self.account.cash - required).max(0.0);
        let position = self
            .account
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position {
                symbol: order.symbol.clone(),
                quantity: 0,
                entry_price: price,
                entry_date: bar.date,
                entry_signal_date: order.created_date,
                entry_index: day_index,
                initial_stop_price: order.initial_stop,
                trailing_stop_price: None,
                holding_days: 0,
                entry_quantity: 0,
                entry_notional: 0.0,
                entry_fee: 0.0,
            });
        position.quantity += order.quantity;
        position.entry_quantity += order.quantity;
        position.entry_notional += notional;
        position.entry_fee += fee;
        position.entry_price = position.average_entry_price();
        self.last_prices.insert(order.symbol.clone(), price);

        debug!(
            "{} buy {} x{} @ {:.4} fee {:.2}",
            bar.date, order.symbol, order.quantity, price, fee
        );
        Ok((
            Fill {
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: Side::Buy,
                quantity: order.quantity,
                price,
                fee,
                date: bar.date,
            },
            None,
        ))
    }

    fn fill_sell(
        &mut self,
        order: &Order,
        bar: &Bar,
        day_index: usize,
    ) -> Result<(Fill, Option<Trade>), OrderRejection> {
        if order.symbol != bar.symbol {
            return Err(OrderRejection::SymbolMismatch {
                order: order.symbol.clone(),
                bar: bar.symbol.clone(),
            });
        }
        let Some(position) = self.account.positions.get(&order.symbol) else {
            return Err(OrderRejection::NoPosition(order.symbol.clone()));
        };

        let mut price = bar.open * (1.0 - self.config.slippage_rate);
        if let Some(limit) = order.limit_price {
            if bar.open < limit {
                if bar.high >= limit {
                    price = limit;
                } else {
                    return Err(OrderRejection::LimitNotReached {
                        limit,
                        open: bar.open,
                    });
                }
            }
            price = price.max(limit);
        }

        let quantity = order.quantity.min(position.quantity);
        let notional = quantity as f64 * price;
        let fee = (self.commission(notional) + notional * self.config.stamp_duty_rate).min(notional);

        let entry_price = position.average_entry_price();
        let entry_fee_share = if position.entry_quantity > 0 {
            position.entry_fee * quantity as f64 / position.entry_quantity as f64
        } else {
            0.0
        };
        let initial_stop = position.initial_stop_price;
        let r_multiple = initial_stop.and_then(|stop| {
            let risk = entry_price - stop;
            (risk > 0.0).then(|| (price - entry_price) / risk)
        });
        let trade = Trade {
            symbol: order.symbol.clone(),
            entry_date: position.entry_date,
            exit_date: bar.date,
            entry_signal_date: position.entry_signal_date,
            exit_signal_date: order.created_date,
            entry_price,
            exit_price: price,
            quantity,
            exit_reason: order.exit_reason.unwrap_or(ExitReason::ChannelBreak),
            return_rate: if entry_price > 0.0 {
                price / entry_price - 1.0
            } else {
                0.0
            },
            pnl: (price - entry_price) * quantity as f64,
            fees: entry_fee_share + fee,
            r_multiple,
            holding_days: (day_index.saturating_sub(position.entry_index) + 1) as u32,
            initial_stop,
        };

        self.account.cash += notional - fee;
        let remaining = position.quantity - quantity;
        if remaining == 0 {
            self.account.positions.remove(&order.symbol);
        } else if let Some(position) = self.account.positions.get_mut(&order.symbol) {
            let share = remaining as f64 / position.entry_quantity as f64;
            position.quantity = remaining;
            position.entry_notional *= share;
            position.entry_fee *= share;
            position.entry_quantity = remaining;
        }
        self.last_prices.insert(order.symbol.clone(), price);

        debug!(
            "{} sell {} x{} @ {:.4} ({}) pnl {:.2}",
            bar.date, order.symbol, quantity, price, trade.exit_reason, trade.pnl
        );
        Ok((
            Fill {
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: Side::Sell,
                quantity,
                price,
                fee,
                date: bar.date,
            },
            Some(trade),
        ))
    }

    /// Marks every position at today's close (or its last known price) and
    /// returns the new equity.
    pub fn mark_to_market(&mut self, bars: &HashMap<&str, &Bar>) -> f64 {
        for (symbol, position) in self.account.positions.iter_mut() {
            if let Some(bar) = bars.get(symbol.as_str()) {
                self.last_prices.insert(symbol.clone(), bar.close);
            }
            position.holding_days += 1;
        }
        self.account.equity = self.account.cash + self.exposure();
        self.account.equity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + chrono::Duration::days(n)
    }

    fn make_bar(symbol: &str, day: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            date: date(day),
            open,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    fn order(symbol: &str, side: Side, quantity: u64, reference: f64, day: i64) -> Order {
        Order {
            id: 0,
            symbol: symbol.to_string(),
            side,
            quantity,
            limit_price: None,
            initial_stop: Some(reference * 0.97),
            reference_price: reference,
            created_date: date(day - 1),
            scheduled_date: date(day),
            exit_reason: if side == Side::Sell {
                Some(ExitReason::TargetHit)
            } else {
                None
            },
        }
    }

    fn limits() -> SizingLimits {
        SizingLimits {
            max_positions: 2,
            max_position_pct: 0.5,
        }
    }

    fn day_bars<'a>(bars: &'a [Bar]) -> HashMap<&'a str, &'a Bar> {
        bars.iter().map(|bar| (bar.symbol.as_str(), bar)).collect()
    }

    #[test]
    fn submit_enforces_sizing_limits() {
        let mut broker = PortfolioBroker::new(BrokerConfig::frictionless(), 100_000.0, limits());
        assert_eq!(
            broker.submit_order(order("A", Side::Buy, 0, 10.0, 1)),
            Err(OrderRejection::InvalidQuantity)
        );
        assert!(matches!(
            broker.submit_order(order("A", Side::Buy, 6000, 10.0, 1)),
            Err(OrderRejection::PositionLimitExceeded { .. })
        ));
        assert_eq!(broker.submit_order(order("A", Side::Buy, 5000, 10.0, 1)), Ok(1));
        assert_eq!(broker.submit_order(order("B", Side::Buy, 100, 10.0, 1)), Ok(2));
        assert_eq!(
            broker.submit_order(order("C", Side::Buy, 100, 10.0, 1)),
            Err(OrderRejection::MaxPositionsReached { open: 2, max: 2 })
        );
        assert_eq!(
            broker.submit_order(order("C", Side::Sell, 100, 10.0, 1)),
            Err(OrderRejection::NoPosition("C".to_string()))
        );
    }

    #[test]
    fn buy_fills_at_open_with_slippage_and_fees() {
        let config = BrokerConfig::default();
        let mut broker = PortfolioBroker::new(config, 100_000.0, limits());
        broker
            .submit_order(order("A", Side::Buy, 1000, 10.0, 1))
            .unwrap();

        let bars = [make_bar("A", 0, 10.0, 10.2, 9.8, 10.0)];
        let report = broker.execute_pending(date(0), 0, &day_bars(&bars));
        assert!(report.fills.is_empty());
        assert_eq!(broker.pending_orders().len(), 1);

        let bars = [make_bar("A", 1, 10.0, 10.2, 9.8, 10.1)];
        let report = broker.execute_pending(date(1), 1, &day_bars(&bars));
        assert_eq!(report.fills.len(), 1);
        let fill = &report.fills[0];
        assert!((fill.price - 10.01).abs() < 1e-9);
        assert!((fill.fee - 5.0).abs() < 1e-9);
        assert!((broker.cash() - (100_000.0 - 10_010.0 - 5.0)).abs() < 1e-6);

        let equity = broker.mark_to_market(&day_bars(&bars));
        assert!((equity - (broker.cash() + 10_100.0)).abs() < 1e-6);
        assert!((broker.exposure() - 10_100.0).abs() < 1e-9);
    }

    #[test]
    fn limit_buy_above_open_fills_at_limit_or_not_at_all() {
        let mut broker = PortfolioBroker::new(BrokerConfig::frictionless(), 100_000.0, limits());
        let mut limited = order("A", Side::Buy, 100, 10.0, 1);
        limited.limit_price = Some(10.0);
        broker.submit_order(limited.clone()).unwrap();
        let gap_up = [make_bar("A", 1, 10.5, 10.8, 10.2, 10.6)];
        let report = broker.execute_pending(date(1), 1, &day_bars(&gap_up));
        assert!(matches!(
            report.rejected[0].1,
            OrderRejection::LimitNotReached { .. }
        ));
        assert_eq!(broker.open_position_count(), 0);

        broker.submit_order(limited).unwrap();
        let dips = [make_bar("A", 1, 10.5, 10.8, 9.9, 10.6)];
        let report = broker.execute_pending(date(1), 1, &day_bars(&dips));
        assert_eq!(report.fills[0].price, 10.0);
    }

    #[test]
    fn buy_rejected_when_cash_short() {
        let mut broker = PortfolioBroker::new(BrokerConfig::frictionless(), 1_000.0, SizingLimits {
            max_positions: 5,
            max_position_pct: 1.0,
        });
        broker.submit_order(order("A", Side::Buy, 100, 9.0, 1)).unwrap();
        let bars = [make_bar("A", 1, 12.0, 12.5, 11.5, 12.0)];
        let report = broker.execute_pending(date(1), 1, &day_bars(&bars));
        assert!(matches!(
            report.rejected[0].1,
            OrderRejection::InsufficientCash { .. }
        ));
        assert_eq!(broker.cash(), 1_000.0);
    }

    #[test]
    fn round_trip_produces_trade_record() {
        let mut config = BrokerConfig::default();
        config.slippage_rate = 0.0;
        let mut broker = PortfolioBroker::new(config, 100_000.0, limits());
        broker.submit_order(order("A", Side::Buy, 1000, 10.0, 1)).unwrap();
        let bars = [make_bar("A", 1, 10.0, 10.2, 9.8, 10.1)];
        broker.execute_pending(date(1), 1, &day_bars(&bars));
        broker.mark_to_market(&day_bars(&bars));

        broker.submit_order(order("A", Side::Sell, 5000, 11.0, 4)).unwrap();
        let bars = [make_bar("A", 4, 11.0, 11.2, 10.8, 11.1)];
        let report = broker.execute_pending(date(4), 4, &day_bars(&bars));
        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.quantity, 1000);
        assert_eq!(trade.holding_days, 4);
        assert_eq!(trade.exit_reason, ExitReason::TargetHit);
        assert!((trade.return_rate - 0.1).abs() < 1e-9);
        assert!((trade.pnl - 1000.0).abs() < 1e-9);
        // Entry commission 5, exit commission 5, stamp duty 11.
        assert!((trade.fees - 21.0).abs() < 1e-9);
        assert!((trade.r_multiple.unwrap() - 1.0 / 0.3).abs() < 1e-6);
        assert_eq!(broker.open_position_count(), 0);
        assert!((broker.cash() - (100_000.0 - 10_005.0 + 11_000.0 - 16.0)).abs() < 1e-6);
    }

    #[test]
    fn orders_without_bar_are_unexecutable() {
        let mut broker = PortfolioBroker::new(BrokerConfig::frictionless(), 100_000.0, limits());
        broker.submit_order(order("A", Side::Buy, 100, 10.0, 1)).unwrap();
        let bars = [make_bar("B", 1, 10.0, 10.2, 9.8, 10.1)];
        let report = broker.execute_pending(date(1), 1, &day_bars(&bars));
        assert_eq!(report.unexecutable.len(), 1);
        assert!(broker.pending_orders().is_empty());
    }
}
