use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    /// Open and close may sit outside [low, high]; some vendors report them that way.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(anyhow!("Bar on {} has an empty symbol", self.date));
        }
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(anyhow!(
                "Bar {} {} has non-positive prices (o={}, h={}, l={}, c={})",
                self.symbol,
                self.date,
                self.open,
                self.high,
                self.low,
                self.close
            ));
        }
        if self.low > self.high {
            return Err(anyhow!(
                "Bar {} {} has low {} above high {}",
                self.symbol,
                self.date,
                self.low,
                self.high
            ));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(anyhow!(
                "Bar {} {} has invalid volume {}",
                self.symbol,
                self.date,
                self.volume
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    PanicStopLoss,
    TimeExit,
    ChannelBreak,
    IndexBear,
    TargetHit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "StopLoss",
            ExitReason::PanicStopLoss => "PanicStopLoss",
            ExitReason::TimeExit => "TimeExit",
            ExitReason::ChannelBreak => "ChannelBreak",
            ExitReason::IndexBear => "IndexBear",
            ExitReason::TargetHit => "TargetHit",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instruction created at the close of one trading day and executed at the
/// open of the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub limit_price: Option<f64>,
    pub initial_stop: Option<f64>,
    /// Price the order was sized against (signal close plus fill epsilon).
    pub reference_price: f64,
    pub created_date: NaiveDate,
    pub scheduled_date: NaiveDate,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: f64,
    pub fee: f64,
    pub date: NaiveDate,
}

impl Fill {
    pub fn notional(&self) -> f64 {
        self.quantity as f64 * self.price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: u64,
    pub entry_price: f64,
    /// Execution date of the first buy fill.
    pub entry_date: NaiveDate,
    /// Close on which the buy order was created.
    pub entry_signal_date: NaiveDate,
    pub entry_index: usize,
    pub initial_stop_price: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub holding_days: u32,
    pub entry_quantity: u64,
    pub entry_notional: f64,
    pub entry_fee: f64,
}

impl Position {
    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity as f64 * price
    }

    /// Average entry price over every buy fill of the current holding period.
    pub fn average_entry_price(&self) -> f64 {
        if self.entry_quantity > 0 {
            self.entry_notional / self.entry_quantity as f64
        } else {
            self.entry_price
        }
    }
}

/// A closed round trip. `entry_date`/`exit_date` are fill dates; the signal
/// dates are the closes that created the orders, one trading day earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub entry_signal_date: NaiveDate,
    pub exit_signal_date: NaiveDate,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: u64,
    pub exit_reason: ExitReason,
    pub return_rate: f64,
    pub pnl: f64,
    pub fees: f64,
    pub r_multiple: Option<f64>,
    pub holding_days: u32,
    pub initial_stop: Option<f64>,
}

impl Trade {
    pub fn is_winner(&self) -> bool {
        self.return_rate > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationPoint {
    pub date: NaiveDate,
    pub equity: f64,
    pub cash: f64,
    pub exposure: f64,
    pub utilization: f64,
    pub open_positions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    InsufficientHistory,
    LongSuspension,
    AbnormalGap,
    MissingBar,
    DuplicateBar,
    InvalidBar,
    UnexecutableOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAnomaly {
    pub symbol: String,
    pub date: Option<NaiveDate>,
    pub kind: AnomalyKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    Passed,
    Failed,
    NotApplicable,
}

impl TraceOutcome {
    pub fn from_check(passed: bool) -> Self {
        if passed {
            TraceOutcome::Passed
        } else {
            TraceOutcome::Failed
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TraceOutcome::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTraceStep {
    pub step_name: String,
    pub check_description: String,
    pub threshold: String,
    pub actual_value: String,
    pub passed: TraceOutcome,
    pub reason: String,
}

/// Channel state for one (symbol, day). Rebuilt from scratch every day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEnvironment {
    pub mid: f64,
    pub lower: f64,
    pub upper: f64,
    pub slope_norm: f64,
    pub vol_ratio: f64,
    /// Absolute bar index of the significant pivot, when one qualified.
    pub pivot_index: Option<usize>,
    /// Absolute bar index the channel is anchored to (pivot or window minimum).
    pub anchor_index: usize,
    pub pivot_price: f64,
    pub pivot_is_significant: bool,
    pub window_start: usize,
    pub decision_trace: Vec<DecisionTraceStep>,
}

impl ChannelEnvironment {
    pub fn channel_height(&self) -> f64 {
        if self.mid > 0.0 {
            (self.upper - self.lower) / self.mid
        } else {
            0.0
        }
    }

    pub fn mid_room(&self) -> f64 {
        if self.mid > 0.0 {
            (self.mid - self.lower) / self.mid
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Buy,
    Sell,
    NoSignal,
}

/// One (symbol, day) evaluation, kept whether or not an order resulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalLog {
    pub date: NaiveDate,
    pub symbol: String,
    pub day_index: usize,
    pub has_position: bool,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub index_bear: Option<bool>,
    pub cooling_left: u32,
    pub channel: Option<ChannelEnvironment>,
    pub final_signal: SignalAction,
    pub exit_reason: Option<ExitReason>,
    pub order_rejection: Option<String>,
    pub trace: Vec<DecisionTraceStep>,
}

impl SignalLog {
    pub fn first_failed_step(&self) -> Option<&DecisionTraceStep> {
        self.trace.iter().find(|step| step.passed.is_failed())
    }

    /// Flat-day evaluation that ended without a buy.
    pub fn is_rejected_entry(&self) -> bool {
        !self.has_position && self.final_signal == SignalAction::NoSignal
    }
}
