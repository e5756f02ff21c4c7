use thiserror::Error;

/// The trailing channel window cannot be formed yet. Callers treat this as
/// "no signal today".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient data: need {required} bars, have {available}")]
pub struct InsufficientData {
    pub required: usize,
    pub available: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderRejection {
    #[error("order quantity must be positive")]
    InvalidQuantity,
    #[error("order symbol {order} does not match bar symbol {bar}")]
    SymbolMismatch { order: String, bar: String },
    #[error("max positions reached ({open} open, max {max})")]
    MaxPositionsReached { open: usize, max: usize },
    #[error("position notional {notional:.2} exceeds limit {limit:.2}")]
    PositionLimitExceeded { notional: f64, limit: f64 },
    #[error("insufficient cash: required {required:.2}, available {available:.2}")]
    InsufficientCash { required: f64, available: f64 },
    #[error("no open position in {0}")]
    NoPosition(String),
    #[error("limit {limit:.4} not reached (open {open:.4})")]
    LimitNotReached { limit: f64, open: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    #[error("no bars supplied")]
    NoData,
    #[error("no bars for symbol {0}")]
    NoBarsForSymbol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("run panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("unknown batch task {0}")]
    UnknownTask(String),
    #[error("batch task {0} is no longer running")]
    TaskNotRunning(String),
    #[error("batch task registry is full ({0} running tasks)")]
    CapacityExceeded(usize),
    #[error("coordinator thread of batch task {0} panicked")]
    CoordinatorPanicked(String),
}
