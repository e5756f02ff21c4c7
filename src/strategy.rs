use crate::channel::{get_channel_lines, PriceSeries};
use crate::config::ChannelConfig;
use crate::error::OrderRejection;
use crate::indicators::IndexRegime;
use crate::models::*;
use crate::signals::{evaluate_entry, evaluate_exit, EntryContext, ExitContext};
use chrono::NaiveDate;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};

/// What a strategy may see of the book when it makes decisions.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioView<'a> {
    pub equity: f64,
    pub cash: f64,
    pub positions: &'a HashMap<String, Position>,
    pub lot_size: u64,
}

impl PortfolioView<'_> {
    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }

    pub fn is_held(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }
}

/// An order the strategy wants placed at the next open.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub limit_price: Option<f64>,
    pub initial_stop: Option<f64>,
    pub reference_price: f64,
    pub exit_reason: Option<ExitReason>,
}

pub trait EventStrategy {
    /// Bookkeeping after the open executions; never produces orders.
    fn on_open(&mut self, date: NaiveDate, portfolio: &PortfolioView<'_>);

    /// Exit and entry decisions at the close, executed at the next open.
    fn on_close(&mut self, date: NaiveDate, portfolio: &PortfolioView<'_>) -> Vec<OrderRequest>;

    fn on_order_rejected(&mut self, _date: NaiveDate, _symbol: &str, _reason: &OrderRejection) {}

    fn take_signal_logs(&mut self) -> Vec<SignalLog>;
}

#[derive(Debug, Clone)]
struct SymbolHistory {
    series: PriceSeries,
    index_by_date: HashMap<NaiveDate, usize>,
}

impl SymbolHistory {
    fn from_bars(bars: &[Bar]) -> Self {
        Self {
            series: PriceSeries::from_bars(bars),
            index_by_date: bars
                .iter()
                .enumerate()
                .map(|(i, bar)| (bar.date, i))
                .collect(),
        }
    }
}

pub struct ChannelStrategy {
    config: ChannelConfig,
    histories: BTreeMap<String, SymbolHistory>,
    index: IndexRegime,
    holding_days: HashMap<String, u32>,
    cooling_left: HashMap<String, u32>,
    signal_logs: Vec<SignalLog>,
    // Position of today's log per symbol, for attaching order rejections.
    todays_logs: HashMap<String, usize>,
}

impl ChannelStrategy {
    /// `bars_by_symbol` must be date-sorted without duplicate dates.
    pub fn new(
        config: ChannelConfig,
        bars_by_symbol: &BTreeMap<String, Vec<Bar>>,
        index: IndexRegime,
    ) -> Self {
        let histories = bars_by_symbol
            .iter()
            .map(|(symbol, bars)| (symbol.clone(), SymbolHistory::from_bars(bars)))
            .collect();
        Self {
            config,
            histories,
            index,
            holding_days: HashMap::new(),
            cooling_left: HashMap::new(),
            signal_logs: Vec::new(),
            todays_logs: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn cooling_left(&self, symbol: &str) -> u32 {
        self.cooling_left.get(symbol).copied().unwrap_or(0)
    }

    pub fn holding_days(&self, symbol: &str) -> u32 {
        self.holding_days.get(symbol).copied().unwrap_or(0)
    }

    fn record(&mut self, log: SignalLog) {
        let keep = self.config.capture_logs || log.final_signal != SignalAction::NoSignal;
        if keep {
            self.todays_logs
                .insert(log.symbol.clone(), self.signal_logs.len());
            self.signal_logs.push(log);
        }
    }
}

impl EventStrategy for ChannelStrategy {
    fn on_open(&mut self, date: NaiveDate, portfolio: &PortfolioView<'_>) {
        for symbol in portfolio.positions.keys() {
            *self.holding_days.entry(symbol.clone()).or_insert(0) += 1;
        }
        for (symbol, history) in &self.histories {
            if !history.index_by_date.contains_key(&date) {
                continue;
            }
            if let Some(left) = self.cooling_left.get_mut(symbol) {
                *left = left.saturating_sub(1);
            }
        }
    }

    fn on_close(&mut self, date: NaiveDate, portfolio: &PortfolioView<'_>) -> Vec<OrderRequest> {
        self.todays_logs.clear();
        let mut orders = Vec::new();
        let mut pending_buys = 0usize;
        let index_day = self.index.day(date).copied();
        let index_bear = index_day.and_then(|day| day.bear);

        let symbols: Vec<String> = self.histories.keys().cloned().collect();
        for symbol in symbols {
            let Some(history) = self.histories.get(&symbol) else {
                continue;
            };
            let Some(&i) = history.index_by_date.get(&date) else {
                continue;
            };
            let series = &history.series;
            let channel = get_channel_lines(series, i, &self.config).ok();
            let cooling_left = self.cooling_left(&symbol);

            let mut log = SignalLog {
                date,
                symbol: symbol.clone(),
                day_index: i,
                has_position: portfolio.is_held(&symbol),
                open: series.opens[i],
                high: series.highs[i],
                low: series.lows[i],
                close: series.closes[i],
                index_bear,
                cooling_left,
                channel: None,
                final_signal: SignalAction::NoSignal,
                exit_reason: None,
                order_rejection: None,
                trace: Vec::new(),
            };

            if let Some(position) = portfolio.positions.get(&symbol) {
                let ctx = ExitContext {
                    holding_days: self.holding_days(&symbol),
                    initial_stop: position.initial_stop_price,
                    index_bear,
                };
                if let Some(exit) = evaluate_exit(series, i, channel.as_ref(), &self.config, &ctx)
                {
                    debug!(
                        "{} {}: exit {} after {} days",
                        date, symbol, exit.reason, ctx.holding_days
                    );
                    orders.push(OrderRequest {
                        symbol: symbol.clone(),
                        side: Side::Sell,
                        quantity: position.quantity,
                        limit_price: None,
                        initial_stop: None,
                        reference_price: series.closes[i] * (1.0 - self.config.exit_fill_eps),
                        exit_reason: Some(exit.reason),
                    });
                    self.holding_days.insert(symbol.clone(), 0);
                    self.cooling_left
                        .insert(symbol.clone(), self.config.cooling_period);
                    log.final_signal = SignalAction::Sell;
                    log.exit_reason = Some(exit.reason);
                    log.trace.push(exit.step);
                }
                log.channel = channel;
                self.record(log);
                continue;
            }

            let Some(mut environment) = channel else {
                trace!("{} {}: channel window not ready", date, symbol);
                self.record(log);
                continue;
            };

            let ctx = EntryContext {
                symbol: &symbol,
                open_positions: portfolio.open_positions() + pending_buys,
                cooling_left,
                equity: portfolio.equity,
                lot_size: portfolio.lot_size,
                index_bear,
                index_day,
            };
            let decision = evaluate_entry(series, i, &environment, &self.config, &ctx);
            if let Some(plan) = &decision.plan {
                pending_buys += 1;
                debug!(
                    "{} {}: buy {} @ {:.4} target {:.4} stop {:.4}",
                    date, symbol, plan.quantity, plan.entry_price, plan.target_price, plan.initial_stop
                );
                orders.push(OrderRequest {
                    symbol: symbol.clone(),
                    side: Side::Buy,
                    quantity: plan.quantity,
                    limit_price: plan.limit_price,
                    initial_stop: Some(plan.initial_stop),
                    reference_price: plan.entry_price,
                    exit_reason: None,
                });
            } else if let Some(step) = decision.first_failure() {
                trace!("{} {}: rejected at {}", date, symbol, step.step_name);
            }

            log.final_signal = decision.signal;
            environment.decision_trace = decision.trace.clone();
            log.trace = decision.trace;
            log.channel = Some(environment);
            self.record(log);
        }

        orders
    }

    fn on_order_rejected(&mut self, _date: NaiveDate, symbol: &str, reason: &OrderRejection) {
        if let Some(&position) = self.todays_logs.get(symbol) {
            if let Some(log) = self.signal_logs.get_mut(position) {
                log.order_rejection = Some(reason.to_string());
                if log.final_signal == SignalAction::Buy {
                    log.final_signal = SignalAction::NoSignal;
                }
            }
        }
    }

    fn take_signal_logs(&mut self) -> Vec<SignalLog> {
        self.todays_logs.clear();
        std::mem::take(&mut self.signal_logs)
    }
}
