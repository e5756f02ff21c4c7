use crate::broker::{PortfolioBroker, SizingLimits};
use crate::config::{BacktestConfig, ChannelConfig, ResolvedConfig};
use crate::error::RunError;
use crate::indicators::IndexRegime;
use crate::models::*;
use crate::param_utils::ParamSubstitution;
use crate::performance::{Metrics, PerformanceCalculator};
use crate::strategy::{ChannelStrategy, EventStrategy, PortfolioView};
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const MIN_TRADING_DAYS: usize = 20;
const LONG_SUSPENSION_DAYS: i64 = 15;
const SUSPENSION_WARN_DAYS: i64 = 7;
const ABNORMAL_GAP_RATIO: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Initialized,
    Running,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub trades: Vec<Trade>,
    pub fills: Vec<Fill>,
    pub equity_curve: Vec<EquityPoint>,
    pub benchmark_curve: Vec<EquityPoint>,
    pub utilization: Vec<UtilizationPoint>,
    pub avg_utilization: f64,
    pub max_utilization: f64,
    pub metrics: Metrics,
    pub signal_logs: Vec<SignalLog>,
    pub anomalies: Vec<DataAnomaly>,
    pub substitutions: Vec<ParamSubstitution>,
    pub final_cash: f64,
    pub final_positions: Vec<Position>,
    pub config: ChannelConfig,
}

impl BacktestResult {
    pub fn final_equity(&self) -> f64 {
        self.equity_curve
            .last()
            .map(|point| point.equity)
            .unwrap_or(self.final_cash)
    }
}

/// One simulation run. Construct, call `run` once, read the result.
pub struct EventBacktestEngine {
    config: BacktestConfig,
    resolved: ResolvedConfig,
    state: RunState,
}

impl EventBacktestEngine {
    pub fn new(config: BacktestConfig, parameters: &HashMap<String, f64>) -> Self {
        Self::with_resolved(config, ChannelConfig::from_parameters(parameters))
    }

    pub fn with_resolved(config: BacktestConfig, resolved: ResolvedConfig) -> Self {
        Self {
            config,
            resolved,
            state: RunState::Initialized,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn channel_config(&self) -> &ChannelConfig {
        &self.resolved.config
    }

    /// Runs the day loop over every symbol in `bars`. `index_bars` may be
    /// empty, in which case index gates and the benchmark curve are skipped.
    pub fn run(&mut self, bars: &[Bar], index_bars: &[Bar]) -> Result<BacktestResult, RunError> {
        if self.state != RunState::Initialized {
            return Err(RunError::Config(format!(
                "engine already used (state {:?})",
                self.state
            )));
        }
        self.state = RunState::Running;
        match self.run_inner(bars, index_bars) {
            Ok(result) => {
                self.state = RunState::Completed;
                Ok(result)
            }
            Err(err) => {
                warn!("Backtest run failed: {}", err);
                self.state = RunState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    fn run_inner(&self, bars: &[Bar], index_bars: &[Bar]) -> Result<BacktestResult, RunError> {
        self.config
            .validate()
            .map_err(|err| RunError::Config(err.to_string()))?;
        let bars = clip_to_end(bars, self.config.end_date);
        let index_bars = clip_to_end(index_bars, self.config.end_date);
        let (bars, index_bars) = (&*bars, &*index_bars);
        if bars.is_empty() {
            return Err(RunError::NoData);
        }

        let channel = self.resolved.config.clone();
        for substitution in &self.resolved.substitutions {
            debug!(
                "Parameter {} substituted: {} -> {} ({:?})",
                substitution.key, substitution.raw, substitution.applied, substitution.reason
            );
        }

        let mut anomalies = Vec::new();
        let by_symbol = group_bars(bars, &mut anomalies);
        if by_symbol.is_empty() {
            return Err(RunError::NoData);
        }
        for (symbol, symbol_bars) in &by_symbol {
            validate_history(symbol, symbol_bars, &mut anomalies);
        }

        let calendar: Vec<NaiveDate> = by_symbol
            .values()
            .flat_map(|symbol_bars| symbol_bars.iter().map(|bar| bar.date))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        flag_missing_bars(&by_symbol, &calendar, &mut anomalies);

        let mut day_bars: HashMap<NaiveDate, HashMap<&str, &Bar>> = HashMap::new();
        for symbol_bars in by_symbol.values() {
            for bar in symbol_bars {
                day_bars
                    .entry(bar.date)
                    .or_default()
                    .insert(bar.symbol.as_str(), bar);
            }
        }

        let index_regime = IndexRegime::from_bars(index_bars, channel.index_trend_ma_period);
        let index_closes: HashMap<NaiveDate, f64> =
            index_bars.iter().map(|bar| (bar.date, bar.close)).collect();

        let start_index = self
            .config
            .start_date
            .map(|start| calendar.partition_point(|date| *date < start))
            .unwrap_or(0);

        info!(
            "Backtest: {} symbols, {} trading days ({} to {}), initial cash {:.2}",
            by_symbol.len(),
            calendar.len(),
            calendar[0],
            calendar[calendar.len() - 1],
            self.config.initial_cash
        );

        let mut strategy = ChannelStrategy::new(channel.clone(), &by_symbol, index_regime);
        let mut broker = PortfolioBroker::new(
            self.config.broker.clone(),
            self.config.initial_cash,
            SizingLimits {
                max_positions: channel.max_positions,
                max_position_pct: channel.max_position_pct,
            },
        );

        let empty_day = HashMap::new();
        let mut trades = Vec::new();
        let mut fills = Vec::new();
        let mut equity_curve = Vec::new();
        let mut benchmark_curve = Vec::new();
        let mut utilization = Vec::new();
        let mut benchmark_base: Option<f64> = None;
        let mut last_benchmark: Option<f64> = None;

        for (day_index, &date) in calendar.iter().enumerate().skip(start_index) {
            let today = day_bars.get(&date).unwrap_or(&empty_day);

            let report = broker.execute_pending(date, day_index, today);
            for (order, reason) in &report.rejected {
                warn!(
                    "{} {} {} x{} rejected at execution: {}",
                    date,
                    order.side.as_str(),
                    order.symbol,
                    order.quantity,
                    reason
                );
            }
            for order in report.unexecutable {
                warn!(
                    "{} {} has no bar; dropping {} order {}",
                    date,
                    order.symbol,
                    order.side.as_str(),
                    order.id
                );
                anomalies.push(DataAnomaly {
                    symbol: order.symbol.clone(),
                    date: Some(date),
                    kind: AnomalyKind::UnexecutableOrder,
                    detail: format!("{} order {} dropped", order.side.as_str(), order.id),
                });
            }
            fills.extend(report.fills);
            trades.extend(report.trades);

            strategy.on_open(
                date,
                &PortfolioView {
                    equity: broker.equity(),
                    cash: broker.cash(),
                    positions: broker.positions(),
                    lot_size: broker.lot_size(),
                },
            );

            let equity = broker.mark_to_market(today);
            let exposure = broker.exposure();
            equity_curve.push(EquityPoint { date, equity });
            utilization.push(UtilizationPoint {
                date,
                equity,
                cash: broker.cash(),
                exposure,
                utilization: if equity > 0.0 { exposure / equity } else { 0.0 },
                open_positions: broker.open_position_count(),
            });

            if let Some(&close) = index_closes.get(&date) {
                let base = *benchmark_base.get_or_insert(close);
                if base > 0.0 {
                    last_benchmark = Some(self.config.initial_cash * close / base);
                }
            }
            if let Some(value) = last_benchmark {
                benchmark_curve.push(EquityPoint { date, equity: value });
            }

            let requests = strategy.on_close(
                date,
                &PortfolioView {
                    equity,
                    cash: broker.cash(),
                    positions: broker.positions(),
                    lot_size: broker.lot_size(),
                },
            );
            let Some(&next_date) = calendar.get(day_index + 1) else {
                if !requests.is_empty() {
                    debug!(
                        "{}: dropping {} orders created on the last day",
                        date,
                        requests.len()
                    );
                }
                continue;
            };
            for request in requests {
                let order = Order {
                    id: 0,
                    symbol: request.symbol,
                    side: request.side,
                    quantity: request.quantity,
                    limit_price: request.limit_price,
                    initial_stop: request.initial_stop,
                    reference_price: request.reference_price,
                    created_date: date,
                    scheduled_date: next_date,
                    exit_reason: request.exit_reason,
                };
                let symbol = order.symbol.clone();
                if let Err(reason) = broker.submit_order(order) {
                    warn!("{} {} order rejected: {}", date, symbol, reason);
                    strategy.on_order_rejected(date, &symbol, &reason);
                }
            }
        }

        let signal_logs = strategy.take_signal_logs();
        let metrics = PerformanceCalculator::compute(&equity_curve, &trades);
        let (avg_utilization, max_utilization) = summarize_utilization(&utilization);
        let mut final_positions: Vec<Position> = broker.positions().values().cloned().collect();
        final_positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        info!(
            "Backtest finished: {} trades, total return {:.2}%, max drawdown {:.2}%, {} anomalies",
            trades.len(),
            metrics.total_return * 100.0,
            metrics.max_drawdown * 100.0,
            anomalies.len()
        );

        Ok(BacktestResult {
            trades,
            fills,
            equity_curve,
            benchmark_curve,
            utilization,
            avg_utilization,
            max_utilization,
            metrics,
            signal_logs,
            anomalies,
            substitutions: self.resolved.substitutions.clone(),
            final_cash: broker.cash(),
            final_positions,
            config: channel,
        })
    }
}

fn clip_to_end(bars: &[Bar], end: Option<NaiveDate>) -> Cow<'_, [Bar]> {
    match end {
        Some(end) if bars.iter().any(|bar| bar.date > end) => {
            Cow::Owned(crate::data::filter_dates(bars.to_vec(), None, Some(end)))
        }
        _ => Cow::Borrowed(bars),
    }
}

/// Groups bars by symbol, date-sorted. Invalid bars are dropped and
/// duplicate dates keep the last bar; both are recorded as anomalies.
fn group_bars(bars: &[Bar], anomalies: &mut Vec<DataAnomaly>) -> BTreeMap<String, Vec<Bar>> {
    let mut by_symbol: BTreeMap<String, BTreeMap<NaiveDate, Bar>> = BTreeMap::new();
    for bar in bars {
        if let Err(err) = bar.validate() {
            warn!("Skipping invalid bar: {}", err);
            anomalies.push(DataAnomaly {
                symbol: bar.symbol.clone(),
                date: Some(bar.date),
                kind: AnomalyKind::InvalidBar,
                detail: err.to_string(),
            });
            continue;
        }
        let previous = by_symbol
            .entry(bar.symbol.clone())
            .or_default()
            .insert(bar.date, bar.clone());
        if previous.is_some() {
            warn!("{} has duplicate bars on {}", bar.symbol, bar.date);
            anomalies.push(DataAnomaly {
                symbol: bar.symbol.clone(),
                date: Some(bar.date),
                kind: AnomalyKind::DuplicateBar,
                detail: "duplicate date, keeping the last bar".to_string(),
            });
        }
    }
    by_symbol
        .into_iter()
        .map(|(symbol, dated)| (symbol, dated.into_values().collect()))
        .collect()
}

fn validate_history(symbol: &str, bars: &[Bar], anomalies: &mut Vec<DataAnomaly>) {
    if bars.len() < MIN_TRADING_DAYS {
        warn!(
            "{} has only {} bars (minimum {})",
            symbol,
            bars.len(),
            MIN_TRADING_DAYS
        );
        anomalies.push(DataAnomaly {
            symbol: symbol.to_string(),
            date: None,
            kind: AnomalyKind::InsufficientHistory,
            detail: format!("{} bars, minimum {}", bars.len(), MIN_TRADING_DAYS),
        });
    }

    for pair in bars.windows(2) {
        let (prev, bar) = (&pair[0], &pair[1]);
        let gap_days = (bar.date - prev.date).num_days();
        if gap_days > SUSPENSION_WARN_DAYS {
            warn!(
                "{} has a {} day gap between {} and {}",
                symbol, gap_days, prev.date, bar.date
            );
        }
        if gap_days > LONG_SUSPENSION_DAYS {
            anomalies.push(DataAnomaly {
                symbol: symbol.to_string(),
                date: Some(bar.date),
                kind: AnomalyKind::LongSuspension,
                detail: format!("{} calendar days since {}", gap_days, prev.date),
            });
        }

        if prev.close > 0.0 {
            let gap = bar.open / prev.close - 1.0;
            if gap.abs() > ABNORMAL_GAP_RATIO {
                warn!(
                    "{} opened {:.1}% away from the previous close on {}",
                    symbol,
                    gap * 100.0,
                    bar.date
                );
                anomalies.push(DataAnomaly {
                    symbol: symbol.to_string(),
                    date: Some(bar.date),
                    kind: AnomalyKind::AbnormalGap,
                    detail: format!("open/prev_close - 1 = {:.4}", gap),
                });
            }
        }
    }
}

/// Calendar days inside a symbol's own date range that have no bar for it.
fn flag_missing_bars(
    by_symbol: &BTreeMap<String, Vec<Bar>>,
    calendar: &[NaiveDate],
    anomalies: &mut Vec<DataAnomaly>,
) {
    for (symbol, bars) in by_symbol {
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            continue;
        };
        let start = calendar.partition_point(|date| *date < first.date);
        let end = calendar.partition_point(|date| *date <= last.date);
        let mut cursor = 0;
        let mut missing = 0;
        for &date in &calendar[start..end] {
            while cursor < bars.len() && bars[cursor].date < date {
                cursor += 1;
            }
            if cursor < bars.len() && bars[cursor].date == date {
                continue;
            }
            missing += 1;
            anomalies.push(DataAnomaly {
                symbol: symbol.clone(),
                date: Some(date),
                kind: AnomalyKind::MissingBar,
                detail: "no bar on a trading day".to_string(),
            });
        }
        if missing > 0 {
            warn!("{} is missing {} bars inside its date range", symbol, missing);
        }
    }
}

fn summarize_utilization(points: &[UtilizationPoint]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let sum: f64 = points.iter().map(|point| point.utilization).sum();
    let max = points
        .iter()
        .map(|point| point.utilization)
        .fold(0.0, f64::max);
    (sum / points.len() as f64, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(n)
    }

    fn make_bar(symbol: &str, day: i64, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            date: date(day),
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 1_000.0,
        }
    }

    fn flat_bars(symbol: &str, days: i64) -> Vec<Bar> {
        (0..days).map(|day| make_bar(symbol, day, 10.0)).collect()
    }

    #[test]
    fn empty_input_fails_the_run() {
        let mut engine = EventBacktestEngine::new(BacktestConfig::default(), &HashMap::new());
        assert_eq!(engine.run(&[], &[]), Err(RunError::NoData));
        assert!(matches!(engine.state(), RunState::Failed(_)));
    }

    #[test]
    fn engine_runs_once() {
        let mut engine = EventBacktestEngine::new(BacktestConfig::default(), &HashMap::new());
        let bars = flat_bars("A", 30);
        assert!(engine.run(&bars, &[]).is_ok());
        assert_eq!(engine.state(), &RunState::Completed);
        assert!(matches!(engine.run(&bars, &[]), Err(RunError::Config(_))));
    }

    #[test]
    fn invalid_broker_config_fails() {
        let mut config = BacktestConfig::default();
        config.initial_cash = 0.0;
        let mut engine = EventBacktestEngine::new(config, &HashMap::new());
        assert!(matches!(
            engine.run(&flat_bars("A", 30), &[]),
            Err(RunError::Config(_))
        ));
    }

    #[test]
    fn flat_market_keeps_equity_and_logs_every_day() {
        let mut engine = EventBacktestEngine::new(BacktestConfig::default(), &HashMap::new());
        let result = engine.run(&flat_bars("A", 30), &[]).unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.equity_curve.len(), 30);
        assert_eq!(result.signal_logs.len(), 30);
        assert!(result
            .equity_curve
            .iter()
            .all(|point| (point.equity - 1_000_000.0).abs() < 1e-9));
        assert!(result.benchmark_curve.is_empty());
        assert_eq!(result.max_utilization, 0.0);
    }

    #[test]
    fn data_anomalies_are_recorded_not_fatal() {
        let mut bars = flat_bars("A", 30);
        bars.remove(12);
        bars[20].open = 14.0;
        bars.push(make_bar("A", 3, 10.0));
        let mut short = flat_bars("B", 13);
        short.push(make_bar("B", 40, 10.0));

        let mut all = bars;
        all.extend(short);
        let mut engine = EventBacktestEngine::new(BacktestConfig::default(), &HashMap::new());
        let result = engine.run(&all, &[]).unwrap();

        let kinds: Vec<AnomalyKind> = result.anomalies.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AnomalyKind::DuplicateBar));
        assert!(kinds.contains(&AnomalyKind::AbnormalGap));
        assert!(kinds.contains(&AnomalyKind::InsufficientHistory));
        assert!(kinds.contains(&AnomalyKind::LongSuspension));
        let missing: Vec<&DataAnomaly> = result
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::MissingBar)
            .collect();
        // A lacks day 12; B lacks days 13..=29 inside its own range.
        assert!(missing.iter().any(|a| a.symbol == "A" && a.date == Some(date(12))));
        assert_eq!(missing.iter().filter(|a| a.symbol == "B").count(), 17);
    }

    #[test]
    fn benchmark_carries_forward_over_index_gaps() {
        let bars = flat_bars("A", 25);
        let mut index: Vec<Bar> = (0..25)
            .map(|day| make_bar("IDX", day, 100.0 + day as f64))
            .collect();
        index.remove(5);
        let mut engine = EventBacktestEngine::new(BacktestConfig::default(), &HashMap::new());
        let result = engine.run(&bars, &index).unwrap();
        assert_eq!(result.benchmark_curve.len(), 25);
        assert_eq!(result.benchmark_curve[5].equity, result.benchmark_curve[4].equity);
        assert!((result.benchmark_curve[24].equity - 1_000_000.0 * 124.0 / 100.0).abs() < 1e-6);
    }

    #[test]
    fn end_date_drops_later_bars() {
        let mut config = BacktestConfig::default();
        config.end_date = Some(date(19));
        let mut engine = EventBacktestEngine::new(config, &HashMap::new());
        let result = engine
            .run(&flat_bars("A", 30), &flat_bars("000300.SH", 30))
            .unwrap();
        assert_eq!(result.equity_curve.len(), 20);
        assert_eq!(result.equity_curve.last().map(|p| p.date), Some(date(19)));
        assert!(result.benchmark_curve.iter().all(|p| p.date <= date(19)));

        let mut config = BacktestConfig::default();
        config.end_date = Some(date(-1));
        let mut engine = EventBacktestEngine::new(config, &HashMap::new());
        assert_eq!(engine.run(&flat_bars("A", 30), &[]), Err(RunError::NoData));
    }

    #[test]
    fn start_date_skips_early_days() {
        let mut config = BacktestConfig::default();
        config.start_date = Some(date(10));
        let mut engine = EventBacktestEngine::new(config, &HashMap::new());
        let result = engine.run(&flat_bars("A", 30), &[]).unwrap();
        assert_eq!(result.equity_curve.len(), 20);
        assert_eq!(result.equity_curve[0].date, date(10));
    }
}
