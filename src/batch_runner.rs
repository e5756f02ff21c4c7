use crate::batch::{BatchStatus, BatchTaskManager, UnitIdentity, UnitResult, UnitSummary};
use crate::config::{BacktestConfig, BatchSettings, BrokerConfig};
use crate::data::filter_dates;
use crate::engine::{BacktestResult, EventBacktestEngine};
use crate::error::{BatchError, RunError};
use crate::models::Bar;
use crate::performance::{filter_rejection_stats, robust_score, unit_score};
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Progress and result events of one batch task, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Start {
        task_id: String,
        total_units: usize,
        symbols: Vec<String>,
        combos: usize,
        workers: usize,
    },
    ComboStart {
        task_id: String,
        combo_index: usize,
        parameters: HashMap<String, f64>,
    },
    UnitResult {
        task_id: String,
        done_units: usize,
        total_units: usize,
        result: UnitResult,
    },
    #[serde(rename = "error")]
    UnitError {
        task_id: String,
        done_units: usize,
        total_units: usize,
        identity: UnitIdentity,
        error: String,
    },
    Heartbeat {
        task_id: String,
        done_units: usize,
        total_units: usize,
        elapsed_secs: f64,
    },
    End {
        task_id: String,
        status: BatchStatus,
    },
    Cancelled {
        task_id: String,
        status: BatchStatus,
    },
}

/// The symbol × parameter grid. Units are ordered combination-major.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchJob {
    pub symbols: Vec<String>,
    pub combos: Vec<HashMap<String, f64>>,
}

impl BatchJob {
    /// Cartesian product of the value lists. An empty grid yields a single
    /// all-defaults combination.
    pub fn from_grid(symbols: Vec<String>, grid: &BTreeMap<String, Vec<f64>>) -> Self {
        let mut combos: Vec<HashMap<String, f64>> = vec![HashMap::new()];
        for (key, values) in grid {
            if values.is_empty() {
                continue;
            }
            combos = combos
                .into_iter()
                .flat_map(|combo| {
                    values.iter().map(move |value| {
                        let mut next = combo.clone();
                        next.insert(key.clone(), *value);
                        next
                    })
                })
                .collect();
        }
        Self { symbols, combos }
    }

    pub fn unit_count(&self) -> usize {
        self.symbols.len() * self.combos.len()
    }

    fn units(&self) -> Vec<BatchUnit> {
        let mut units = Vec::with_capacity(self.unit_count());
        for (combo_index, parameters) in self.combos.iter().enumerate() {
            for symbol in &self.symbols {
                units.push(BatchUnit {
                    identity: UnitIdentity {
                        unit_index: units.len(),
                        symbol: symbol.clone(),
                        combo_index,
                    },
                    parameters: parameters.clone(),
                });
            }
        }
        units
    }
}

/// Bars shared read-only by every worker.
#[derive(Debug, Clone, Default)]
pub struct BatchData {
    pub bars_by_symbol: Arc<HashMap<String, Vec<Bar>>>,
    pub index_bars: Arc<Vec<Bar>>,
}

impl BatchData {
    pub fn new(bars_by_symbol: HashMap<String, Vec<Bar>>, index_bars: Vec<Bar>) -> Self {
        Self {
            bars_by_symbol: Arc::new(bars_by_symbol),
            index_bars: Arc::new(index_bars),
        }
    }
}

#[derive(Debug, Clone)]
struct BatchUnit {
    identity: UnitIdentity,
    parameters: HashMap<String, f64>,
}

struct UnitOutcome {
    identity: UnitIdentity,
    result: Result<UnitResult, RunError>,
}

fn unit_backtest(
    bars: &[Bar],
    index_bars: &[Bar],
    parameters: &HashMap<String, f64>,
    initial_cash: f64,
) -> Result<BacktestResult, RunError> {
    let config = BacktestConfig {
        initial_cash,
        broker: BrokerConfig::batch_profile(),
        ..BacktestConfig::default()
    };
    EventBacktestEngine::new(config, parameters).run(bars, index_bars)
}

/// First and last trading day of each of `segments` slices holding an equal
/// share of the symbol's days. Needs at least two segments and two days.
fn segment_bounds(bars: &[Bar], segments: usize) -> Vec<(NaiveDate, NaiveDate)> {
    let days: Vec<NaiveDate> = bars
        .iter()
        .map(|bar| bar.date)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let n = days.len();
    if segments < 2 || n < 2 {
        return Vec::new();
    }
    (0..segments)
        .filter_map(|k| {
            let first = k * n / segments;
            let last = ((k + 1) * n / segments).checked_sub(1)?.min(n - 1);
            (first <= last).then(|| (days[first], days[last]))
        })
        .collect()
}

/// Unit scores of independent runs over each date segment. Segments whose
/// run fails are left out.
fn segment_scores(
    unit: &BatchUnit,
    bars: &[Bar],
    index_bars: &[Bar],
    settings: &BatchSettings,
) -> Vec<f64> {
    segment_bounds(bars, settings.robust_segments)
        .into_iter()
        .filter_map(|(beg, end)| {
            let segment = filter_dates(bars.to_vec(), Some(beg), Some(end));
            let segment_index = filter_dates(index_bars.to_vec(), Some(beg), Some(end));
            match unit_backtest(&segment, &segment_index, &unit.parameters, settings.initial_cash) {
                Ok(run) => Some(unit_score(&run.metrics)),
                Err(err) => {
                    debug!(
                        "Unit {} segment {} to {} skipped: {}",
                        unit.identity.unit_index, beg, end, err
                    );
                    None
                }
            }
        })
        .collect()
}

/// Runs one unit: a single-symbol backtest with the batch cost profile,
/// plus the segment re-runs when robust scoring is enabled.
fn run_unit(unit: &BatchUnit, data: &BatchData, settings: &BatchSettings) -> UnitOutcome {
    let result = match data.bars_by_symbol.get(&unit.identity.symbol) {
        Some(bars) if !bars.is_empty() => {
            unit_backtest(bars, &data.index_bars, &unit.parameters, settings.initial_cash).map(|run| {
                let robust = robust_score(&segment_scores(unit, bars, &data.index_bars, settings));
                let rejections = filter_rejection_stats(&run.signal_logs);
                let m = &run.metrics;
                UnitResult {
                    identity: unit.identity.clone(),
                    summary: UnitSummary {
                        total_return: m.total_return,
                        annualized_return: m.annualized_return,
                        max_drawdown: m.max_drawdown,
                        drawdown_days: m.drawdown.duration_days,
                        sharpe: m.sharpe,
                        sortino: m.sortino,
                        calmar: m.calmar,
                        expectancy: m.expectancy,
                        profit_factor: m.profit_factor,
                        win_rate: m.win_rate,
                        trade_count: m.trade_count,
                        final_equity: m.final_equity,
                        score_mean: robust.map(|r| r.mean),
                        score_std: robust.map(|r| r.std),
                        score_robust: robust.map(|r| r.robust),
                    },
                    anomaly_count: run.anomalies.len(),
                    score: unit_score(m),
                    evaluated_entries: rejections.evaluated,
                    rejected_entries: rejections.rejected,
                    trades: run.trades,
                }
            })
        }
        _ => Err(RunError::NoBarsForSymbol(unit.identity.symbol.clone())),
    };
    UnitOutcome {
        identity: unit.identity.clone(),
        result,
    }
}

/// Runs `run`, turning a panic into a failed outcome for `identity`.
fn run_guarded(identity: &UnitIdentity, run: impl FnOnce() -> UnitOutcome) -> UnitOutcome {
    panic::catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|payload| UnitOutcome {
        identity: identity.clone(),
        result: Err(RunError::Panicked(panic_message(payload.as_ref()))),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Executes batch tasks on a bounded worker pool and reports into a shared
/// [`BatchTaskManager`].
#[derive(Clone)]
pub struct BatchRunner {
    manager: Arc<BatchTaskManager>,
    settings: BatchSettings,
    workers: usize,
    show_progress: bool,
}

/// A batch running on its own coordinator thread.
pub struct BatchHandle {
    task_id: String,
    events: Receiver<BatchEvent>,
    coordinator: JoinHandle<Result<BatchStatus, BatchError>>,
}

impl BatchHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn events(&self) -> &Receiver<BatchEvent> {
        &self.events
    }

    /// Drains the remaining events and waits for the final status.
    pub fn wait(self) -> (Vec<BatchEvent>, Result<BatchStatus, BatchError>) {
        let events: Vec<BatchEvent> = self.events.iter().collect();
        let status = match self.coordinator.join() {
            Ok(status) => status,
            Err(_) => Err(BatchError::CoordinatorPanicked(self.task_id.clone())),
        };
        (events, status)
    }
}

impl BatchRunner {
    pub fn new(manager: Arc<BatchTaskManager>, settings: BatchSettings) -> Self {
        Self {
            manager,
            settings,
            workers: num_cpus::get().max(1),
            show_progress: false,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn manager(&self) -> &Arc<BatchTaskManager> {
        &self.manager
    }

    pub fn create_task(&self, job: &BatchJob, metadata: Value) -> Result<String, BatchError> {
        self.manager.create_task(job.unit_count(), metadata)
    }

    /// Creates a task and runs it on a background thread. Events arrive on
    /// the handle's bounded channel; the coordinator blocks while it is full.
    pub fn spawn(
        &self,
        job: BatchJob,
        data: BatchData,
        metadata: Value,
    ) -> Result<BatchHandle, BatchError> {
        let task_id = self.create_task(&job, metadata)?;
        let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let runner = self.clone();
        let id = task_id.clone();
        let coordinator = thread::spawn(move || {
            runner.run(&id, &job, &data, &mut |event: &BatchEvent| {
                // A dropped receiver only stops the stream; the task still finishes.
                let _ = event_tx.send(event.clone());
            })
        });
        Ok(BatchHandle {
            task_id,
            events: event_rx,
            coordinator,
        })
    }

    /// Runs an already created task to completion or cancellation on the
    /// calling thread, passing every event to `sink`.
    pub fn run(
        &self,
        task_id: &str,
        job: &BatchJob,
        data: &BatchData,
        sink: &mut dyn FnMut(&BatchEvent),
    ) -> Result<BatchStatus, BatchError> {
        let units = job.units();
        let total_units = units.len();
        let num_workers = self.workers.min(total_units).max(1);
        let max_in_flight = self.settings.max_in_flight.min(num_workers).max(1);
        info!(
            "Batch {}: {} units on {} worker threads ({} in flight)",
            task_id, total_units, num_workers, max_in_flight
        );
        sink(&BatchEvent::Start {
            task_id: task_id.to_string(),
            total_units,
            symbols: job.symbols.clone(),
            combos: job.combos.len(),
            workers: num_workers,
        });

        let (task_tx, task_rx) = bounded::<BatchUnit>(max_in_flight);
        let (result_tx, result_rx) = bounded::<UnitOutcome>(max_in_flight);

        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let data = data.clone();
            let settings = self.settings.clone();
            handles.push(thread::spawn(move || {
                while let Ok(unit) = task_rx.recv() {
                    let outcome =
                        run_guarded(&unit.identity, || run_unit(&unit, &data, &settings));
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(task_rx);
        drop(result_tx);

        let pb = if self.show_progress {
            ProgressBar::new(total_units as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let started = Instant::now();
        let mut last_event = Instant::now();
        let mut next_unit = 0;
        let mut in_flight = 0;
        let mut done_units = 0;
        let mut announced_combo = None;

        loop {
            while in_flight < max_in_flight && next_unit < total_units {
                if self.manager.is_cancel_requested(task_id) {
                    break;
                }
                let unit = units[next_unit].clone();
                if announced_combo != Some(unit.identity.combo_index) {
                    announced_combo = Some(unit.identity.combo_index);
                    sink(&BatchEvent::ComboStart {
                        task_id: task_id.to_string(),
                        combo_index: unit.identity.combo_index,
                        parameters: unit.parameters.clone(),
                    });
                }
                if task_tx.send(unit).is_err() {
                    warn!("Batch {}: worker pool closed before all units were sent", task_id);
                    break;
                }
                next_unit += 1;
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            match result_rx.recv_timeout(RESULT_POLL_INTERVAL) {
                Ok(outcome) => {
                    in_flight -= 1;
                    done_units += 1;
                    pb.set_position(done_units as u64);
                    last_event = Instant::now();
                    let event = self.record_outcome(task_id, outcome, done_units, total_units);
                    sink(&event);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_event.elapsed() >= HEARTBEAT_INTERVAL {
                        last_event = Instant::now();
                        sink(&BatchEvent::Heartbeat {
                            task_id: task_id.to_string(),
                            done_units,
                            total_units,
                            elapsed_secs: started.elapsed().as_secs_f64(),
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Batch {}: result channel disconnected", task_id);
                    break;
                }
            }
        }

        drop(task_tx);
        for handle in handles {
            if handle.join().is_err() {
                warn!("Batch {}: a worker thread panicked", task_id);
            }
        }

        let cancelled = self.manager.is_cancel_requested(task_id);
        if cancelled {
            self.manager.mark_cancelled(task_id)?;
            pb.abandon_with_message("Batch cancelled");
        } else {
            self.manager.mark_completed(task_id)?;
            pb.finish_with_message("Batch complete");
        }

        let status = self.manager.get_status(task_id)?;
        info!(
            "Batch {} finished as {:?}: {}/{} units, {} failed, avg return {:.4}, win rate {:.4}",
            task_id,
            status.status,
            status.done_units,
            status.total_units,
            status.aggregation.units_failed,
            status.aggregation.avg_return,
            status.aggregation.win_rate
        );
        let task_id = task_id.to_string();
        sink(&if cancelled {
            BatchEvent::Cancelled {
                task_id,
                status: status.clone(),
            }
        } else {
            BatchEvent::End {
                task_id,
                status: status.clone(),
            }
        });
        Ok(status)
    }

    fn record_outcome(
        &self,
        task_id: &str,
        outcome: UnitOutcome,
        done_units: usize,
        total_units: usize,
    ) -> BatchEvent {
        match outcome.result {
            Ok(result) => {
                if let Err(err) = self.manager.report_unit_result(task_id, &result) {
                    warn!("Batch {}: result not recorded: {}", task_id, err);
                }
                BatchEvent::UnitResult {
                    task_id: task_id.to_string(),
                    done_units,
                    total_units,
                    result,
                }
            }
            Err(err) => {
                warn!(
                    "Batch {}: unit {} ({} / combo {}) failed: {}",
                    task_id,
                    outcome.identity.unit_index,
                    outcome.identity.symbol,
                    outcome.identity.combo_index,
                    err
                );
                if let Err(report_err) = self.manager.report_unit_failure(task_id) {
                    warn!("Batch {}: failure not recorded: {}", task_id, report_err);
                }
                BatchEvent::UnitError {
                    task_id: task_id.to_string(),
                    done_units,
                    total_units,
                    identity: outcome.identity,
                    error: err.to_string(),
                }
            }
        }
    }
}
