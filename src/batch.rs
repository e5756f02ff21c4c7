use crate::error::BatchError;
use crate::models::Trade;
use crate::performance::ProfitFactor;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const COMBO_TOP_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitIdentity {
    pub unit_index: usize,
    pub symbol: String,
    pub combo_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub total_return: f64,
    pub annualized_return: f64,
    pub max_drawdown: f64,
    pub drawdown_days: usize,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub expectancy: f64,
    pub profit_factor: ProfitFactor,
    pub win_rate: f64,
    pub trade_count: usize,
    pub final_equity: f64,
    /// Segment score statistics; `None` unless robust scoring is enabled and
    /// at least one segment ran.
    pub score_mean: Option<f64>,
    pub score_std: Option<f64>,
    pub score_robust: Option<f64>,
}

/// Outcome of one (symbol, parameter combination) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub identity: UnitIdentity,
    pub summary: UnitSummary,
    pub anomaly_count: usize,
    pub score: f64,
    /// Flat-day entry evaluations and how many of them ended without a buy.
    pub evaluated_entries: usize,
    pub rejected_entries: usize,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboStats {
    pub combo_index: usize,
    pub samples: usize,
    pub avg_return: f64,
    pub avg_win_rate: f64,
}

/// Running statistics over every unit reported so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub units_done: usize,
    pub units_failed: usize,
    pub total_trades: usize,
    pub win_rate: f64,
    pub avg_return: f64,
    pub rejection_rate: f64,
    pub evaluated_entries: usize,
    pub rejected_entries: usize,
    pub best_return: Option<f64>,
    pub worst_return: Option<f64>,
    pub combo_top: Vec<ComboStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_units: usize,
    pub done_units: usize,
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub aggregation: Aggregation,
    pub metadata: Value,
}

struct TaskState {
    task_id: String,
    status: TaskStatus,
    total_units: usize,
    done_units: usize,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
    aggregation: Aggregation,
    combos: HashMap<usize, ComboStats>,
    metadata: Value,
}

impl TaskState {
    fn ensure_running(&self) -> Result<(), BatchError> {
        if self.status.is_terminal() {
            return Err(BatchError::TaskNotRunning(self.task_id.clone()));
        }
        Ok(())
    }

    fn apply_result(&mut self, result: &UnitResult) {
        let agg = &mut self.aggregation;
        agg.units_done += 1;
        agg.total_trades += result.summary.trade_count;

        let n = agg.units_done as f64;
        agg.win_rate += (result.summary.win_rate - agg.win_rate) / n;
        agg.avg_return += (result.summary.total_return - agg.avg_return) / n;

        agg.evaluated_entries += result.evaluated_entries;
        agg.rejected_entries += result.rejected_entries;
        agg.rejection_rate = if agg.evaluated_entries > 0 {
            agg.rejected_entries as f64 / agg.evaluated_entries as f64
        } else {
            0.0
        };

        let ret = result.summary.total_return;
        agg.best_return = Some(agg.best_return.map_or(ret, |best| best.max(ret)));
        agg.worst_return = Some(agg.worst_return.map_or(ret, |worst| worst.min(ret)));

        let combo_index = result.identity.combo_index;
        let combo = self.combos.entry(combo_index).or_insert(ComboStats {
            combo_index,
            samples: 0,
            avg_return: 0.0,
            avg_win_rate: 0.0,
        });
        combo.samples += 1;
        let samples = combo.samples as f64;
        combo.avg_return += (ret - combo.avg_return) / samples;
        combo.avg_win_rate += (result.summary.win_rate - combo.avg_win_rate) / samples;

        let mut top: Vec<ComboStats> = self.combos.values().cloned().collect();
        top.sort_by(|a, b| {
            b.avg_return
                .total_cmp(&a.avg_return)
                .then(a.combo_index.cmp(&b.combo_index))
        });
        top.truncate(COMBO_TOP_LIMIT);
        agg.combo_top = top;
    }

    fn snapshot(&self) -> BatchStatus {
        BatchStatus {
            task_id: self.task_id.clone(),
            status: self.status,
            total_units: self.total_units,
            done_units: self.done_units,
            progress: if self.total_units > 0 {
                self.done_units as f64 / self.total_units as f64
            } else {
                1.0
            },
            started_at: self.started_at,
            ended_at: self.ended_at,
            cancel_requested: self.cancel_requested,
            aggregation: self.aggregation.clone(),
            metadata: self.metadata.clone(),
        }
    }

    fn finish(&mut self, status: TaskStatus) -> Result<(), BatchError> {
        self.ensure_running()?;
        self.status = status;
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

fn lock_state(state: &Mutex<TaskState>) -> MutexGuard<'_, TaskState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registry of batch tasks. Workers report into it concurrently; each task's
/// state sits behind its own lock, held only for counter updates.
pub struct BatchTaskManager {
    tasks: DashMap<String, Arc<Mutex<TaskState>>>,
    /// Serializes eviction plus insertion so concurrent creates cannot
    /// overshoot `max_tasks`.
    create_lock: Mutex<()>,
    max_tasks: usize,
    ttl: chrono::Duration,
}

impl BatchTaskManager {
    pub fn new(max_tasks: usize, ttl_seconds: u64) -> Self {
        Self {
            tasks: DashMap::new(),
            create_lock: Mutex::new(()),
            max_tasks: max_tasks.max(1),
            ttl: chrono::Duration::seconds(ttl_seconds.min(i64::MAX as u64) as i64),
        }
    }

    fn task(&self, task_id: &str) -> Result<Arc<Mutex<TaskState>>, BatchError> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BatchError::UnknownTask(task_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Terminal tasks with their end time.
    fn terminal_tasks(&self) -> Vec<(String, DateTime<Utc>)> {
        let states: Vec<Arc<Mutex<TaskState>>> =
            self.tasks.iter().map(|entry| entry.value().clone()).collect();
        states
            .iter()
            .filter_map(|state| {
                let state = lock_state(state);
                match (state.status.is_terminal(), state.ended_at) {
                    (true, Some(ended)) => Some((state.task_id.clone(), ended)),
                    _ => None,
                }
            })
            .collect()
    }

    fn evict(&self) -> Result<(), BatchError> {
        let now = Utc::now();
        let mut terminal = self.terminal_tasks();
        terminal.retain(|(task_id, ended)| {
            if now - *ended > self.ttl {
                debug!("Evicting expired batch task {}", task_id);
                self.tasks.remove(task_id);
                false
            } else {
                true
            }
        });

        if self.tasks.len() < self.max_tasks {
            return Ok(());
        }
        terminal.sort_by_key(|(_, ended)| *ended);
        match terminal.first() {
            Some((oldest, _)) => {
                debug!("Evicting oldest finished batch task {}", oldest);
                self.tasks.remove(oldest);
                Ok(())
            }
            None => Err(BatchError::CapacityExceeded(self.tasks.len())),
        }
    }

    pub fn create_task(&self, total_units: usize, metadata: Value) -> Result<String, BatchError> {
        let _creating = match self.create_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.evict()?;
        let task_id = Uuid::new_v4().to_string();
        let state = TaskState {
            task_id: task_id.clone(),
            status: TaskStatus::Running,
            total_units,
            done_units: 0,
            started_at: Utc::now(),
            ended_at: None,
            cancel_requested: false,
            aggregation: Aggregation::default(),
            combos: HashMap::new(),
            metadata,
        };
        self.tasks
            .insert(task_id.clone(), Arc::new(Mutex::new(state)));
        info!("Created batch task {} with {} units", task_id, total_units);
        Ok(task_id)
    }

    /// Sets the cooperative cancel flag. Returns false when the task had
    /// already finished.
    pub fn request_cancel(&self, task_id: &str) -> Result<bool, BatchError> {
        let task = self.task(task_id)?;
        let mut state = lock_state(&task);
        if state.status.is_terminal() {
            return Ok(false);
        }
        state.cancel_requested = true;
        info!("Cancellation requested for batch task {}", task_id);
        Ok(true)
    }

    pub fn is_cancel_requested(&self, task_id: &str) -> bool {
        self.task(task_id)
            .map(|task| lock_state(&task).cancel_requested)
            .unwrap_or(false)
    }

    pub fn report_unit_result(&self, task_id: &str, result: &UnitResult) -> Result<(), BatchError> {
        let task = self.task(task_id)?;
        let mut state = lock_state(&task);
        state.ensure_running()?;
        state.done_units = (state.done_units + 1).min(state.total_units);
        state.apply_result(result);
        Ok(())
    }

    pub fn report_unit_failure(&self, task_id: &str) -> Result<(), BatchError> {
        let task = self.task(task_id)?;
        let mut state = lock_state(&task);
        state.ensure_running()?;
        state.done_units = (state.done_units + 1).min(state.total_units);
        state.aggregation.units_failed += 1;
        Ok(())
    }

    pub fn get_status(&self, task_id: &str) -> Result<BatchStatus, BatchError> {
        let task = self.task(task_id)?;
        let state = lock_state(&task);
        Ok(state.snapshot())
    }

    pub fn mark_completed(&self, task_id: &str) -> Result<(), BatchError> {
        let task = self.task(task_id)?;
        let mut state = lock_state(&task);
        state.finish(TaskStatus::Completed)
    }

    pub fn mark_cancelled(&self, task_id: &str) -> Result<(), BatchError> {
        let task = self.task(task_id)?;
        let mut state = lock_state(&task);
        state.finish(TaskStatus::Cancelled)
    }
}
