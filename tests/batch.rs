use channel_backtest::batch::{BatchTaskManager, TaskStatus};
use channel_backtest::batch_runner::{BatchData, BatchEvent, BatchJob, BatchRunner};
use channel_backtest::config::BatchSettings;
use channel_backtest::models::Bar;
use chrono::{Duration, NaiveDate};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Once};

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn date(n: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
}

fn make_bar(symbol: &str, day: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        date: date(day),
        open,
        high,
        low,
        close,
        volume: 1000.0,
    }
}

fn pivot_series(symbol: &str) -> Vec<Bar> {
    let mut bars = Vec::new();
    for day in 0..=10 {
        let low = 10.0 - 0.05 * day as f64;
        bars.push(make_bar(symbol, day, low + 0.1, low + 0.15, low, low + 0.08));
    }
    bars.push(make_bar(symbol, 11, 9.60, 9.75, 9.56, 9.70));
    bars.push(make_bar(symbol, 12, 9.70, 9.78, 9.60, 9.72));
    for day in 13..30 {
        let base = 9.72 + 0.02 * (day - 12) as f64;
        let open = if day == 13 { 9.72 } else { base };
        bars.push(make_bar(symbol, day, open, base + 0.06, base - 0.05, base + 0.01));
    }
    bars
}

fn random_walk(seed: u64, symbol: &str, days: i64) -> Vec<Bar> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut close = 30.0;
    (0..days)
        .map(|day| {
            let open = close * (1.0 + (rng.f64() - 0.5) * 0.01);
            close = (close * (1.0 + (rng.f64() - 0.5) * 0.06)).max(1.0);
            let high = open.max(close) * (1.0 + rng.f64() * 0.01);
            let low = open.min(close) * (1.0 - rng.f64() * 0.01);
            make_bar(symbol, day, open, high, low, close)
        })
        .collect()
}

fn combo(cooling_period: f64, buy_touch_eps: f64) -> HashMap<String, f64> {
    [
        ("pivot_k", 1.0),
        ("channel_period", 10.0),
        ("pivot_confirm_days", 3.0),
        ("require_index_condition", 0.0),
        ("index_bear_exit", 0.0),
        ("slope_abs_max", 0.05),
        ("min_channel_height", 0.02),
        ("min_mid_room", 0.01),
        ("vol_shrink_threshold", 0.0),
        ("max_position_pct", 0.5),
        ("cooling_period", cooling_period),
        ("buy_touch_eps", buy_touch_eps),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), *v))
    .collect()
}

fn universe() -> BatchData {
    let mut bars = HashMap::new();
    bars.insert("AAA".to_string(), pivot_series("AAA"));
    bars.insert("BBB".to_string(), random_walk(17, "BBB", 120));
    BatchData::new(bars, Vec::new())
}

fn runner(workers: usize, max_in_flight: usize) -> BatchRunner {
    let settings = BatchSettings {
        max_in_flight,
        ..BatchSettings::default()
    };
    let manager = Arc::new(BatchTaskManager::new(settings.max_tasks, settings.task_ttl_seconds));
    BatchRunner::new(manager, settings).with_workers(workers)
}

#[test]
fn batch_reports_every_unit_and_aggregates() {
    ensure_test_env();
    let job = BatchJob {
        symbols: vec!["AAA".to_string(), "BBB".to_string()],
        combos: vec![combo(30.0, 0.05), combo(5.0, 0.1)],
    };
    let runner = runner(3, 4);
    let handle = runner
        .spawn(job, universe(), json!({ "source": "batch test" }))
        .unwrap();
    let task_id = handle.task_id().to_string();
    let (events, status) = handle.wait();
    let status = status.unwrap();

    assert!(matches!(events.first(), Some(BatchEvent::Start { total_units: 4, .. })));
    assert!(matches!(events.last(), Some(BatchEvent::End { .. })));

    let results: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            BatchEvent::UnitResult { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 4);
    assert!(!events.iter().any(|event| matches!(event, BatchEvent::UnitError { .. })));

    let identities: BTreeSet<(String, usize)> = results
        .iter()
        .map(|result| (result.identity.symbol.clone(), result.identity.combo_index))
        .collect();
    assert_eq!(identities.len(), 4);

    for result in &results {
        assert_eq!(result.summary.trade_count, result.trades.len());
        assert!(result
            .trades
            .iter()
            .all(|trade| trade.symbol == result.identity.symbol));
        let expected = if result.trades.is_empty() {
            0.0
        } else {
            result.trades.iter().filter(|trade| trade.is_winner()).count() as f64
                / result.trades.len() as f64
        };
        assert!((result.summary.win_rate - expected).abs() < 1e-12);
    }

    let mean_win_rate: f64 =
        results.iter().map(|result| result.summary.win_rate).sum::<f64>() / 4.0;
    let mean_return: f64 =
        results.iter().map(|result| result.summary.total_return).sum::<f64>() / 4.0;
    assert_eq!(status.task_id, task_id);
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.done_units, 4);
    assert!((status.progress - 1.0).abs() < 1e-12);
    assert!(status.ended_at.is_some());
    assert_eq!(status.metadata["source"], "batch test");
    assert_eq!(status.aggregation.units_done, 4);
    assert!((status.aggregation.win_rate - mean_win_rate).abs() < 1e-9);
    assert!((status.aggregation.avg_return - mean_return).abs() < 1e-9);
    assert_eq!(
        status.aggregation.total_trades,
        results.iter().map(|result| result.trades.len()).sum::<usize>()
    );
    assert_eq!(status.aggregation.combo_top.len(), 2);

    let stored = runner.manager().get_status(&task_id).unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
}

#[test]
fn cancel_stops_submitting_new_units() {
    ensure_test_env();
    let job = BatchJob {
        symbols: vec!["AAA".to_string(), "BBB".to_string()],
        combos: vec![combo(30.0, 0.05), combo(5.0, 0.1), combo(10.0, 0.08)],
    };
    let runner = runner(1, 1);
    let task_id = runner.create_task(&job, json!({})).unwrap();
    let manager = runner.manager().clone();

    let mut events = Vec::new();
    let status = runner
        .run(&task_id, &job, &universe(), &mut |event: &BatchEvent| {
            if matches!(event, BatchEvent::UnitResult { .. }) {
                let _ = manager.request_cancel(&task_id);
            }
            events.push(event.clone());
        })
        .unwrap();

    assert_eq!(status.status, TaskStatus::Cancelled);
    assert!(status.cancel_requested);
    assert_eq!(status.total_units, 6);
    assert_eq!(status.done_units, 1);
    assert!(matches!(events.last(), Some(BatchEvent::Cancelled { .. })));
    let reported = events
        .iter()
        .filter(|event| matches!(event, BatchEvent::UnitResult { .. }))
        .count();
    assert_eq!(reported, 1);

    // Terminal tasks accept no further cancellation.
    assert_eq!(runner.manager().request_cancel(&task_id), Ok(false));
}

#[test]
fn cancel_lets_in_flight_units_finish() {
    ensure_test_env();
    let job = BatchJob {
        symbols: vec!["AAA".to_string(), "BBB".to_string()],
        combos: vec![combo(30.0, 0.05), combo(5.0, 0.1), combo(10.0, 0.08)],
    };
    // Three workers with three slots: the first window holds three units, so
    // three are in flight when the first result arrives.
    let runner = runner(3, 3);
    let task_id = runner.create_task(&job, json!({})).unwrap();
    let manager = runner.manager().clone();

    let mut events = Vec::new();
    let status = runner
        .run(&task_id, &job, &universe(), &mut |event: &BatchEvent| {
            if matches!(event, BatchEvent::UnitResult { .. }) {
                let _ = manager.request_cancel(&task_id);
            }
            events.push(event.clone());
        })
        .unwrap();

    assert!(matches!(events.first(), Some(BatchEvent::Start { workers: 3, .. })));
    let reported = events
        .iter()
        .filter(|event| matches!(event, BatchEvent::UnitResult { .. }))
        .count();
    assert_eq!(reported, 3);
    assert_eq!(status.status, TaskStatus::Cancelled);
    assert_eq!(status.total_units, 6);
    assert_eq!(status.done_units, reported);
    assert!(status.done_units < status.total_units);
    assert_eq!(status.aggregation.units_done, 3);
    assert!(!events
        .iter()
        .any(|event| matches!(event, BatchEvent::UnitError { .. })));
    assert!(matches!(events.last(), Some(BatchEvent::Cancelled { .. })));
}
