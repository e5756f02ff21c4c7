use crate::config::{BacktestConfig, ScanPath};
use crate::engine::EventBacktestEngine;
use crate::error::RunError;
use crate::models::{Bar, SignalAction, SignalLog};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanHit {
    pub symbol: String,
    pub recent_days: usize,
    pub signal: Option<SignalLog>,
    pub error: Option<String>,
}

/// Runs a full backtest over `bars` and returns the latest BUY or SELL log
/// dated within the symbol's last `recent_days` bars.
pub fn scan_symbol(
    bars: &[Bar],
    index_bars: &[Bar],
    parameters: &HashMap<String, f64>,
    path: ScanPath,
) -> Result<Option<SignalLog>, RunError> {
    let recent_days = path.recent_days(parameters);
    let mut engine = EventBacktestEngine::new(BacktestConfig::default(), parameters);
    let result = engine.run(bars, index_bars)?;

    let dates: BTreeSet<_> = bars.iter().map(|bar| bar.date).collect();
    // Fewer bars than the window: every log is recent.
    let cutoff = dates.iter().rev().nth(recent_days.saturating_sub(1)).copied();
    Ok(latest_action(result.signal_logs, cutoff))
}

fn latest_action(
    logs: Vec<SignalLog>,
    cutoff: Option<chrono::NaiveDate>,
) -> Option<SignalLog> {
    logs.into_iter()
        .filter(|log| log.final_signal != SignalAction::NoSignal)
        .filter(|log| cutoff.map_or(true, |cutoff| log.date >= cutoff))
        .max_by_key(|log| log.date)
}

/// Scans every symbol in parallel. Results are sorted by symbol.
pub fn scan_universe(
    universe: &HashMap<String, Vec<Bar>>,
    index_bars: &[Bar],
    parameters: &HashMap<String, f64>,
    path: ScanPath,
) -> Vec<ScanHit> {
    let recent_days = path.recent_days(parameters);
    info!(
        "Scanning {} symbols ({:?}, last {} days)",
        universe.len(),
        path,
        recent_days
    );
    let mut hits: Vec<ScanHit> = universe
        .par_iter()
        .map(|(symbol, bars)| match scan_symbol(bars, index_bars, parameters, path) {
            Ok(signal) => ScanHit {
                symbol: symbol.clone(),
                recent_days,
                signal,
                error: None,
            },
            Err(err) => {
                warn!("Scan of {} failed: {}", symbol, err);
                ScanHit {
                    symbol: symbol.clone(),
                    recent_days,
                    signal: None,
                    error: Some(err.to_string()),
                }
            }
        })
        .collect();
    hits.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn date(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
    }

    fn log(day: i64, signal: SignalAction) -> SignalLog {
        SignalLog {
            date: date(day),
            symbol: "X".to_string(),
            day_index: day as usize,
            has_position: false,
            open: 10.0,
            high: 10.0,
            low: 10.0,
            close: 10.0,
            index_bear: None,
            cooling_left: 0,
            channel: None,
            final_signal: signal,
            exit_reason: None,
            order_rejection: None,
            trace: Vec::new(),
        }
    }

    #[test]
    fn latest_action_respects_cutoff() {
        let logs = vec![
            log(1, SignalAction::Buy),
            log(5, SignalAction::Sell),
            log(6, SignalAction::NoSignal),
        ];
        let latest = latest_action(logs.clone(), Some(date(3))).unwrap();
        assert_eq!(latest.date, date(5));
        assert!(latest_action(logs.clone(), Some(date(6))).is_none());
        assert_eq!(latest_action(logs, None).unwrap().date, date(5));
    }

    #[test]
    fn empty_bars_fail_the_scan() {
        let result = scan_symbol(&[], &[], &HashMap::new(), ScanPath::QuickScan);
        assert_eq!(result, Err(RunError::NoData));
    }

    #[test]
    fn quiet_series_has_no_hit() {
        let bars: Vec<Bar> = (0..40)
            .map(|i| Bar {
                symbol: "FLAT".to_string(),
                date: date(i),
                open: 10.0,
                high: 10.02,
                low: 9.98,
                close: 10.0,
                volume: 1000.0,
            })
            .collect();
        let mut universe = HashMap::new();
        universe.insert("FLAT".to_string(), bars);
        let hits = scan_universe(&universe, &[], &HashMap::new(), ScanPath::PlatformScan);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].recent_days, 30);
        assert!(hits[0].signal.is_none());
        assert!(hits[0].error.is_none());
    }
}
