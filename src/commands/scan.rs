use super::{load_index, load_universe, write_json};
use crate::config::ScanPath;
use crate::models::SignalAction;
use crate::scanner::scan_universe;
use anyhow::Result;
use log::info;
use std::collections::HashMap;
use std::path::Path;

pub fn run(
    data_dir: &Path,
    index: Option<&Path>,
    index_symbol: &str,
    mut parameters: HashMap<String, f64>,
    path: ScanPath,
    recent_days: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    if let Some(days) = recent_days {
        parameters.insert("scan_recent_days".to_string(), days as f64);
    }
    let mut universe = load_universe(data_dir)?;
    let index_bars = load_index(index, index_symbol, &mut universe)?;
    let hits = scan_universe(&universe, &index_bars, &parameters, path);

    let mut signalled = 0;
    for hit in &hits {
        match (&hit.signal, &hit.error) {
            (Some(log), _) => {
                signalled += 1;
                let action = match log.final_signal {
                    SignalAction::Buy => "BUY",
                    SignalAction::Sell => "SELL",
                    SignalAction::NoSignal => "-",
                };
                let reason = log.exit_reason.map(|r| r.to_string()).unwrap_or_default();
                println!(
                    "{:<12} {} {:<4} close {:.3} {}",
                    hit.symbol, log.date, action, log.close, reason
                );
            }
            (None, Some(err)) => println!("{:<12} error: {}", hit.symbol, err),
            (None, None) => {}
        }
    }
    info!(
        "Scan finished: {} of {} symbols signalled within {} days",
        signalled,
        hits.len(),
        path.recent_days(&parameters)
    );

    if let Some(output) = output {
        write_json(output, &hits)?;
    }
    Ok(())
}
