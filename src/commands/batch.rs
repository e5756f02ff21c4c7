use super::{load_index, load_universe, write_json};
use crate::batch::BatchTaskManager;
use crate::batch_runner::{BatchData, BatchEvent, BatchJob, BatchRunner};
use crate::config::BatchSettings;
use anyhow::{anyhow, Context, Result};
use log::info;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Grid file: value lists per parameter, plus an optional symbol subset.
#[derive(Debug, Deserialize)]
struct GridFile {
    #[serde(default)]
    symbols: Option<Vec<String>>,
    #[serde(default)]
    parameters: BTreeMap<String, Vec<f64>>,
}

pub fn run(
    data_dir: &Path,
    grid_path: &Path,
    index: Option<&Path>,
    index_symbol: &str,
    output: Option<&Path>,
    settings: BatchSettings,
) -> Result<()> {
    let grid_text = fs::read_to_string(grid_path)
        .with_context(|| format!("Failed to read grid file {}", grid_path.display()))?;
    let grid: GridFile = serde_json::from_str(&grid_text)
        .with_context(|| format!("Invalid grid file {}", grid_path.display()))?;

    let mut universe = load_universe(data_dir)?;
    let index_bars = load_index(index, index_symbol, &mut universe)?;
    let mut symbols = grid
        .symbols
        .unwrap_or_else(|| universe.keys().cloned().collect());
    symbols.sort();
    if symbols.is_empty() {
        return Err(anyhow!("No symbols to run in {}", data_dir.display()));
    }

    let job = BatchJob::from_grid(symbols, &grid.parameters);
    let metadata = serde_json::json!({
        "grid": grid.parameters,
        "data_dir": data_dir.display().to_string(),
    });

    let manager = Arc::new(BatchTaskManager::new(
        settings.max_tasks,
        settings.task_ttl_seconds,
    ));
    let runner = BatchRunner::new(manager, settings).with_progress(true);
    let data = BatchData::new(universe, index_bars);
    let handle = runner.spawn(job, data, metadata)?;
    info!("Batch task {} started", handle.task_id());

    let mut sink: Box<dyn Write> = match output {
        Some(path) => Box::new(
            fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::sink()),
    };
    let mut combos: HashMap<usize, (usize, f64)> = HashMap::new();
    for event in handle.events().iter() {
        writeln!(sink, "{}", serde_json::to_string(&event)?)?;
        if let BatchEvent::UnitResult { result, .. } = &event {
            let entry = combos.entry(result.identity.combo_index).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += result.score;
        }
    }
    let (_, status) = handle.wait();
    let status = status?;

    println!("\n=== BATCH {} ({:?}) ===\n", status.task_id, status.status);
    println!("  Units: {}/{}", status.done_units, status.total_units);
    println!("  Failed: {}", status.aggregation.units_failed);
    println!("  Avg Return: {:.2}%", status.aggregation.avg_return * 100.0);
    println!("  Win Rate: {:.2}%", status.aggregation.win_rate * 100.0);
    println!(
        "  Entry Rejection Rate: {:.2}%",
        status.aggregation.rejection_rate * 100.0
    );
    for (rank, combo) in status.aggregation.combo_top.iter().enumerate() {
        let avg_score = combos
            .get(&combo.combo_index)
            .map(|(count, total)| total / *count as f64)
            .unwrap_or(0.0);
        println!(
            "  #{} combo {}: avg return {:.2}%, win rate {:.2}%, score {:.2} ({} units)",
            rank + 1,
            combo.combo_index,
            combo.avg_return * 100.0,
            combo.avg_win_rate * 100.0,
            avg_score,
            combo.samples
        );
    }

    if let Some(path) = output {
        let status_path = path.with_extension("status.json");
        write_json(&status_path, &status)?;
        info!("Batch events written to {}", path.display());
    }
    Ok(())
}
