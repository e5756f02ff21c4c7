use super::{load_index, load_universe, write_json};
use crate::config::BacktestConfig;
use crate::data::filter_dates;
use crate::engine::{BacktestResult, EventBacktestEngine};
use crate::performance::{
    exit_reason_breakdown, failed_gate_records, filter_rejection_stats, ExitReasonStats,
    FailedGateRecord, FilterRejectionStats,
};
use anyhow::Result;
use chrono::NaiveDate;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Serialize)]
struct BacktestReport<'a> {
    result: &'a BacktestResult,
    exit_reasons: Vec<ExitReasonStats>,
    filter_rejections: FilterRejectionStats,
    failed_gates: Vec<FailedGateRecord>,
}

pub struct BacktestArgs<'a> {
    pub data: &'a Path,
    pub index: Option<&'a Path>,
    pub parameters: HashMap<String, f64>,
    pub initial_cash: Option<f64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub index_symbol: Option<String>,
    pub output: Option<&'a Path>,
}

pub fn run(args: BacktestArgs<'_>) -> Result<()> {
    let mut config = BacktestConfig {
        start_date: args.start_date,
        end_date: args.end_date,
        ..BacktestConfig::default()
    };
    if let Some(cash) = args.initial_cash {
        config.initial_cash = cash;
    }
    if let Some(symbol) = args.index_symbol {
        config.index_symbol = symbol;
    }

    let mut universe = load_universe(args.data)?;
    let index_bars = load_index(args.index, &config.index_symbol, &mut universe)?;
    let index_bars = filter_dates(index_bars, None, config.end_date);
    let bars = filter_dates(
        universe.into_values().flatten().collect(),
        None,
        config.end_date,
    );
    info!(
        "Running backtest over {} bars ({} index bars)",
        bars.len(),
        index_bars.len()
    );

    let mut engine = EventBacktestEngine::new(config, &args.parameters);
    let result = engine.run(&bars, &index_bars)?;

    for substitution in &result.substitutions {
        warn!(
            "Parameter {} adjusted from {} to {} ({:?})",
            substitution.key, substitution.raw, substitution.applied, substitution.reason
        );
    }
    print_summary(&result);

    if let Some(output) = args.output {
        let report = BacktestReport {
            result: &result,
            exit_reasons: exit_reason_breakdown(&result.trades),
            filter_rejections: filter_rejection_stats(&result.signal_logs),
            failed_gates: failed_gate_records(&result.signal_logs),
        };
        write_json(output, &report)?;
        info!("Backtest report written to {}", output.display());
    }
    Ok(())
}

fn print_summary(result: &BacktestResult) {
    let m = &result.metrics;
    println!("\n=== BACKTEST SUMMARY ===\n");
    println!("  Trading Days: {}", m.trading_days);
    println!("  Final Equity: {:.2}", m.final_equity);
    println!("  Total Return: {:.2}%", m.total_return * 100.0);
    println!("  Annualized Return: {:.2}%", m.annualized_return * 100.0);
    println!(
        "  Max Drawdown: {:.2}% ({} days)",
        m.max_drawdown * 100.0,
        m.drawdown.duration_days
    );
    println!("  Sharpe Ratio: {:.4}", m.sharpe);
    println!("  Sortino Ratio: {:.4}", m.sortino);
    println!("  Calmar Ratio: {:.4}", m.calmar);
    println!("  Trades: {} (win rate {:.2}%)", m.trade_count, m.win_rate * 100.0);
    println!("  Profit Factor: {:?}", m.profit_factor);
    println!("  Avg Utilization: {:.2}%", result.avg_utilization * 100.0);
    println!("  Anomalies: {}", result.anomalies.len());

    let exits = exit_reason_breakdown(&result.trades);
    if !exits.is_empty() {
        println!("  Exit Reasons:");
        for stats in exits {
            println!(
                "    {}: {} trades, win rate {:.2}%, avg pnl {:.2}",
                stats.reason,
                stats.count,
                stats.win_rate * 100.0,
                stats.avg_pnl
            );
        }
    }

    let rejections = filter_rejection_stats(&result.signal_logs);
    if rejections.evaluated > 0 {
        println!(
            "  Entry Filter: {} evaluated, {} rejected ({:.2}%)",
            rejections.evaluated,
            rejections.rejected,
            rejections.rejection_rate() * 100.0
        );
        for (step, count) in &rejections.by_step {
            println!("    {}: {}", step, count);
        }
    }
    println!();
}
