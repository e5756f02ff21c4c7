use anyhow::Result;
use channel_backtest::{
    commands::{self, backtest, batch, scan},
    config::{BatchSettings, ScanPath, DEFAULT_INDEX_SYMBOL},
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "channel_backtest")]
#[command(about = "Channel-breakout signal scanner and event-driven backtester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScanMode {
    Quick,
    Backtest,
    Platform,
}

impl From<ScanMode> for ScanPath {
    fn from(mode: ScanMode) -> Self {
        match mode {
            ScanMode::Quick => ScanPath::QuickScan,
            ScanMode::Backtest => ScanPath::Backtest,
            ScanMode::Platform => ScanPath::PlatformScan,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backtest over a bar file or a directory of bar files
    Backtest {
        /// Bar file (csv, json, bin) or directory
        #[arg(long, value_name = "PATH")]
        data: PathBuf,
        /// Index bars used for the market regime and the benchmark curve
        #[arg(long, value_name = "PATH")]
        index: Option<PathBuf>,
        /// Strategy parameters as inline JSON or a JSON file
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        initial_cash: Option<f64>,
        /// First simulated day (YYYY-MM-DD); earlier bars are history only
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Last simulated day (YYYY-MM-DD); later bars are dropped
        #[arg(long)]
        end_date: Option<NaiveDate>,
        /// Symbol of the index series in the index file or the data directory
        #[arg(long, default_value = DEFAULT_INDEX_SYMBOL)]
        index_symbol: String,
        /// Write the full JSON report here
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Report the latest BUY/SELL signal of every symbol within the recent window
    Scan {
        #[arg(long = "data-dir", value_name = "PATH")]
        data_dir: PathBuf,
        #[arg(long, value_name = "PATH")]
        index: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_INDEX_SYMBOL)]
        index_symbol: String,
        #[arg(long)]
        params: Option<String>,
        /// Call path whose recent-days default applies
        #[arg(long, value_enum, default_value_t = ScanMode::Quick)]
        mode: ScanMode,
        /// Overrides the recent-days window
        #[arg(long)]
        recent_days: Option<usize>,
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Run a symbol × parameter grid on the worker pool
    Batch {
        #[arg(long = "data-dir", value_name = "PATH")]
        data_dir: PathBuf,
        /// JSON grid: {"symbols": [...], "parameters": {"key": [values]}}
        #[arg(long, value_name = "PATH")]
        grid: PathBuf,
        #[arg(long, value_name = "PATH")]
        index: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_INDEX_SYMBOL)]
        index_symbol: String,
        /// Stream events as JSON lines into this file
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    info!("Starting channel_backtest. Not financial advice.");

    match command {
        Commands::Backtest {
            data,
            index,
            params,
            initial_cash,
            start_date,
            end_date,
            index_symbol,
            output,
        } => {
            backtest::run(backtest::BacktestArgs {
                data: &data,
                index: index.as_deref(),
                parameters: commands::parse_parameters(params.as_deref())?,
                initial_cash,
                start_date,
                end_date,
                index_symbol: Some(index_symbol),
                output: output.as_deref(),
            })?;
        }
        Commands::Scan {
            data_dir,
            index,
            index_symbol,
            params,
            mode,
            recent_days,
            output,
        } => {
            scan::run(
                &data_dir,
                index.as_deref(),
                &index_symbol,
                commands::parse_parameters(params.as_deref())?,
                mode.into(),
                recent_days,
                output.as_deref(),
            )?;
        }
        Commands::Batch {
            data_dir,
            grid,
            index,
            index_symbol,
            output,
        } => {
            let settings_map: HashMap<String, String> = env::vars().collect();
            let settings = BatchSettings::from_settings_map(&settings_map)?;
            batch::run(
                &data_dir,
                &grid,
                index.as_deref(),
                &index_symbol,
                output.as_deref(),
                settings,
            )?;
        }
    }

    Ok(())
}
