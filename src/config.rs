use crate::param_utils::{ParamReader, ParamSubstitution};
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const INDEX_MA_PERIODS: [usize; 4] = [5, 10, 20, 30];
pub const DEFAULT_INDEX_SYMBOL: &str = "000300.SH";

const KNOWN_PARAMETERS: [&str; 40] = [
    "channel_period",
    "buy_touch_eps",
    "sell_trigger_eps",
    "sell_target_mode",
    "channel_break_eps",
    "stop_loss_mul",
    "stop_loss_on_close",
    "stop_loss_panic_eps",
    "max_holding_days",
    "cooling_period",
    "scan_recent_days",
    "slope_abs_max",
    "min_slope_norm",
    "vol_shrink_threshold",
    "vol_shrink_min",
    "vol_shrink_max",
    "volatility_ratio_max",
    "min_channel_height",
    "min_mid_room",
    "min_mid_profit_pct",
    "min_rr_to_mid",
    "pivot_k",
    "pivot_drop_min",
    "pivot_rebound_days",
    "pivot_confirm_days",
    "pivot_no_new_low_tol",
    "pivot_rebound_amp",
    "pivot_confirm_requires_sig",
    "require_index_condition",
    "index_bear_exit",
    "index_trend_ma_period",
    "trend_ma_period",
    "max_positions",
    "max_position_pct",
    "entry_fill_eps",
    "exit_fill_eps",
    "fill_at_close",
    "require_rebound",
    "require_green",
    "capture_logs",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellTargetMode {
    MidUp,
    UpperDown,
    MidDown,
}

impl SellTargetMode {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => SellTargetMode::UpperDown,
            2 => SellTargetMode::MidDown,
            _ => SellTargetMode::MidUp,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SellTargetMode::MidUp => "mid_up",
            SellTargetMode::UpperDown => "upper_down",
            SellTargetMode::MidDown => "mid_down",
        }
    }
}

/// Typed channel strategy parameters. Build it with `from_parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_period: usize,

    pub buy_touch_eps: f64,
    pub sell_trigger_eps: f64,
    pub sell_target_mode: SellTargetMode,
    pub channel_break_eps: f64,

    pub stop_loss_mul: f64,
    pub stop_loss_on_close: bool,
    pub stop_loss_panic_eps: f64,

    pub max_holding_days: u32,
    pub cooling_period: u32,
    pub scan_recent_days: usize,

    pub slope_abs_max: f64,
    pub min_slope_norm: f64,
    pub vol_shrink_threshold: f64,
    pub vol_shrink_min: Option<f64>,
    pub vol_shrink_max: Option<f64>,
    pub volatility_ratio_max: f64,

    pub min_channel_height: f64,
    pub min_mid_room: f64,
    pub min_mid_profit_pct: f64,
    pub min_rr_to_mid: f64,

    pub pivot_k: usize,
    pub pivot_drop_min: f64,
    pub pivot_rebound_days: usize,
    pub pivot_confirm_days: usize,
    pub pivot_no_new_low_tol: f64,
    pub pivot_rebound_amp: f64,
    pub pivot_confirm_requires_sig: bool,

    pub require_index_condition: bool,
    pub index_bear_exit: bool,
    pub index_trend_ma_period: usize,
    pub trend_ma_period: usize,

    pub max_positions: usize,
    pub max_position_pct: f64,

    pub entry_fill_eps: f64,
    pub exit_fill_eps: f64,
    pub fill_at_close: bool,

    pub require_rebound: bool,
    pub require_green: bool,
    pub capture_logs: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_period: 20,
            buy_touch_eps: 0.005,
            sell_trigger_eps: 0.005,
            sell_target_mode: SellTargetMode::MidUp,
            channel_break_eps: 0.02,
            stop_loss_mul: 0.97,
            stop_loss_on_close: true,
            stop_loss_panic_eps: 0.02,
            max_holding_days: 20,
            cooling_period: 5,
            scan_recent_days: 20,
            slope_abs_max: 0.01,
            min_slope_norm: -1.0,
            vol_shrink_threshold: 0.9,
            vol_shrink_min: None,
            vol_shrink_max: None,
            volatility_ratio_max: 1.0,
            min_channel_height: 0.05,
            min_mid_room: 0.015,
            min_mid_profit_pct: 0.0,
            min_rr_to_mid: 0.0,
            pivot_k: 2,
            pivot_drop_min: 0.03,
            pivot_rebound_days: 2,
            pivot_confirm_days: 3,
            pivot_no_new_low_tol: 0.01,
            pivot_rebound_amp: 0.02,
            pivot_confirm_requires_sig: true,
            require_index_condition: true,
            index_bear_exit: true,
            index_trend_ma_period: 0,
            trend_ma_period: 0,
            max_positions: 5,
            max_position_pct: 1.0,
            entry_fill_eps: 0.002,
            exit_fill_eps: 0.002,
            fill_at_close: true,
            require_rebound: false,
            require_green: false,
            capture_logs: true,
        }
    }
}

/// A typed config together with every substitution made while building it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub config: ChannelConfig,
    pub substitutions: Vec<ParamSubstitution>,
}

impl ChannelConfig {
    /// The single mapping from a raw parameter map into typed config. Scanning,
    /// backtesting and batch units all go through here.
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> ResolvedConfig {
        let d = ChannelConfig::default();
        let mut r = ParamReader::new(parameters);

        for key in parameters.keys() {
            if !KNOWN_PARAMETERS.contains(&key.as_str()) {
                debug!("Ignoring unknown strategy parameter {}", key);
            }
        }

        let config = ChannelConfig {
            channel_period: r.usize_clamped("channel_period", d.channel_period, 10, 250),
            buy_touch_eps: r.f64_clamped("buy_touch_eps", d.buy_touch_eps, 0.0, 0.2),
            sell_trigger_eps: r.f64_clamped("sell_trigger_eps", d.sell_trigger_eps, 0.0, 0.2),
            sell_target_mode: SellTargetMode::from_code(r.code("sell_target_mode", 0, &[0, 1, 2])),
            channel_break_eps: r.f64_clamped("channel_break_eps", d.channel_break_eps, 0.0, 0.5),
            stop_loss_mul: r.f64_clamped("stop_loss_mul", d.stop_loss_mul, 0.5, 1.0),
            stop_loss_on_close: r.flag("stop_loss_on_close", d.stop_loss_on_close),
            stop_loss_panic_eps: r.f64_clamped(
                "stop_loss_panic_eps",
                d.stop_loss_panic_eps,
                0.0,
                0.5,
            ),
            max_holding_days: r.usize_clamped(
                "max_holding_days",
                d.max_holding_days as usize,
                1,
                10_000,
            ) as u32,
            cooling_period: r.usize_clamped("cooling_period", d.cooling_period as usize, 0, 10_000)
                as u32,
            scan_recent_days: r.usize_clamped("scan_recent_days", d.scan_recent_days, 1, 10_000),
            slope_abs_max: r.f64_clamped("slope_abs_max", d.slope_abs_max, 0.0, 1.0),
            min_slope_norm: r.f64_clamped("min_slope_norm", d.min_slope_norm, -1.0, 1.0),
            vol_shrink_threshold: r.f64_clamped(
                "vol_shrink_threshold",
                d.vol_shrink_threshold,
                0.0,
                10.0,
            ),
            vol_shrink_min: r.optional_f64_clamped("vol_shrink_min", 0.0, 10.0),
            vol_shrink_max: r.optional_f64_clamped("vol_shrink_max", 0.0, 10.0),
            volatility_ratio_max: r.f64_clamped(
                "volatility_ratio_max",
                d.volatility_ratio_max,
                0.0,
                10.0,
            ),
            min_channel_height: r.f64_clamped("min_channel_height", d.min_channel_height, 0.0, 1.0),
            min_mid_room: r.f64_clamped("min_mid_room", d.min_mid_room, 0.0, 1.0),
            min_mid_profit_pct: r.f64_clamped("min_mid_profit_pct", d.min_mid_profit_pct, 0.0, 1.0),
            min_rr_to_mid: r.f64_clamped("min_rr_to_mid", d.min_rr_to_mid, 0.0, 20.0),
            pivot_k: r.usize_clamped("pivot_k", d.pivot_k, 1, 10),
            pivot_drop_min: r.f64_clamped("pivot_drop_min", d.pivot_drop_min, 0.0, 1.0),
            pivot_rebound_days: r.usize_clamped("pivot_rebound_days", d.pivot_rebound_days, 1, 20),
            pivot_confirm_days: r.usize_clamped("pivot_confirm_days", d.pivot_confirm_days, 0, 60),
            pivot_no_new_low_tol: r.f64_clamped(
                "pivot_no_new_low_tol",
                d.pivot_no_new_low_tol,
                0.0,
                0.5,
            ),
            pivot_rebound_amp: r.f64_clamped("pivot_rebound_amp", d.pivot_rebound_amp, 0.0, 1.0),
            pivot_confirm_requires_sig: r
                .flag("pivot_confirm_requires_sig", d.pivot_confirm_requires_sig),
            require_index_condition: r.flag("require_index_condition", d.require_index_condition),
            index_bear_exit: r.flag("index_bear_exit", d.index_bear_exit),
            index_trend_ma_period: r.usize_clamped(
                "index_trend_ma_period",
                d.index_trend_ma_period,
                0,
                250,
            ),
            trend_ma_period: r.usize_clamped("trend_ma_period", d.trend_ma_period, 0, 250),
            max_positions: r.usize_clamped("max_positions", d.max_positions, 1, 100),
            max_position_pct: r.f64_clamped("max_position_pct", d.max_position_pct, 0.0, 1.0),
            entry_fill_eps: r.f64_clamped("entry_fill_eps", d.entry_fill_eps, 0.0, 0.1),
            exit_fill_eps: r.f64_clamped("exit_fill_eps", d.exit_fill_eps, 0.0, 0.1),
            fill_at_close: r.flag("fill_at_close", d.fill_at_close),
            require_rebound: r.flag("require_rebound", d.require_rebound),
            require_green: r.flag("require_green", d.require_green),
            capture_logs: r.flag("capture_logs", d.capture_logs),
        };

        ResolvedConfig {
            config,
            substitutions: r.into_substitutions(),
        }
    }

    /// Effective channel window length.
    pub fn effective_period(&self) -> usize {
        self.channel_period.max(10)
    }

    pub fn sell_target_price(&self, mid: f64, upper: f64) -> f64 {
        let eps = self.sell_trigger_eps.max(0.0);
        match self.sell_target_mode {
            SellTargetMode::MidUp => mid * (1.0 + eps),
            SellTargetMode::UpperDown => upper * (1.0 - eps),
            SellTargetMode::MidDown => mid * (1.0 - eps),
        }
    }

    /// The range mode wins when either bound is configured.
    pub fn volume_check(&self, vol_ratio: f64) -> VolumeCheck {
        if self.vol_shrink_min.is_some() || self.vol_shrink_max.is_some() {
            let min = self.vol_shrink_min.unwrap_or(f64::NEG_INFINITY);
            let max = self.vol_shrink_max.unwrap_or(f64::INFINITY);
            return VolumeCheck::Range {
                min,
                max,
                passed: vol_ratio >= min && vol_ratio <= max,
            };
        }
        let threshold = self.vol_shrink_threshold;
        if threshold <= 0.0 {
            return VolumeCheck::Disabled;
        }
        if threshold >= 1.0 {
            VolumeCheck::AtLeast {
                threshold,
                passed: vol_ratio >= threshold,
            }
        } else {
            VolumeCheck::AtMost {
                threshold,
                passed: vol_ratio <= threshold,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeCheck {
    Disabled,
    Range { min: f64, max: f64, passed: bool },
    AtLeast { threshold: f64, passed: bool },
    AtMost { threshold: f64, passed: bool },
}

/// Where a scan request comes from. Each path keeps its own historical default
/// for the recent-days window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPath {
    QuickScan,
    Backtest,
    PlatformScan,
}

impl ScanPath {
    pub fn default_recent_days(self) -> usize {
        match self {
            ScanPath::QuickScan => 1,
            ScanPath::Backtest => ChannelConfig::default().scan_recent_days,
            ScanPath::PlatformScan => 30,
        }
    }

    /// An explicit `scan_recent_days` parameter overrides the path default.
    pub fn recent_days(self, parameters: &HashMap<String, f64>) -> usize {
        if parameters.contains_key("scan_recent_days") {
            ChannelConfig::from_parameters(parameters)
                .config
                .scan_recent_days
        } else {
            self.default_recent_days()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub commission_rate: f64,
    pub min_commission: f64,
    pub stamp_duty_rate: f64,
    pub slippage_rate: f64,
    pub lot_size: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            commission_rate: 0.0003,
            min_commission: 5.0,
            stamp_duty_rate: 0.001,
            slippage_rate: 0.001,
            lot_size: 100,
        }
    }
}

impl BrokerConfig {
    /// Cost profile used by batch sweeps.
    pub fn batch_profile() -> Self {
        Self {
            stamp_duty_rate: 0.0005,
            slippage_rate: 0.0001,
            ..Self::default()
        }
    }

    /// No fees and no slippage.
    pub fn frictionless() -> Self {
        Self {
            commission_rate: 0.0,
            min_commission: 0.0,
            stamp_duty_rate: 0.0,
            slippage_rate: 0.0,
            lot_size: 100,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=0.01).contains(&self.commission_rate) {
            return Err(anyhow!(
                "Commission rate must be between 0 and 0.01 (value: {})",
                self.commission_rate
            ));
        }
        if self.min_commission < 0.0 || !self.min_commission.is_finite() {
            return Err(anyhow!(
                "Minimum commission cannot be negative (value: {})",
                self.min_commission
            ));
        }
        if !(0.0..=0.01).contains(&self.stamp_duty_rate) {
            return Err(anyhow!(
                "Stamp duty rate must be between 0 and 0.01 (value: {})",
                self.stamp_duty_rate
            ));
        }
        if !(0.0..=0.01).contains(&self.slippage_rate) {
            return Err(anyhow!(
                "Slippage rate must be between 0 and 0.01 (value: {})",
                self.slippage_rate
            ));
        }
        if self.lot_size == 0 {
            return Err(anyhow!("Lot size must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_cash: f64,
    pub broker: BrokerConfig,
    pub index_symbol: String,
    pub start_date: Option<NaiveDate>,
    /// Last calendar day of the run. Later bars are ignored.
    pub end_date: Option<NaiveDate>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_cash: 1_000_000.0,
            broker: BrokerConfig::default(),
            index_symbol: DEFAULT_INDEX_SYMBOL.to_string(),
            start_date: None,
            end_date: None,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.initial_cash.is_finite() || self.initial_cash <= 0.0 {
            return Err(anyhow!(
                "Initial cash must be positive (value: {})",
                self.initial_cash
            ));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(anyhow!(
                    "Start date {} is after end date {}",
                    start,
                    end
                ));
            }
        }
        self.broker.validate()
    }
}

/// Runtime settings for batch sweeps, read from a string map such as the
/// process environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    pub max_tasks: usize,
    pub task_ttl_seconds: u64,
    pub max_in_flight: usize,
    pub initial_cash: f64,
    /// Number of date segments each unit is re-run on for robust scoring.
    /// Zero disables the segment runs.
    pub robust_segments: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_tasks: 50,
            task_ttl_seconds: 3600,
            max_in_flight: 16,
            initial_cash: 1_000_000.0,
            robust_segments: 0,
        }
    }
}

impl BatchSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let d = BatchSettings::default();
        Ok(Self {
            max_tasks: optional_setting_usize(settings, "BATCH_MAX_TASKS", d.max_tasks, 1)?,
            task_ttl_seconds: optional_setting_usize(
                settings,
                "BATCH_TASK_TTL_SECONDS",
                d.task_ttl_seconds as usize,
                1,
            )? as u64,
            max_in_flight: optional_setting_usize(
                settings,
                "BATCH_MAX_IN_FLIGHT",
                d.max_in_flight,
                1,
            )?,
            initial_cash: optional_setting_f64(
                settings,
                "BACKTEST_INITIAL_CASH",
                d.initial_cash,
                Some(1.0),
                None,
            )?,
            robust_segments: optional_setting_usize(
                settings,
                "BATCH_ROBUST_SEGMENTS",
                d.robust_segments,
                0,
            )?,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}
