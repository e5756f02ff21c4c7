use crate::channel::PriceSeries;
use crate::config::{ChannelConfig, VolumeCheck};
use crate::indicators::{calculate_volatility_ratio, sma_at, IndexDay};
use crate::models::{ChannelEnvironment, DecisionTraceStep, ExitReason, SignalAction, TraceOutcome};
use crate::trading_rules::{
    determine_position_size, initial_stop_loss, reward_to_risk, PositionSizingOutcome,
    PositionSizingParams,
};

const VOLATILITY_SHORT_WINDOW: usize = 5;
const VOLATILITY_LONG_WINDOW: usize = 20;

/// Book state the entry gates depend on.
#[derive(Debug, Clone)]
pub struct EntryContext<'a> {
    pub symbol: &'a str,
    pub open_positions: usize,
    pub cooling_left: u32,
    pub equity: f64,
    pub lot_size: u64,
    pub index_bear: Option<bool>,
    pub index_day: Option<IndexDay>,
}

impl<'a> EntryContext<'a> {
    /// Flat book, no cooldown, no index data.
    pub fn standalone(symbol: &'a str) -> Self {
        Self {
            symbol,
            open_positions: 0,
            cooling_left: 0,
            equity: 1_000_000.0,
            lot_size: 100,
            index_bear: None,
            index_day: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub entry_price: f64,
    pub target_price: f64,
    pub initial_stop: f64,
    pub quantity: u64,
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryDecision {
    pub trace: Vec<DecisionTraceStep>,
    pub signal: SignalAction,
    pub plan: Option<EntryPlan>,
    pub index_ok: bool,
}

impl EntryDecision {
    pub fn first_failure(&self) -> Option<&DecisionTraceStep> {
        self.trace.iter().find(|step| step.passed.is_failed())
    }
}

#[derive(Default)]
struct TraceBuilder {
    steps: Vec<DecisionTraceStep>,
}

impl TraceBuilder {
    fn check(
        &mut self,
        step: &str,
        check: &str,
        threshold: String,
        actual: String,
        passed: bool,
        reason: &str,
    ) -> bool {
        self.steps.push(DecisionTraceStep {
            step_name: step.to_string(),
            check_description: check.to_string(),
            threshold,
            actual_value: actual,
            passed: TraceOutcome::from_check(passed),
            reason: if passed {
                String::new()
            } else {
                reason.to_string()
            },
        });
        passed
    }

    fn skip(&mut self, step: &str, check: &str) {
        self.steps.push(DecisionTraceStep {
            step_name: step.to_string(),
            check_description: check.to_string(),
            threshold: "-".to_string(),
            actual_value: "-".to_string(),
            passed: TraceOutcome::NotApplicable,
            reason: "not configured".to_string(),
        });
    }

    fn any_failed(&self) -> bool {
        self.steps.iter().any(|step| step.passed.is_failed())
    }
}

fn format_index_state(bear: Option<bool>) -> String {
    match bear {
        Some(true) => "bear".to_string(),
        Some(false) => "not bear".to_string(),
        None => "n/a".to_string(),
    }
}

/// Runs every entry gate for bar `i`, recording one trace step per gate even
/// after a failure. The signal is BUY only when no step failed.
pub fn evaluate_entry(
    series: &PriceSeries,
    i: usize,
    env: &ChannelEnvironment,
    config: &ChannelConfig,
    ctx: &EntryContext<'_>,
) -> EntryDecision {
    let mut trace = TraceBuilder::default();
    let open = series.opens[i];
    let high = series.highs[i];
    let low = series.lows[i];
    let close = series.closes[i];

    // Index regime
    let mut index_filter_applies = false;
    let mut index_ok = true;
    if config.require_index_condition {
        index_filter_applies = true;
        let passed = ctx.index_bear != Some(true);
        index_ok &= trace.check(
            "IndexFilter",
            "Index not bear",
            "not bear".to_string(),
            format_index_state(ctx.index_bear),
            passed,
            "Index is bearish",
        );
    } else {
        trace.skip("IndexFilter", "Index not bear");
    }

    let index_ma = ctx
        .index_day
        .and_then(|day| day.trend_ma.map(|ma| (day.close, ma)));
    match index_ma {
        Some((index_close, ma)) if config.index_trend_ma_period > 0 => {
            index_filter_applies = true;
            index_ok &= trace.check(
                "IndexMA",
                "Index close >= MA",
                format!(">={:.2}", ma),
                format!("{:.2}", index_close),
                index_close >= ma,
                "Index below trend MA",
            );
        }
        _ => trace.skip("IndexMA", "Index close >= MA"),
    }

    // Book state
    let max_positions = config.max_positions.max(1);
    trace.check(
        "MaxPositions",
        "Open count < max",
        format!("<{}", max_positions),
        ctx.open_positions.to_string(),
        ctx.open_positions < max_positions,
        "Max positions reached",
    );
    trace.check(
        "Cooling",
        "Cooling left == 0",
        "0".to_string(),
        ctx.cooling_left.to_string(),
        ctx.cooling_left == 0,
        "In cooling period",
    );

    // Candle shape
    if config.require_rebound {
        trace.check(
            "Rebound",
            "Close >= lower",
            format!(">={:.2}", env.lower),
            format!("{:.2}", close),
            close >= env.lower,
            "No rebound from lower band",
        );
    } else {
        trace.skip("Rebound", "Close >= lower");
    }
    if config.require_green {
        trace.check(
            "CandleColor",
            "Close > open",
            format!(">{:.2}", open),
            format!("{:.2}", close),
            close > open,
            "Not a green candle",
        );
    } else {
        trace.skip("CandleColor", "Close > open");
    }

    // Trend and volatility
    if config.volatility_ratio_max < 1.0 {
        match calculate_volatility_ratio(
            &series.closes[..=i],
            VOLATILITY_SHORT_WINDOW,
            VOLATILITY_LONG_WINDOW,
        ) {
            Some(vol) => {
                trace.check(
                    "Volatility",
                    "Vol ratio <= max",
                    format!("<={:.2}", config.volatility_ratio_max),
                    format!(
                        "{:.2}%/{:.2}%={:.2}",
                        vol.short_vol * 100.0,
                        vol.long_vol * 100.0,
                        vol.ratio
                    ),
                    vol.ratio <= config.volatility_ratio_max,
                    "Volatility too high",
                );
            }
            None => {
                trace.check(
                    "Volatility",
                    "Enough closes",
                    format!(">={} closes", VOLATILITY_LONG_WINDOW + 1),
                    (i + 1).to_string(),
                    true,
                    "",
                );
            }
        }
    } else {
        trace.skip("Volatility", "Vol ratio <= max");
    }

    if config.trend_ma_period > 0 {
        match sma_at(&series.closes, i, config.trend_ma_period) {
            Some(ma) => {
                trace.check(
                    "TrendMA",
                    "Close >= MA",
                    format!(">={:.2}", ma),
                    format!("{:.2}", close),
                    close >= ma,
                    "Price below trend MA",
                );
            }
            None => {
                trace.check(
                    "TrendMA",
                    "Enough closes for MA",
                    format!(">={}", config.trend_ma_period),
                    (i + 1).to_string(),
                    false,
                    "Not enough data for MA",
                );
            }
        }
    } else {
        trace.skip("TrendMA", "Close >= MA");
    }

    // Channel geometry
    if config.min_slope_norm > -1.0 {
        trace.check(
            "SlopeMin",
            "Slope >= min",
            format!(">={:.4}", config.min_slope_norm),
            format!("{:.4}", env.slope_norm),
            env.slope_norm >= config.min_slope_norm,
            "Slope too negative",
        );
    } else {
        trace.skip("SlopeMin", "Slope >= min");
    }
    let slope_abs_max = config.slope_abs_max.max(0.0);
    trace.check(
        "SlopeMax",
        "Abs(slope) <= max",
        format!("<={:.4}", slope_abs_max),
        format!("{:.4}", env.slope_norm.abs()),
        env.slope_norm.abs() <= slope_abs_max,
        "Slope too steep",
    );
    let height = env.channel_height();
    trace.check(
        "ChannelHeight",
        "Height >= min",
        format!(">={:.3}", config.min_channel_height),
        format!("{:.3}", height),
        height >= config.min_channel_height.max(0.0),
        "Channel too narrow",
    );
    let room = env.mid_room();
    trace.check(
        "MidRoom",
        "Room to mid >= min",
        format!(">={:.3}", config.min_mid_room),
        format!("{:.3}", room),
        room >= config.min_mid_room.max(0.0),
        "Not enough room to mid",
    );

    let actual_volume = format!("{:.2}", env.vol_ratio);
    match config.volume_check(env.vol_ratio) {
        VolumeCheck::Disabled => trace.skip("VolumeShrink", "Vol ratio check"),
        VolumeCheck::Range { min, max, passed } => {
            let reason = if env.vol_ratio < min {
                "Volume below range"
            } else {
                "Volume above range"
            };
            trace.check(
                "VolumeShrink",
                "Vol ratio in range",
                format!("[{:.2}, {:.2}]", min, max),
                actual_volume,
                passed,
                reason,
            );
        }
        VolumeCheck::AtLeast { threshold, passed } => {
            trace.check(
                "VolumeShrink",
                "Vol ratio >= threshold",
                format!(">={:.2}", threshold),
                actual_volume,
                passed,
                "Volume below threshold",
            );
        }
        VolumeCheck::AtMost { threshold, passed } => {
            trace.check(
                "VolumeShrink",
                "Vol ratio <= threshold",
                format!("<={:.2}", threshold),
                actual_volume,
                passed,
                "Volume above threshold",
            );
        }
    }

    let touch_price = env.lower * (1.0 + config.buy_touch_eps.max(0.0));
    trace.check(
        "TouchLower",
        "Low <= touch price",
        format!("<={:.2}", touch_price),
        format!("{:.2}", low),
        low <= touch_price,
        "Did not touch lower band",
    );

    if index_filter_applies {
        trace.check(
            "IndexConfirm",
            "Index conditions hold",
            "true".to_string(),
            index_ok.to_string(),
            index_ok,
            "Index not confirmed",
        );
    } else {
        trace.skip("IndexConfirm", "Index conditions hold");
    }

    // Pivot confirmation window
    let confirm_days = config.pivot_confirm_days;
    if confirm_days > 0 {
        if config.pivot_confirm_requires_sig {
            trace.check(
                "PivotSignificant",
                "Pivot is significant",
                "true".to_string(),
                env.pivot_is_significant.to_string(),
                env.pivot_is_significant,
                "Not a significant pivot",
            );
        } else {
            trace.skip("PivotSignificant", "Pivot is significant");
        }

        let days_since = i.saturating_sub(env.anchor_index);
        trace.check(
            "PivotDays",
            "Days since pivot",
            format!(">={}", confirm_days),
            (days_since + 1).to_string(),
            days_since + 1 >= confirm_days,
            "Pivot too recent",
        );

        let window_start = env.anchor_index.max((i + 1).saturating_sub(confirm_days));
        let min_low = series.lows[window_start..=i]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let max_high = series.highs[window_start..=i]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        let tol = config.pivot_no_new_low_tol.max(0.0);
        let floor = env.pivot_price * (1.0 - tol);
        trace.check(
            "NoNewLow",
            "Min low >= pivot*(1-tol)",
            format!(">={:.2}", floor),
            format!("{:.2}", min_low),
            min_low >= floor,
            "New low formed",
        );

        let amp_required = config.pivot_rebound_amp.max(0.0);
        let amp = if env.pivot_price > 0.0 {
            max_high / env.pivot_price - 1.0
        } else {
            0.0
        };
        trace.check(
            "ReboundAmp",
            "Rebound amplitude >= min",
            format!(">={:.3}", amp_required),
            format!("{:.3}", amp),
            amp >= amp_required,
            "Rebound too weak",
        );
    } else {
        trace.skip("PivotSignificant", "Pivot is significant");
        trace.skip("PivotDays", "Days since pivot");
        trace.skip("NoNewLow", "Min low >= pivot*(1-tol)");
        trace.skip("ReboundAmp", "Rebound amplitude >= min");
    }

    // Trade economics
    let entry_price = close * (1.0 + config.entry_fill_eps.max(0.0));
    let target_price = config.sell_target_price(env.mid, env.upper);
    let min_profit = config.min_mid_profit_pct.max(0.0);
    if min_profit > 0.0 {
        let profit = if entry_price > 0.0 {
            target_price / entry_price - 1.0
        } else {
            -1.0
        };
        trace.check(
            "MinProfit",
            "Profit to target >= min",
            format!(">={:.3}", min_profit),
            format!("{:.3}", profit),
            profit >= min_profit,
            "Potential profit too low",
        );
    } else {
        trace.skip("MinProfit", "Profit to target >= min");
    }
    let min_rr = config.min_rr_to_mid.max(0.0);
    if min_rr > 0.0 {
        let rr = reward_to_risk(entry_price, target_price, config.stop_loss_mul);
        trace.check(
            "MinRiskReward",
            "Reward/risk >= min",
            format!(">={:.2}", min_rr),
            format!("{:.2}", rr),
            rr >= min_rr,
            "Risk/reward too low",
        );
    } else {
        trace.skip("MinRiskReward", "Reward/risk >= min");
    }

    let sizing = determine_position_size(PositionSizingParams {
        price: entry_price,
        equity: ctx.equity,
        max_position_pct: config.max_position_pct,
        lot_size: ctx.lot_size,
    });
    let allocation = match sizing {
        PositionSizingOutcome::Sized(allocation) => {
            trace.check(
                "PositionSize",
                "Quantity >= one lot",
                format!(">={}", ctx.lot_size.max(1)),
                allocation.quantity.to_string(),
                true,
                "",
            );
            Some(allocation)
        }
        PositionSizingOutcome::TooSmall {
            lot_size,
            affordable,
        } => {
            trace.check(
                "PositionSize",
                "Quantity >= one lot",
                format!(">={}", lot_size),
                affordable.to_string(),
                false,
                "Budget below one lot",
            );
            None
        }
    };

    let plan = match allocation {
        Some(allocation) if !trace.any_failed() => Some(EntryPlan {
            entry_price,
            target_price,
            initial_stop: initial_stop_loss(entry_price, config.stop_loss_mul),
            quantity: allocation.quantity,
            limit_price: config.fill_at_close.then_some(entry_price),
        }),
        _ => None,
    };

    EntryDecision {
        signal: if plan.is_some() {
            SignalAction::Buy
        } else {
            SignalAction::NoSignal
        },
        trace: trace.steps,
        plan,
        index_ok,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExitContext {
    pub holding_days: u32,
    pub initial_stop: Option<f64>,
    pub index_bear: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub step: DecisionTraceStep,
}

fn exit_step(check: &str, threshold: String, actual: String) -> DecisionTraceStep {
    DecisionTraceStep {
        step_name: "Exit".to_string(),
        check_description: check.to_string(),
        threshold,
        actual_value: actual,
        passed: TraceOutcome::Passed,
        reason: String::new(),
    }
}

/// First matching exit rule for a held position, in priority order:
/// index bear, panic stop, stop, time, target, channel break.
///
/// Stop rules look at the same bar's low/close that triggers the exit order,
/// which executes at the next open. Without a channel only the index, stop
/// and time rules apply.
pub fn evaluate_exit(
    series: &PriceSeries,
    i: usize,
    env: Option<&ChannelEnvironment>,
    config: &ChannelConfig,
    ctx: &ExitContext,
) -> Option<ExitDecision> {
    let high = series.highs[i];
    let low = series.lows[i];
    let close = series.closes[i];

    if config.index_bear_exit && ctx.index_bear == Some(true) {
        return Some(ExitDecision {
            reason: ExitReason::IndexBear,
            step: exit_step("Index bear", "bear".to_string(), "bear".to_string()),
        });
    }

    if let Some(stop) = ctx.initial_stop {
        let panic_eps = config.stop_loss_panic_eps.max(0.0);
        let panic_price = stop * (1.0 - panic_eps);
        if panic_eps > 0.0 && low <= panic_price {
            return Some(ExitDecision {
                reason: ExitReason::PanicStopLoss,
                step: exit_step(
                    "Panic stop",
                    format!("<={:.2}", panic_price),
                    format!("{:.2}", low),
                ),
            });
        }
        if config.stop_loss_on_close {
            if close <= stop {
                return Some(ExitDecision {
                    reason: ExitReason::StopLoss,
                    step: exit_step(
                        "Close <= stop",
                        format!("<={:.2}", stop),
                        format!("{:.2}", close),
                    ),
                });
            }
        } else if low <= stop {
            return Some(ExitDecision {
                reason: ExitReason::StopLoss,
                step: exit_step("Low <= stop", format!("<={:.2}", stop), format!("{:.2}", low)),
            });
        }
    }

    let max_days = config.max_holding_days.max(1);
    if ctx.holding_days >= max_days {
        return Some(ExitDecision {
            reason: ExitReason::TimeExit,
            step: exit_step(
                "Holding days",
                format!(">={}", max_days),
                ctx.holding_days.to_string(),
            ),
        });
    }

    // Target and channel break need a channel for today.
    let env = env?;
    let target = config.sell_target_price(env.mid, env.upper);
    if high >= target {
        return Some(ExitDecision {
            reason: ExitReason::TargetHit,
            step: exit_step(
                "High >= target",
                format!(">={:.2}", target),
                format!("{:.2}", high),
            ),
        });
    }

    let break_price = env.lower * (1.0 - config.channel_break_eps.max(0.0));
    if close < break_price {
        return Some(ExitDecision {
            reason: ExitReason::ChannelBreak,
            step: exit_step(
                "Close < break",
                format!("<{:.2}", break_price),
                format!("{:.2}", close),
            ),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(mid: f64, half_width: f64) -> ChannelEnvironment {
        ChannelEnvironment {
            mid,
            lower: mid - half_width,
            upper: mid + half_width,
            slope_norm: 0.0,
            vol_ratio: 0.8,
            pivot_index: Some(5),
            anchor_index: 5,
            pivot_price: mid - half_width,
            pivot_is_significant: true,
            window_start: 0,
            decision_trace: Vec::new(),
        }
    }

    fn single_bar_series(open: f64, high: f64, low: f64, close: f64, len: usize) -> PriceSeries {
        PriceSeries {
            opens: vec![open; len],
            highs: vec![high; len],
            lows: vec![low; len],
            closes: vec![close; len],
            volumes: vec![1000.0; len],
        }
    }

    fn open_gate_config() -> ChannelConfig {
        ChannelConfig {
            require_index_condition: false,
            pivot_confirm_days: 0,
            buy_touch_eps: 0.01,
            max_position_pct: 0.5,
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn trace_has_one_step_per_gate_even_when_early_gate_fails() {
        let series = single_bar_series(95.5, 96.5, 95.0, 96.0, 10);
        let environment = env(100.0, 5.0);
        let mut ctx = EntryContext::standalone("T");
        ctx.open_positions = 5;
        let decision = evaluate_entry(&series, 9, &environment, &open_gate_config(), &ctx);
        assert_eq!(decision.signal, SignalAction::NoSignal);
        assert_eq!(decision.trace.len(), 22);
        assert_eq!(decision.first_failure().unwrap().step_name, "MaxPositions");
        let touch = decision
            .trace
            .iter()
            .find(|s| s.step_name == "TouchLower")
            .unwrap();
        assert_eq!(touch.passed, TraceOutcome::Passed);
    }

    #[test]
    fn unconfigured_gates_are_not_applicable() {
        let series = single_bar_series(95.5, 96.5, 95.0, 96.0, 10);
        let decision = evaluate_entry(
            &series,
            9,
            &env(100.0, 5.0),
            &open_gate_config(),
            &EntryContext::standalone("T"),
        );
        for name in ["IndexFilter", "IndexMA", "Rebound", "CandleColor", "TrendMA", "PivotDays"] {
            let step = decision
                .trace
                .iter()
                .find(|s| s.step_name == name)
                .unwrap();
            assert_eq!(step.passed, TraceOutcome::NotApplicable, "{}", name);
        }
    }

    #[test]
    fn all_gates_passing_produces_sized_buy() {
        let series = single_bar_series(95.5, 96.5, 95.0, 96.0, 10);
        let config = open_gate_config();
        let decision = evaluate_entry(
            &series,
            9,
            &env(100.0, 5.0),
            &config,
            &EntryContext::standalone("T"),
        );
        assert_eq!(decision.signal, SignalAction::Buy, "{:?}", decision.first_failure());
        let plan = decision.plan.unwrap();
        assert!((plan.entry_price - 96.0 * 1.002).abs() < 1e-9);
        assert!((plan.target_price - 100.5).abs() < 1e-9);
        assert!((plan.initial_stop - plan.entry_price * 0.97).abs() < 1e-9);
        assert_eq!(plan.quantity % 100, 0);
        assert!(plan.quantity as f64 * plan.entry_price <= 500_000.0);
        assert_eq!(plan.limit_price, Some(plan.entry_price));
    }

    #[test]
    fn bear_index_blocks_entry_when_required() {
        let series = single_bar_series(95.5, 96.5, 95.0, 96.0, 10);
        let mut config = open_gate_config();
        config.require_index_condition = true;
        let mut ctx = EntryContext::standalone("T");
        ctx.index_bear = Some(true);
        let decision = evaluate_entry(&series, 9, &env(100.0, 5.0), &config, &ctx);
        assert_eq!(decision.signal, SignalAction::NoSignal);
        assert!(!decision.index_ok);
        let confirm = decision
            .trace
            .iter()
            .find(|s| s.step_name == "IndexConfirm")
            .unwrap();
        assert_eq!(confirm.passed, TraceOutcome::Failed);
    }

    #[test]
    fn stop_loss_on_close_ignores_intraday_touch() {
        let config = ChannelConfig {
            stop_loss_panic_eps: 0.0,
            ..ChannelConfig::default()
        };
        let ctx = ExitContext {
            holding_days: 1,
            initial_stop: Some(97.0),
            index_bear: None,
        };
        let environment = env(100.0, 5.0);

        let touched = single_bar_series(98.0, 98.5, 96.5, 97.5, 1);
        assert!(evaluate_exit(&touched, 0, Some(&environment), &config, &ctx).is_none());

        let closed_below = single_bar_series(98.0, 98.5, 96.5, 96.9, 1);
        let exit = evaluate_exit(&closed_below, 0, Some(&environment), &config, &ctx).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);

        let intraday = ChannelConfig {
            stop_loss_on_close: false,
            ..config
        };
        let exit = evaluate_exit(&touched, 0, Some(&environment), &intraday, &ctx).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
    }

    #[test]
    fn exit_priority_order() {
        let config = ChannelConfig::default();
        let environment = env(100.0, 5.0);
        let crash = single_bar_series(96.0, 101.0, 90.0, 92.0, 1);

        let bear = ExitContext {
            holding_days: 30,
            initial_stop: Some(97.0),
            index_bear: Some(true),
        };
        let exit = evaluate_exit(&crash, 0, Some(&environment), &config, &bear).unwrap();
        assert_eq!(exit.reason, ExitReason::IndexBear);

        let no_bear = ExitContext {
            index_bear: Some(false),
            ..bear
        };
        let exit = evaluate_exit(&crash, 0, Some(&environment), &config, &no_bear).unwrap();
        assert_eq!(exit.reason, ExitReason::PanicStopLoss);

        let calm = single_bar_series(99.0, 99.5, 98.5, 99.0, 1);
        let exit = evaluate_exit(&calm, 0, Some(&environment), &config, &no_bear).unwrap();
        assert_eq!(exit.reason, ExitReason::TimeExit);

        let fresh = ExitContext {
            holding_days: 2,
            ..no_bear
        };
        let spike = single_bar_series(99.0, 100.6, 98.5, 99.0, 1);
        let exit = evaluate_exit(&spike, 0, Some(&environment), &config, &fresh).unwrap();
        assert_eq!(exit.reason, ExitReason::TargetHit);

        let no_stop = ExitContext {
            initial_stop: None,
            ..fresh
        };
        let breakdown = single_bar_series(94.0, 94.5, 92.0, 92.5, 1);
        let exit = evaluate_exit(&breakdown, 0, Some(&environment), &config, &no_stop).unwrap();
        assert_eq!(exit.reason, ExitReason::ChannelBreak);

        assert!(evaluate_exit(&calm, 0, Some(&environment), &config, &fresh).is_none());
    }
}
