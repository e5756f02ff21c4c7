use crate::config::ChannelConfig;
use crate::error::InsufficientData;
use crate::models::{Bar, ChannelEnvironment};
use crate::signals::{evaluate_entry, EntryContext, EntryDecision};

/// Column view of one symbol's bars, built once per run.
#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    pub opens: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl PriceSeries {
    pub fn from_bars(bars: &[Bar]) -> Self {
        let mut series = PriceSeries {
            opens: Vec::with_capacity(bars.len()),
            highs: Vec::with_capacity(bars.len()),
            lows: Vec::with_capacity(bars.len()),
            closes: Vec::with_capacity(bars.len()),
            volumes: Vec::with_capacity(bars.len()),
        };
        for bar in bars {
            series.opens.push(bar.open);
            series.highs.push(bar.high);
            series.lows.push(bar.low);
            series.closes.push(bar.close);
            series.volumes.push(bar.volume);
        }
        series
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PivotLow {
    /// Index inside the window passed to `pick_significant_low`.
    pub index: usize,
    pub price: f64,
    pub drop_ratio: f64,
}

/// Least-squares line through `closes` against their index, returned as
/// `(slope, intercept)`. The x values are centred before fitting.
pub fn fit_midline(closes: &[f64]) -> (f64, f64) {
    let n = closes.len();
    if n < 2 {
        return (0.0, closes.last().copied().unwrap_or(0.0));
    }

    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = closes.iter().sum::<f64>() / n as f64;
    let mut denom = 0.0;
    let mut numer = 0.0;
    for (i, y) in closes.iter().enumerate() {
        let xc = i as f64 - x_mean;
        denom += xc * xc;
        numer += xc * (y - y_mean);
    }

    let slope = if denom <= 0.0 { 0.0 } else { numer / denom };
    (slope, y_mean - slope * x_mean)
}

/// Lowest strict local minimum of `lows` that follows a large enough drop and
/// holds for the rebound window. Ties go to the most recent candidate.
pub fn pick_significant_low(lows: &[f64], highs: &[f64], config: &ChannelConfig) -> Option<PivotLow> {
    let k = config.pivot_k.max(1);
    let n = lows.len().min(highs.len());
    if n < 2 * k + 3 {
        return None;
    }

    let drop_min = config.pivot_drop_min.max(0.0);
    let rebound_days = config.pivot_rebound_days.max(1);
    let mut best: Option<PivotLow> = None;

    for j in k..(n - k - 1) {
        let low = lows[j];
        if low <= 0.0 {
            continue;
        }

        let left_min = min_of(&lows[j - k..j]);
        let right_min = min_of(&lows[j + 1..j + 1 + k]);
        if !(low < left_min && low < right_min) {
            continue;
        }

        let prev_peak = max_of(&highs[..=j]);
        if prev_peak <= 0.0 {
            continue;
        }
        let drop_ratio = prev_peak / low - 1.0;
        if drop_ratio < drop_min {
            continue;
        }

        let after_end = (j + 1 + rebound_days).min(n);
        if lows[j + 1..after_end].iter().any(|&later| later <= low) {
            continue;
        }

        if best.map_or(true, |current| low <= current.price) {
            best = Some(PivotLow {
                index: j,
                price: low,
                drop_ratio,
            });
        }
    }

    best
}

/// Channel lines for bar `i` of `series`, without the filter trace.
pub fn get_channel_lines(
    series: &PriceSeries,
    i: usize,
    config: &ChannelConfig,
) -> Result<ChannelEnvironment, InsufficientData> {
    let period = config.effective_period();
    if i >= series.len() || i + 1 < period {
        return Err(InsufficientData {
            required: period,
            available: (i + 1).min(series.len()),
        });
    }

    let start = i + 1 - period;
    let closes = &series.closes[start..=i];
    let highs = &series.highs[start..=i];
    let lows = &series.lows[start..=i];
    let volumes = &series.volumes[start..=i];

    let (slope, intercept) = fit_midline(closes);
    let mid = slope * (period - 1) as f64 + intercept;
    let slope_norm = if mid > 0.0 { slope / mid } else { 0.0 };

    let pivot = pick_significant_low(lows, highs, config);
    let anchor = pivot.map(|p| p.index).unwrap_or_else(|| argmin(lows));
    let pivot_price = lows[anchor];
    let offset = pivot_price - (slope * anchor as f64 + intercept);
    let (lower, upper) = symmetric_band(mid, offset);

    let avg_volume = volumes.iter().sum::<f64>() / volumes.len() as f64;
    let current_volume = volumes[volumes.len() - 1];
    let vol_ratio = if avg_volume > 0.0 {
        current_volume / avg_volume
    } else {
        1.0
    };

    Ok(ChannelEnvironment {
        mid,
        lower,
        upper,
        slope_norm,
        vol_ratio,
        pivot_index: pivot.map(|p| start + p.index),
        anchor_index: start + anchor,
        pivot_price,
        pivot_is_significant: pivot.is_some(),
        window_start: start,
        decision_trace: Vec::new(),
    })
}

/// Channel plus the full entry filter trace for bar `day_index` of a single
/// symbol's history. Runs with a flat book and no index data.
pub fn evaluate(
    symbol: &str,
    day_index: usize,
    bars: &[Bar],
    config: &ChannelConfig,
) -> Result<(ChannelEnvironment, EntryDecision), InsufficientData> {
    let series = PriceSeries::from_bars(bars);
    let mut environment = get_channel_lines(&series, day_index, config)?;
    let context = EntryContext::standalone(symbol);
    let decision = evaluate_entry(&series, day_index, &environment, config, &context);
    environment.decision_trace = decision.trace.clone();
    Ok((environment, decision))
}

/// lower = mid + offset, upper = mid - offset. The wider side is rounded first
/// and the half-width read back from it, so both differences are exact.
fn symmetric_band(mid: f64, offset: f64) -> (f64, f64) {
    if offset <= 0.0 {
        let upper = mid - offset;
        let half = upper - mid;
        (mid - half, upper)
    } else {
        let lower = mid + offset;
        let half = lower - mid;
        (lower, mid - half)
    }
}

fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, value) in values.iter().enumerate() {
        if *value < values[best] {
            best = i;
        }
    }
    best
}

fn min_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn pivot_config(k: usize, drop_min: f64, rebound_days: usize) -> ChannelConfig {
        ChannelConfig {
            pivot_k: k,
            pivot_drop_min: drop_min,
            pivot_rebound_days: rebound_days,
            ..ChannelConfig::default()
        }
    }

    fn series_from_lows(lows: &[f64]) -> PriceSeries {
        let bars: Vec<Bar> = lows
            .iter()
            .enumerate()
            .map(|(i, &low)| Bar {
                symbol: "T".to_string(),
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                open: low * 1.01,
                high: low * 1.02,
                low,
                close: low * 1.01,
                volume: 1000.0 + i as f64,
            })
            .collect();
        PriceSeries::from_bars(&bars)
    }

    #[test]
    fn fit_midline_reproduces_collinear_closes() {
        let closes: Vec<f64> = (0..20).map(|i| 12.5 + 0.75 * i as f64).collect();
        let (slope, intercept) = fit_midline(&closes);
        assert!((slope - 0.75).abs() < 1e-12);
        assert!((intercept - 12.5).abs() < 1e-12);
    }

    #[test]
    fn fit_midline_degenerate_inputs() {
        assert_eq!(fit_midline(&[]), (0.0, 0.0));
        assert_eq!(fit_midline(&[42.0]), (0.0, 42.0));
        let (slope, intercept) = fit_midline(&[5.0, 5.0, 5.0]);
        assert_eq!(slope, 0.0);
        assert!((intercept - 5.0).abs() < 1e-12);
    }

    #[test]
    fn picks_v_shaped_low() {
        let lows = [10.0, 9.9, 9.8, 9.7, 9.5, 9.6, 9.7, 9.8, 9.9, 10.0];
        let highs: Vec<f64> = lows.iter().map(|l| l * 1.02).collect();
        let pivot = pick_significant_low(&lows, &highs, &pivot_config(2, 0.03, 2)).unwrap();
        assert_eq!(pivot.index, 4);
        assert!((pivot.price - 9.5).abs() < 1e-12);
        assert!(pivot.drop_ratio >= 0.03);
    }

    #[test]
    fn immediate_new_low_rejects_pivot() {
        // Local minimum at 4 is undercut two bars later.
        let lows = [10.0, 9.9, 9.8, 9.7, 9.5, 9.6, 9.4, 9.8, 9.9, 10.0, 10.1];
        let highs: Vec<f64> = lows.iter().map(|l| l * 1.02).collect();
        let config = pivot_config(1, 0.03, 2);
        let pivot = pick_significant_low(&lows, &highs, &config);
        assert_eq!(pivot.map(|p| p.index), Some(6));

        let lows = [10.0, 9.9, 9.8, 9.7, 9.5, 9.6, 9.4, 9.3, 9.2, 9.1, 9.0];
        let highs: Vec<f64> = lows.iter().map(|l| l * 1.02).collect();
        assert!(pick_significant_low(&lows, &highs, &config).is_none());
    }

    #[test]
    fn shallow_drop_is_not_significant() {
        let lows = [10.0, 9.99, 9.98, 9.97, 9.96, 9.97, 9.98, 9.99, 10.0, 10.0];
        let highs = lows;
        assert!(pick_significant_low(&lows, &highs, &pivot_config(2, 0.03, 2)).is_none());
    }

    #[test]
    fn ties_prefer_most_recent_candidate() {
        let lows = [10.0, 9.0, 10.0, 10.0, 9.0, 10.0, 10.0, 10.0];
        let highs = [11.0; 8];
        let pivot = pick_significant_low(&lows, &highs, &pivot_config(1, 0.03, 1)).unwrap();
        assert_eq!(pivot.index, 4);
    }

    #[test]
    fn window_too_short_for_pivot() {
        let lows = [10.0, 9.0, 10.0, 11.0];
        let highs = [11.0; 4];
        assert!(pick_significant_low(&lows, &highs, &pivot_config(1, 0.0, 1)).is_none());
    }

    #[test]
    fn channel_requires_full_window() {
        let series = series_from_lows(&[10.0; 15]);
        let config = ChannelConfig::default();
        let err = get_channel_lines(&series, 10, &config).unwrap_err();
        assert_eq!(err.required, 20);
        assert_eq!(err.available, 11);
    }

    #[test]
    fn channel_is_symmetric_around_mid() {
        let lows: Vec<f64> = (0..30)
            .map(|i| 10.0 + ((i as f64) * 0.7).sin() * 0.4 - if i == 18 { 0.5 } else { 0.0 })
            .collect();
        let series = series_from_lows(&lows);
        let config = ChannelConfig::default();
        for i in 19..30 {
            let env = get_channel_lines(&series, i, &config).unwrap();
            assert_eq!(env.upper - env.mid, env.mid - env.lower);
            assert!(env.lower <= env.upper);
        }
    }

    #[test]
    fn flat_series_falls_back_to_window_minimum() {
        let series = series_from_lows(&[10.0; 25]);
        let env = get_channel_lines(&series, 24, &ChannelConfig::default()).unwrap();
        assert!(!env.pivot_is_significant);
        assert_eq!(env.pivot_index, None);
        assert_eq!(env.anchor_index, 5);
        assert!(env.slope_norm.abs() < 1e-12);
    }

    #[test]
    fn vol_ratio_uses_window_average() {
        let mut series = series_from_lows(&[10.0; 20]);
        series.volumes = vec![100.0; 20];
        series.volumes[19] = 200.0;
        let env = get_channel_lines(&series, 19, &ChannelConfig::default()).unwrap();
        assert!((env.vol_ratio - 200.0 / 105.0).abs() < 1e-12);

        series.volumes = vec![0.0; 20];
        let env = get_channel_lines(&series, 19, &ChannelConfig::default()).unwrap();
        assert_eq!(env.vol_ratio, 1.0);
    }
}
