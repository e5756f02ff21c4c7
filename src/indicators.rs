use crate::config::INDEX_MA_PERIODS;
use crate::models::Bar;
use chrono::NaiveDate;
use statrs::statistics::Statistics;
use std::collections::HashMap;

/// Rolling simple moving average; `None` until `period` values are available.
pub fn calculate_sma_series(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; prices.len()];
    }

    let mut out = Vec::with_capacity(prices.len());
    let mut window_sum = 0.0;
    for (i, price) in prices.iter().enumerate() {
        window_sum += price;
        if i >= period {
            window_sum -= prices[i - period];
        }
        if i + 1 >= period {
            out.push(Some(window_sum / period as f64));
        } else {
            out.push(None);
        }
    }
    out
}

/// Mean of the `period` values ending at `end` (inclusive).
pub fn sma_at(prices: &[f64], end: usize, period: usize) -> Option<f64> {
    if period == 0 || end >= prices.len() || end + 1 < period {
        return None;
    }
    let window = &prices[end + 1 - period..=end];
    Some(window.iter().sum::<f64>() / period as f64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolatilityRatio {
    pub short_vol: f64,
    pub long_vol: f64,
    pub ratio: f64,
}

/// Short-window over long-window sample standard deviation of daily returns.
pub fn calculate_volatility_ratio(
    closes: &[f64],
    short_window: usize,
    long_window: usize,
) -> Option<VolatilityRatio> {
    let short_window = short_window.max(1);
    let long_window = long_window.max(1);
    if closes.len() < long_window + 1 {
        return None;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .map(|pair| pair[1] / pair[0].max(1e-12) - 1.0)
        .collect();
    if returns.len() < short_window.max(long_window) {
        return None;
    }

    let sample_std = |values: &[f64]| {
        if values.len() > 1 {
            values.iter().std_dev()
        } else {
            0.0
        }
    };
    let short_vol = sample_std(&returns[returns.len() - short_window..]);
    let long_vol = sample_std(&returns[returns.len() - long_window..]);
    let ratio = if long_vol == 0.0 {
        1.0
    } else {
        short_vol / long_vol
    };

    Some(VolatilityRatio {
        short_vol,
        long_vol,
        ratio,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexDay {
    pub close: f64,
    /// MA30 > MA20 > MA10 > MA5; `None` during warmup.
    pub bear: Option<bool>,
    pub trend_ma: Option<f64>,
}

/// Benchmark index state keyed by date.
#[derive(Debug, Clone, Default)]
pub struct IndexRegime {
    days: HashMap<NaiveDate, IndexDay>,
}

impl IndexRegime {
    pub fn from_bars(index_bars: &[Bar], trend_ma_period: usize) -> Self {
        let mut sorted: Vec<&Bar> = index_bars.iter().collect();
        sorted.sort_by_key(|bar| bar.date);
        let closes: Vec<f64> = sorted.iter().map(|bar| bar.close).collect();

        let ma: Vec<Vec<Option<f64>>> = INDEX_MA_PERIODS
            .iter()
            .map(|&period| calculate_sma_series(&closes, period))
            .collect();
        let trend = calculate_sma_series(&closes, trend_ma_period);

        let mut days = HashMap::with_capacity(sorted.len());
        for (i, bar) in sorted.iter().enumerate() {
            let bear = match (ma[0][i], ma[1][i], ma[2][i], ma[3][i]) {
                (Some(ma5), Some(ma10), Some(ma20), Some(ma30)) => {
                    Some(ma30 > ma20 && ma20 > ma10 && ma10 > ma5)
                }
                _ => None,
            };
            days.insert(
                bar.date,
                IndexDay {
                    close: bar.close,
                    bear,
                    trend_ma: trend[i],
                },
            );
        }
        Self { days }
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn day(&self, date: NaiveDate) -> Option<&IndexDay> {
        self.days.get(&date)
    }

    pub fn is_bear(&self, date: NaiveDate) -> Option<bool> {
        self.days.get(&date).and_then(|day| day.bear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_bar(day: i64, close: f64) -> Bar {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        Bar {
            symbol: "000300.SH".to_string(),
            date: base + chrono::Duration::days(day),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn sma_series_warms_up() {
        let values = calculate_sma_series(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(values, vec![None, Some(1.5), Some(2.5), Some(3.5)]);
        assert!(calculate_sma_series(&[1.0, 2.0], 0)
            .iter()
            .all(|v| v.is_none()));
    }

    #[test]
    fn sma_at_matches_series() {
        let prices = [3.0, 5.0, 7.0, 9.0, 11.0];
        assert_eq!(sma_at(&prices, 4, 3), Some(9.0));
        assert_eq!(sma_at(&prices, 1, 3), None);
    }

    #[test]
    fn volatility_ratio_requires_history() {
        let closes: Vec<f64> = (0..20).map(|i| 10.0 + i as f64 * 0.1).collect();
        assert!(calculate_volatility_ratio(&closes, 5, 20).is_none());
    }

    #[test]
    fn volatility_ratio_flat_series_is_one() {
        let closes = vec![10.0; 30];
        let ratio = calculate_volatility_ratio(&closes, 5, 20).unwrap();
        assert_eq!(ratio.ratio, 1.0);
    }

    #[test]
    fn volatility_ratio_detects_calm_tail() {
        let mut closes = Vec::new();
        let mut price = 10.0;
        for i in 0..16 {
            price *= if i % 2 == 0 { 1.05 } else { 0.95 };
            closes.push(price);
        }
        for _ in 0..6 {
            price *= 1.001;
            closes.push(price);
        }
        let ratio = calculate_volatility_ratio(&closes, 5, 20).unwrap();
        assert!(ratio.ratio < 0.5, "ratio was {}", ratio.ratio);
    }

    #[test]
    fn falling_index_is_bear_after_warmup() {
        let bars: Vec<Bar> = (0..40).map(|i| index_bar(i, 100.0 - i as f64)).collect();
        let regime = IndexRegime::from_bars(&bars, 0);
        assert_eq!(regime.is_bear(bars[10].date), None);
        assert_eq!(regime.is_bear(bars[35].date), Some(true));

        let rising: Vec<Bar> = (0..40).map(|i| index_bar(i, 100.0 + i as f64)).collect();
        let regime = IndexRegime::from_bars(&rising, 10);
        assert_eq!(regime.is_bear(rising[35].date), Some(false));
        assert!(regime.day(rising[35].date).unwrap().trend_ma.is_some());
    }
}
