use crate::models::*;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::collections::BTreeMap;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const PROFIT_FACTOR_CAP: f64 = 999.0;
const TAIL_RATIO_MIN_RETURNS: usize = 10;

/// Gross profit over gross loss, with explicit variants for the cases where
/// the ratio does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProfitFactor {
    Finite(f64),
    /// Winning trades but no losing ones.
    Infinite,
    /// No trades at all.
    Undefined,
}

impl ProfitFactor {
    pub fn as_score_value(&self) -> f64 {
        match self {
            ProfitFactor::Finite(value) => value.min(PROFIT_FACTOR_CAP),
            ProfitFactor::Infinite => PROFIT_FACTOR_CAP,
            ProfitFactor::Undefined => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownInfo {
    pub max_drawdown: f64,
    pub peak_index: usize,
    pub trough_index: usize,
    pub recovery_index: Option<usize>,
    pub peak_date: Option<NaiveDate>,
    pub trough_date: Option<NaiveDate>,
    pub recovery_date: Option<NaiveDate>,
    /// Trading days from the peak to recovery, or to the end of the curve
    /// when the drawdown never recovered.
    pub duration_days: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub trading_days: usize,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub total_return: f64,
    pub annualized_return: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
    pub drawdown: DrawdownInfo,
    pub volatility: f64,
    pub downside_volatility: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub trade_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub profit_factor: ProfitFactor,
    pub expectancy: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub avg_r_multiple: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub max_win_streak: usize,
    pub max_loss_streak: usize,
    pub profitable_days: usize,
    pub losing_days: usize,
    pub best_day: f64,
    pub worst_day: f64,
    /// 95th percentile daily return over the absolute 5th percentile.
    pub tail_ratio: f64,
    pub monthly_returns: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReasonStats {
    pub reason: ExitReason,
    pub count: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterRejectionStats {
    /// Flat-day evaluations that had a channel to test against.
    pub evaluated: usize,
    pub rejected: usize,
    /// First failed gate per rejected evaluation.
    pub by_step: BTreeMap<String, usize>,
}

impl FilterRejectionStats {
    pub fn rejection_rate(&self) -> f64 {
        if self.evaluated == 0 {
            0.0
        } else {
            self.rejected as f64 / self.evaluated as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedGateRecord {
    pub date: NaiveDate,
    pub symbol: String,
    pub step: String,
    pub threshold: String,
    pub actual: String,
    pub reason: String,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn compute(equity_curve: &[EquityPoint], trades: &[Trade]) -> Metrics {
        let equities: Vec<f64> = equity_curve.iter().map(|point| point.equity).collect();
        let trading_days = equities.len();
        let initial_equity = equities.first().copied().unwrap_or(0.0);
        let final_equity = equities.last().copied().unwrap_or(initial_equity);

        let total_return = if initial_equity > 0.0 {
            final_equity / initial_equity - 1.0
        } else {
            0.0
        };
        let annualized_return = Self::annualized_return(total_return, trading_days);
        let cagr = Self::calculate_cagr(initial_equity, final_equity, trading_days);
        let drawdown = Self::calculate_max_drawdown(equity_curve);

        let returns = Self::daily_returns(&equities);
        let (volatility, sharpe) = Self::calculate_sharpe_ratio(&returns);
        let (downside_volatility, sortino) = Self::calculate_sortino_ratio(&returns);
        let calmar = if drawdown.max_drawdown > 0.0 {
            annualized_return / drawdown.max_drawdown
        } else {
            0.0
        };

        let trade_count = trades.len();
        let winning_pnls: Vec<f64> = trades
            .iter()
            .filter(|trade| trade.return_rate > 0.0)
            .map(|trade| trade.pnl)
            .collect();
        let losing_pnls: Vec<f64> = trades
            .iter()
            .filter(|trade| trade.return_rate < 0.0)
            .map(|trade| trade.pnl)
            .collect();
        let win_rate = if trade_count > 0 {
            winning_pnls.len() as f64 / trade_count as f64
        } else {
            0.0
        };

        let gross_profit: f64 = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).sum();
        let gross_loss: f64 = trades.iter().map(|t| t.pnl).filter(|p| *p < 0.0).sum();
        let profit_factor = if trade_count == 0 {
            ProfitFactor::Undefined
        } else if gross_loss < 0.0 {
            ProfitFactor::Finite(gross_profit / gross_loss.abs())
        } else if gross_profit > 0.0 {
            ProfitFactor::Infinite
        } else {
            ProfitFactor::Finite(0.0)
        };

        let trade_returns: Vec<f64> = trades.iter().map(|trade| trade.return_rate).collect();
        let r_multiples: Vec<f64> = trades.iter().filter_map(|trade| trade.r_multiple).collect();
        let (max_win_streak, max_loss_streak) = Self::streaks(trades);

        let best_day = returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let worst_day = returns.iter().copied().fold(f64::INFINITY, f64::min);

        Metrics {
            trading_days,
            initial_equity,
            final_equity,
            total_return,
            annualized_return,
            cagr,
            max_drawdown: drawdown.max_drawdown,
            drawdown,
            volatility,
            downside_volatility,
            sharpe,
            sortino,
            calmar,
            trade_count,
            winning_trades: winning_pnls.len(),
            losing_trades: losing_pnls.len(),
            win_rate,
            profit_factor,
            expectancy: Self::average(&trade_returns),
            avg_win: Self::average(&winning_pnls),
            avg_loss: Self::average(&losing_pnls),
            avg_r_multiple: Self::average(&r_multiples),
            largest_win: winning_pnls.iter().copied().fold(0.0, f64::max),
            largest_loss: losing_pnls.iter().copied().fold(0.0, f64::min),
            max_win_streak,
            max_loss_streak,
            profitable_days: returns.iter().filter(|r| **r > 0.0).count(),
            losing_days: returns.iter().filter(|r| **r < 0.0).count(),
            best_day: if best_day.is_finite() { best_day } else { 0.0 },
            worst_day: if worst_day.is_finite() { worst_day } else { 0.0 },
            tail_ratio: Self::calculate_tail_ratio(&returns),
            monthly_returns: Self::monthly_returns(equity_curve),
        }
    }

    fn annualized_return(total_return: f64, trading_days: usize) -> f64 {
        if trading_days == 0 {
            return 0.0;
        }
        let growth = 1.0 + total_return;
        if growth <= 0.0 {
            return -1.0;
        }
        growth.powf(TRADING_DAYS_PER_YEAR / trading_days as f64) - 1.0
    }

    fn calculate_cagr(initial_equity: f64, final_equity: f64, trading_days: usize) -> f64 {
        if initial_equity <= 0.0 || !final_equity.is_finite() || trading_days < 2 {
            return 0.0;
        }
        let years = (trading_days - 1) as f64 / TRADING_DAYS_PER_YEAR;
        let ratio = final_equity / initial_equity;
        if ratio <= 0.0 {
            return -1.0;
        }
        ratio.powf(1.0 / years) - 1.0
    }

    fn daily_returns(equities: &[f64]) -> Vec<f64> {
        equities
            .windows(2)
            .map(|pair| {
                if pair[0] > 0.0 {
                    pair[1] / pair[0] - 1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn average(values: &[f64]) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    fn sample_std(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let std = values.std_dev();
        if std.is_finite() {
            std
        } else {
            0.0
        }
    }

    /// Annualized volatility and Sharpe ratio (no risk-free rate).
    pub fn calculate_sharpe_ratio(returns: &[f64]) -> (f64, f64) {
        let std_dev = Self::sample_std(returns);
        if std_dev == 0.0 {
            return (0.0, 0.0);
        }
        let mean_return = returns.mean();
        let annualizer = TRADING_DAYS_PER_YEAR.sqrt();
        (std_dev * annualizer, mean_return / std_dev * annualizer)
    }

    /// Annualized downside volatility over the negative daily returns and the
    /// Sortino ratio built on it.
    pub fn calculate_sortino_ratio(returns: &[f64]) -> (f64, f64) {
        let negative: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside = Self::sample_std(&negative);
        if downside == 0.0 {
            return (0.0, 0.0);
        }
        let annualizer = TRADING_DAYS_PER_YEAR.sqrt();
        (
            downside * annualizer,
            Self::average(returns) / downside * annualizer,
        )
    }

    /// Zero with fewer than ten returns or a zero left tail.
    pub fn calculate_tail_ratio(returns: &[f64]) -> f64 {
        if returns.len() < TAIL_RATIO_MIN_RETURNS {
            return 0.0;
        }
        let mut data = Data::new(returns.to_vec());
        let right = data.percentile(95);
        let left = data.percentile(5);
        if left == 0.0 || !left.is_finite() || !right.is_finite() {
            return 0.0;
        }
        (right / left).abs()
    }

    pub fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> DrawdownInfo {
        let mut info = DrawdownInfo {
            max_drawdown: 0.0,
            peak_index: 0,
            trough_index: 0,
            recovery_index: None,
            peak_date: None,
            trough_date: None,
            recovery_date: None,
            duration_days: 0,
        };
        if equity_curve.is_empty() {
            return info;
        }

        let mut peak_value = equity_curve[0].equity;
        let mut peak_index = 0;
        for (i, point) in equity_curve.iter().enumerate() {
            if point.equity > peak_value {
                peak_value = point.equity;
                peak_index = i;
                continue;
            }
            if peak_value <= 0.0 {
                continue;
            }
            let drawdown = (peak_value - point.equity) / peak_value;
            if drawdown > info.max_drawdown {
                info.max_drawdown = drawdown;
                info.peak_index = peak_index;
                info.trough_index = i;
            }
        }

        if info.max_drawdown > 0.0 {
            let peak_equity = equity_curve[info.peak_index].equity;
            info.recovery_index = equity_curve
                .iter()
                .enumerate()
                .skip(info.trough_index + 1)
                .find(|(_, point)| point.equity >= peak_equity)
                .map(|(i, _)| i);
            let end = info.recovery_index.unwrap_or(equity_curve.len() - 1);
            info.duration_days = end - info.peak_index;
            info.peak_date = Some(equity_curve[info.peak_index].date);
            info.trough_date = Some(equity_curve[info.trough_index].date);
            info.recovery_date = info.recovery_index.map(|i| equity_curve[i].date);
        }
        info
    }

    /// Longest runs of winning and losing trades in exit order. A flat trade
    /// ends both runs.
    fn streaks(trades: &[Trade]) -> (usize, usize) {
        let mut max_win = 0;
        let mut max_loss = 0;
        let mut win = 0;
        let mut loss = 0;
        for trade in trades {
            if trade.return_rate > 0.0 {
                win += 1;
                loss = 0;
            } else if trade.return_rate < 0.0 {
                loss += 1;
                win = 0;
            } else {
                win = 0;
                loss = 0;
            }
            max_win = max_win.max(win);
            max_loss = max_loss.max(loss);
        }
        (max_win, max_loss)
    }

    /// Month-end equity over the previous month-end; the first month is
    /// measured from the first point of the curve.
    fn monthly_returns(equity_curve: &[EquityPoint]) -> BTreeMap<String, f64> {
        let mut month_ends: BTreeMap<String, f64> = BTreeMap::new();
        for point in equity_curve {
            let key = format!("{:04}-{:02}", point.date.year(), point.date.month());
            month_ends.insert(key, point.equity);
        }

        let mut out = BTreeMap::new();
        let mut previous = equity_curve.first().map(|point| point.equity);
        for (month, equity) in month_ends {
            if let Some(base) = previous {
                if base > 0.0 {
                    out.insert(month, equity / base - 1.0);
                }
            }
            previous = Some(equity);
        }
        out
    }
}

pub fn exit_reason_breakdown(trades: &[Trade]) -> Vec<ExitReasonStats> {
    let mut grouped: BTreeMap<ExitReason, Vec<&Trade>> = BTreeMap::new();
    for trade in trades {
        grouped.entry(trade.exit_reason).or_default().push(trade);
    }
    grouped
        .into_iter()
        .map(|(reason, group)| {
            let count = group.len();
            let wins = group.iter().filter(|trade| trade.is_winner()).count();
            ExitReasonStats {
                reason,
                count,
                win_rate: wins as f64 / count as f64,
                avg_pnl: group.iter().map(|trade| trade.pnl).sum::<f64>() / count as f64,
            }
        })
        .collect()
}

pub fn filter_rejection_stats(logs: &[SignalLog]) -> FilterRejectionStats {
    let mut stats = FilterRejectionStats::default();
    for log in logs {
        if log.has_position || log.trace.is_empty() {
            continue;
        }
        stats.evaluated += 1;
        if !log.is_rejected_entry() {
            continue;
        }
        stats.rejected += 1;
        let step = log
            .first_failed_step()
            .map(|step| step.step_name.clone())
            .unwrap_or_else(|| "OrderRejected".to_string());
        *stats.by_step.entry(step).or_insert(0) += 1;
    }
    stats
}

/// Every failed gate of every flat-day evaluation, not only the first.
pub fn failed_gate_records(logs: &[SignalLog]) -> Vec<FailedGateRecord> {
    logs.iter()
        .filter(|log| !log.has_position)
        .flat_map(|log| {
            log.trace
                .iter()
                .filter(|step| step.passed.is_failed())
                .map(move |step| FailedGateRecord {
                    date: log.date,
                    symbol: log.symbol.clone(),
                    step: step.step_name.clone(),
                    threshold: step.threshold.clone(),
                    actual: step.actual_value.clone(),
                    reason: step.reason.clone(),
                })
        })
        .collect()
}

/// Ranking score for one batch unit.
pub fn unit_score(metrics: &Metrics) -> f64 {
    metrics.sharpe * 20.0 + metrics.annualized_return * 100.0 + metrics.win_rate * 50.0
        - metrics.max_drawdown * 50.0
}

/// Spread of unit scores across date segments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobustScore {
    pub mean: f64,
    /// Population standard deviation; zero for a single segment.
    pub std: f64,
    /// `mean - std`.
    pub robust: f64,
}

pub fn robust_score(scores: &[f64]) -> Option<RobustScore> {
    if scores.is_empty() {
        return None;
    }
    let mean = scores.mean();
    let std = if scores.len() > 1 {
        scores.population_std_dev()
    } else {
        0.0
    };
    Some(RobustScore {
        mean,
        std,
        robust: mean - std,
    })
}
