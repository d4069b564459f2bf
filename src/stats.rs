use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fmt;

use crate::backtest::{ClosedTrade, EquityPoint};
use crate::bars::Bar;

const MS_PER_YEAR: f64 = 365.0 * 86_400_000.0;

/// Performance summary of one backtest run. Undefined ratios are NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(rename = "Start")]
    pub start: DateTime<Utc>,
    #[serde(rename = "End")]
    pub end: DateTime<Utc>,
    #[serde(rename = "Duration")]
    pub duration: String,
    #[serde(rename = "Exposure Time [%]")]
    pub exposure_pct: f64,
    #[serde(rename = "Equity Final [$]")]
    pub equity_final: f64,
    #[serde(rename = "Equity Peak [$]")]
    pub equity_peak: f64,
    #[serde(rename = "Commissions [$]")]
    pub commissions: f64,
    #[serde(rename = "Return [%]")]
    pub return_pct: f64,
    #[serde(rename = "Buy & Hold Return [%]")]
    pub buy_hold_return_pct: f64,
    #[serde(rename = "Return (Ann.) [%]")]
    pub return_ann_pct: f64,
    #[serde(rename = "Volatility (Ann.) [%]")]
    pub volatility_ann_pct: f64,
    #[serde(rename = "Sharpe Ratio")]
    pub sharpe_ratio: f64,
    #[serde(rename = "Max. Drawdown [%]")]
    pub max_drawdown_pct: f64,
    #[serde(rename = "Avg. Drawdown [%]")]
    pub avg_drawdown_pct: f64,
    #[serde(rename = "# Trades")]
    pub num_trades: usize,
    #[serde(rename = "Win Rate [%]")]
    pub win_rate_pct: f64,
    #[serde(rename = "Best Trade [%]")]
    pub best_trade_pct: f64,
    #[serde(rename = "Worst Trade [%]")]
    pub worst_trade_pct: f64,
    #[serde(rename = "Avg. Trade [%]")]
    pub avg_trade_pct: f64,
    #[serde(rename = "Max. Trade Duration")]
    pub max_trade_duration: String,
    #[serde(rename = "Avg. Trade Duration")]
    pub avg_trade_duration: String,
    #[serde(rename = "Profit Factor")]
    pub profit_factor: f64,
    #[serde(rename = "Expectancy [%]")]
    pub expectancy_pct: f64,
    #[serde(rename = "SQN")]
    pub sqn: f64,
}

/// `3 days 04:05:06` style rendering.
pub fn format_duration(d: TimeDelta) -> String {
    let secs = d.num_seconds().max(0);
    let days = secs / 86_400;
    let rem = secs % 86_400;
    format!(
        "{} days {:02}:{:02}:{:02}",
        days,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Median spacing between consecutive bars, in milliseconds.
fn median_spacing_ms(bars: &[Bar]) -> Option<f64> {
    let mut gaps: Vec<i64> = bars
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds())
        .filter(|g| *g > 0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_unstable();
    let mid = gaps.len() / 2;
    let median = if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) as f64 / 2.0
    } else {
        gaps[mid] as f64
    };
    Some(median)
}

/// Deepest drawdown and the mean of each drawdown episode's depth, as fractions.
fn drawdowns(equity: &[f64]) -> (f64, Option<f64>) {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0f64;
    let mut episode = 0.0f64;
    let mut episodes = Vec::new();
    for &e in equity {
        if e >= peak {
            if episode > 0.0 {
                episodes.push(episode);
            }
            episode = 0.0;
            peak = e;
            continue;
        }
        let dd = 1.0 - e / peak;
        episode = episode.max(dd);
        max_dd = max_dd.max(dd);
    }
    if episode > 0.0 {
        episodes.push(episode);
    }
    let avg = (!episodes.is_empty()).then(|| episodes.iter().mean());
    (max_dd, avg)
}

impl Stats {
    pub fn compute(bars: &[Bar], equity: &[EquityPoint], trades: &[ClosedTrade], cash: f64) -> Self {
        let start = bars.first().map(|b| b.timestamp).unwrap_or_default();
        let end = bars.last().map(|b| b.timestamp).unwrap_or_default();

        let values: Vec<f64> = equity.iter().map(|p| p.equity).collect();
        let equity_final = values.last().copied().unwrap_or(cash);
        let equity_peak = values.iter().copied().fold(cash, f64::max);
        let exposure_pct = if equity.is_empty() {
            0.0
        } else {
            equity.iter().filter(|p| p.in_market).count() as f64 / equity.len() as f64 * 100.0
        };

        let buy_hold_return_pct = match (bars.first(), bars.last()) {
            (Some(f), Some(l)) if f.close != 0.0 => (l.close - f.close) / f.close * 100.0,
            _ => f64::NAN,
        };

        let returns: Vec<f64> = values
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect();
        let bars_per_year = median_spacing_ms(bars).map(|ms| MS_PER_YEAR / ms);
        let (return_ann_pct, volatility_ann_pct) = match bars_per_year {
            Some(bpy) if !returns.is_empty() => {
                let growth = (equity_final / cash).max(0.0);
                let ann = (growth.powf(bpy / returns.len() as f64) - 1.0) * 100.0;
                let vol = returns.iter().std_dev() * bpy.sqrt() * 100.0;
                (ann, vol)
            }
            _ => (f64::NAN, f64::NAN),
        };
        let sharpe_ratio = if volatility_ann_pct > 0.0 {
            return_ann_pct / volatility_ann_pct
        } else {
            f64::NAN
        };

        let (max_dd, avg_dd) = drawdowns(&values);

        let num_trades = trades.len();
        let trade_returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
        let win_rate_pct = if num_trades == 0 {
            f64::NAN
        } else {
            wins as f64 / num_trades as f64 * 100.0
        };
        let gross_win: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
        let gross_loss: f64 = pnls.iter().filter(|p| **p < 0.0).sum::<f64>().abs();
        let profit_factor = if num_trades == 0 {
            f64::NAN
        } else if gross_loss == 0.0 {
            f64::INFINITY
        } else {
            gross_win / gross_loss
        };
        let sqn = if num_trades > 1 {
            let sd = pnls.iter().std_dev();
            if sd > 0.0 {
                (num_trades as f64).sqrt() * pnls.iter().mean() / sd
            } else {
                f64::NAN
            }
        } else {
            f64::NAN
        };

        let durations: Vec<TimeDelta> = trades.iter().map(|t| t.exit_time - t.entry_time).collect();
        let max_trade_duration = durations
            .iter()
            .max_by(|a, b| a.cmp(b))
            .map(|d| format_duration(*d))
            .unwrap_or_default();
        let avg_trade_duration = if durations.is_empty() {
            String::new()
        } else {
            let total: TimeDelta = durations.iter().sum();
            format_duration(total / durations.len() as i32)
        };

        Self {
            start,
            end,
            duration: format_duration(end - start),
            exposure_pct,
            equity_final,
            equity_peak,
            commissions: trades.iter().map(|t| t.commission).sum(),
            return_pct: (equity_final - cash) / cash * 100.0,
            buy_hold_return_pct,
            return_ann_pct,
            volatility_ann_pct,
            sharpe_ratio,
            max_drawdown_pct: -max_dd * 100.0,
            avg_drawdown_pct: avg_dd.map_or(f64::NAN, |d| -d * 100.0),
            num_trades,
            win_rate_pct,
            best_trade_pct: trade_returns.iter().copied().fold(f64::NAN, f64::max),
            worst_trade_pct: trade_returns.iter().copied().fold(f64::NAN, f64::min),
            // geometric: compounding every trade's return gives the same total
            avg_trade_pct: (trade_returns.iter().map(|r| (1.0 + r / 100.0).ln()).mean().exp() - 1.0) * 100.0,
            max_trade_duration,
            avg_trade_duration,
            profit_factor,
            expectancy_pct: trade_returns.iter().mean(),
            sqn,
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("Start", self.start.to_string()),
            ("End", self.end.to_string()),
            ("Duration", self.duration.clone()),
            ("Exposure Time [%]", format!("{:.4}", self.exposure_pct)),
            ("Equity Final [$]", format!("{:.4}", self.equity_final)),
            ("Equity Peak [$]", format!("{:.4}", self.equity_peak)),
            ("Commissions [$]", format!("{:.4}", self.commissions)),
            ("Return [%]", format!("{:.4}", self.return_pct)),
            ("Buy & Hold Return [%]", format!("{:.4}", self.buy_hold_return_pct)),
            ("Return (Ann.) [%]", format!("{:.4}", self.return_ann_pct)),
            ("Volatility (Ann.) [%]", format!("{:.4}", self.volatility_ann_pct)),
            ("Sharpe Ratio", format!("{:.4}", self.sharpe_ratio)),
            ("Max. Drawdown [%]", format!("{:.4}", self.max_drawdown_pct)),
            ("Avg. Drawdown [%]", format!("{:.4}", self.avg_drawdown_pct)),
            ("# Trades", self.num_trades.to_string()),
            ("Win Rate [%]", format!("{:.4}", self.win_rate_pct)),
            ("Best Trade [%]", format!("{:.4}", self.best_trade_pct)),
            ("Worst Trade [%]", format!("{:.4}", self.worst_trade_pct)),
            ("Avg. Trade [%]", format!("{:.4}", self.avg_trade_pct)),
            ("Max. Trade Duration", self.max_trade_duration.clone()),
            ("Avg. Trade Duration", self.avg_trade_duration.clone()),
            ("Profit Factor", format!("{:.4}", self.profit_factor)),
            ("Expectancy [%]", format!("{:.4}", self.expectancy_pct)),
            ("SQN", format!("{:.4}", self.sqn)),
        ];
        for (name, value) in rows {
            writeln!(f, "{:<26}{}", name, value)?;
        }
        Ok(())
    }
}
