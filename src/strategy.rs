use anyhow::{Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

use crate::backtest::Side;
use crate::bars::Bar;
use crate::indicators::{ema, first_defined, rolling_ma};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Fast/slow SMA crossover on close, long only
    SmaCross,
    /// EMA trend filter plus OBI threshold entries with stop-loss/take-profit
    TrendObi,
}

/// What the strategy sees on each bar.
#[derive(Debug, Clone, Copy)]
pub struct BarContext<'a> {
    pub index: usize,
    pub bars: &'a [Bar],
    pub position: Option<Side>,
}

impl BarContext<'_> {
    pub fn bar(&self) -> &Bar {
        &self.bars[self.index]
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }
}

/// Instruction handed to the broker; entries may carry stop-loss/take-profit prices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Order {
    Buy { sl: Option<f64>, tp: Option<f64> },
    Sell { sl: Option<f64>, tp: Option<f64> },
    Close,
}

pub trait Strategy {
    fn name(&self) -> &str;

    /// Precompute indicators over the full bar set.
    fn init(&mut self, bars: &[Bar]) -> Result<()>;

    /// First bar index `next` is called for. Only meaningful after `init`.
    fn warmup(&self) -> usize;

    fn next(&mut self, ctx: &BarContext<'_>) -> Option<Order>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmaCrossParams {
    pub fast: usize,
    pub slow: usize,
}

impl Default for SmaCrossParams {
    fn default() -> Self {
        Self { fast: 5, slow: 20 }
    }
}

impl fmt::Display for SmaCrossParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fast={} slow={}", self.fast, self.slow)
    }
}

/// Long while the fast SMA sits above the slow one.
#[derive(Debug, Clone, Default)]
pub struct SmaCross {
    params: SmaCrossParams,
    fast_ma: Vec<Option<f64>>,
    slow_ma: Vec<Option<f64>>,
    start: usize,
}

impl SmaCross {
    pub fn new(params: SmaCrossParams) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }
}

impl Strategy for SmaCross {
    fn name(&self) -> &str {
        "SmaCross"
    }

    fn init(&mut self, bars: &[Bar]) -> Result<()> {
        if self.params.fast == 0 || self.params.slow == 0 {
            bail!("SMA periods must be positive ({})", self.params);
        }
        let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
        self.fast_ma = rolling_ma(&close, self.params.fast);
        self.slow_ma = rolling_ma(&close, self.params.slow);
        self.start = first_defined(&[&self.fast_ma, &self.slow_ma])
            .map(|i| i + 1)
            .unwrap_or(bars.len());
        Ok(())
    }

    fn warmup(&self) -> usize {
        self.start
    }

    fn next(&mut self, ctx: &BarContext<'_>) -> Option<Order> {
        let (fast, slow) = (self.fast_ma[ctx.index]?, self.slow_ma[ctx.index]?);
        if fast > slow && ctx.is_flat() {
            Some(Order::Buy { sl: None, tp: None })
        } else if fast < slow && !ctx.is_flat() {
            Some(Order::Close)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendObiParams {
    pub ema_period: usize,
    pub obi_threshold: f64,
    pub sl_percent: f64,
    pub tp_percent: f64,
}

impl Default for TrendObiParams {
    fn default() -> Self {
        Self {
            ema_period: 200,
            obi_threshold: 0.1,
            sl_percent: 0.0005,
            tp_percent: 0.001,
        }
    }
}

impl fmt::Display for TrendObiParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ema_period={} obi_threshold={} sl_percent={} tp_percent={}",
            self.ema_period, self.obi_threshold, self.sl_percent, self.tp_percent
        )
    }
}

/// OBI scalper gated by a long EMA regime filter.
///
/// Flat only: above the EMA it takes longs when OBI exceeds the threshold,
/// below the EMA it takes shorts when OBI is under the negated threshold.
/// Every entry carries a stop-loss and take-profit placed around the signal close.
#[derive(Debug, Clone, Default)]
pub struct TrendObiScalper {
    params: TrendObiParams,
    trend_ema: Vec<f64>,
    obi: Option<Vec<f64>>,
}

impl TrendObiScalper {
    pub fn new(params: TrendObiParams) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }
}

impl Strategy for TrendObiScalper {
    fn name(&self) -> &str {
        "TrendObiScalper"
    }

    fn init(&mut self, bars: &[Bar]) -> Result<()> {
        if self.params.ema_period == 0 {
            bail!("ema_period must be positive");
        }
        let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
        self.trend_ema = ema(&close, self.params.ema_period);
        self.obi = bars.iter().map(|b| b.obi).collect::<Option<Vec<f64>>>();
        if self.obi.is_none() {
            error!("OBI column not found in bars; strategy will not trade");
        }
        Ok(())
    }

    fn warmup(&self) -> usize {
        1
    }

    fn next(&mut self, ctx: &BarContext<'_>) -> Option<Order> {
        if !ctx.is_flat() {
            return None;
        }
        let obi = self.obi.as_ref()?[ctx.index];
        let close = ctx.bar().close;
        let trend = self.trend_ema[ctx.index];
        let p = &self.params;

        if close > trend && obi > p.obi_threshold {
            Some(Order::Buy {
                sl: Some(close * (1.0 - p.sl_percent)),
                tp: Some(close * (1.0 + p.tp_percent)),
            })
        } else if close < trend && obi < -p.obi_threshold {
            Some(Order::Sell {
                sl: Some(close * (1.0 + p.sl_percent)),
                tp: Some(close * (1.0 - p.tp_percent)),
            })
        } else {
            None
        }
    }
}

pub fn build_strategy(
    kind: StrategyKind,
    sma: SmaCrossParams,
    trend_obi: TrendObiParams,
) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::SmaCross => Box::new(SmaCross::new(sma)),
        StrategyKind::TrendObi => Box::new(TrendObiScalper::new(trend_obi)),
    }
}
