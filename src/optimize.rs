use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use csv::WriterBuilder;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, fs};
use tracing::{error, info};

use crate::backtest::{Backtest, BacktestConfig, BacktestResult};
use crate::bars::{Bar, write_bars_csv};
use crate::stats::Stats;
use crate::strategy::{
    SmaCross, SmaCrossParams, Strategy, StrategyKind, TrendObiParams, TrendObiScalper,
};
use crate::{OptimizeArgs, bars};

/// Statistic the grid search ranks by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Maximize {
    EquityFinal,
    Return,
    Sharpe,
    Sqn,
    WinRate,
}

impl Maximize {
    /// NaN ranks below every real value.
    pub fn score(self, stats: &Stats) -> f64 {
        let v = match self {
            Maximize::EquityFinal => stats.equity_final,
            Maximize::Return => stats.return_pct,
            Maximize::Sharpe => stats.sharpe_ratio,
            Maximize::Sqn => stats.sqn,
            Maximize::WinRate => stats.win_rate_pct,
        };
        if v.is_nan() { f64::NEG_INFINITY } else { v }
    }
}

pub struct Evaluated<P> {
    pub params: P,
    pub score: f64,
    pub stats: Stats,
}

pub struct OptimizeOutcome<P> {
    pub best: P,
    pub best_result: BacktestResult,
    pub evaluated: Vec<Evaluated<P>>,
}

/// Backtest every parameter set and keep the highest-scoring one.
///
/// Failing combinations are logged and skipped; ties keep the earlier combination.
pub fn optimize<P, S, F>(
    bt: &Backtest,
    grid: Vec<P>,
    build: F,
    maximize: Maximize,
) -> Result<OptimizeOutcome<P>>
where
    P: Clone + Display,
    S: Strategy,
    F: Fn(&P) -> S,
{
    if grid.is_empty() {
        bail!("parameter grid is empty");
    }
    info!("optimizing over {} combinations", grid.len());

    let mut best: Option<(P, f64, BacktestResult)> = None;
    let mut evaluated = Vec::with_capacity(grid.len());
    for params in grid {
        let mut strategy = build(&params);
        let result = match bt.run(&mut strategy) {
            Ok(r) => r,
            Err(e) => {
                error!("combination {} failed: {:#}", params, e);
                continue;
            }
        };
        let score = maximize.score(&result.stats);
        evaluated.push(Evaluated {
            params: params.clone(),
            score,
            stats: result.stats.clone(),
        });
        if best.as_ref().is_none_or(|(_, s, _)| score > *s) {
            best = Some((params, score, result));
        }
    }

    let Some((best, _, best_result)) = best else {
        bail!("every parameter combination failed");
    };
    Ok(OptimizeOutcome {
        best,
        best_result,
        evaluated,
    })
}

pub fn sma_grid(fast: &[usize], slow: &[usize]) -> Vec<SmaCrossParams> {
    iproduct!(fast.iter().copied(), slow.iter().copied())
        .filter(|(f, s)| f < s)
        .map(|(fast, slow)| SmaCrossParams { fast, slow })
        .collect()
}

pub fn trend_obi_grid(
    ema_period: &[usize],
    obi_threshold: &[f64],
    sl_percent: &[f64],
    tp_percent: &[f64],
) -> Vec<TrendObiParams> {
    iproduct!(
        ema_period.iter().copied(),
        obi_threshold.iter().copied(),
        sl_percent.iter().copied(),
        tp_percent.iter().copied()
    )
    .map(|(ema_period, obi_threshold, sl_percent, tp_percent)| TrendObiParams {
        ema_period,
        obi_threshold,
        sl_percent,
        tp_percent,
    })
    .collect()
}

#[derive(Serialize)]
struct GridRow {
    params: String,
    score: f64,
    num_trades: usize,
    return_pct: f64,
    equity_final: f64,
    sharpe_ratio: f64,
    max_drawdown_pct: f64,
    win_rate_pct: f64,
    sqn: f64,
}

impl GridRow {
    fn new<P: Display>(e: &Evaluated<P>) -> Self {
        Self {
            params: e.params.to_string(),
            score: e.score,
            num_trades: e.stats.num_trades,
            return_pct: e.stats.return_pct,
            equity_final: e.stats.equity_final,
            sharpe_ratio: e.stats.sharpe_ratio,
            max_drawdown_pct: e.stats.max_drawdown_pct,
            win_rate_pct: e.stats.win_rate_pct,
            sqn: e.stats.sqn,
        }
    }
}

fn report<P: Display>(outcome: &OptimizeOutcome<P>, maximize: Maximize, args: &OptimizeArgs) -> Result<()> {
    let mut ranked: Vec<&Evaluated<P>> = outcome.evaluated.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    println!("Optimization complete ({:?})", maximize);
    println!("{:<70} {:>14} {:>10} {:>10}", "Parameters", "Score", "# Trades", "Return%");
    println!("{}", "-".repeat(107));
    for e in &ranked {
        println!(
            "{:<70} {:>14.4} {:>10} {:>10.4}",
            e.params.to_string(),
            e.score,
            e.stats.num_trades,
            e.stats.return_pct
        );
    }
    println!();
    println!("{}", outcome.best_result.stats);
    println!("--- Best Strategy Parameters ---");
    println!("{} {}", outcome.best_result.strategy, outcome.best);

    fs::create_dir_all(&args.out).with_context(|| format!("create {}", args.out.display()))?;
    let mut wtr = WriterBuilder::new().from_path(args.out.join("grid.csv"))?;
    for e in &ranked {
        wtr.serialize(GridRow::new(e))?;
    }
    wtr.flush()?;
    fs::write(args.out.join("best_params.txt"), format!("{}\n", outcome.best))?;
    outcome.best_result.save(&args.out)
}

pub fn execute(args: &OptimizeArgs) -> Result<()> {
    let bars: Vec<Bar> = bars::load_bars(&args.data)?;
    let bt = Backtest::new(bars, BacktestConfig::from(&args.broker))?;
    write_bars_csv(&args.out.join("bars.csv"), bt.bars())?;

    match args.strategy {
        StrategyKind::SmaCross => {
            let grid = sma_grid(&args.fast, &args.slow);
            let outcome = optimize(&bt, grid, |p| SmaCross::new(*p), args.maximize)?;
            report(&outcome, args.maximize, args)
        }
        StrategyKind::TrendObi => {
            let grid = trend_obi_grid(
                &args.ema_period,
                &args.obi_threshold,
                &args.sl_percent,
                &args.tp_percent,
            );
            let outcome = optimize(&bt, grid, |p| TrendObiScalper::new(*p), args.maximize)?;
            report(&outcome, args.maximize, args)
        }
    }
}
