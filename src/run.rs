use anyhow::{Result, bail};
use std::path::Path;
use tracing::info;

use crate::RunArgs;
use crate::backtest::{Backtest, BacktestConfig, BacktestResult};
use crate::bars::{Timeframe, prepare_bars, write_bars_csv};
use crate::strategy::{SmaCrossParams, StrategyKind, TrendObiParams, build_strategy};
use crate::trades::read_trade_csv;
use crate::upload::upload_file;

/// Object name the bars of `csv` are uploaded under.
pub fn upload_dest(csv: &Path) -> String {
    let base = csv
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("backtests/{base}.ohlc.csv")
}

/// Trades file -> bars -> backtest with default broker settings.
pub fn backtest_file(csv: &Path, timeframe: Timeframe, kind: StrategyKind) -> Result<(Backtest, BacktestResult)> {
    info!("reading trades from {}", csv.display());
    let trades = read_trade_csv(csv)?;
    if trades.is_empty() {
        bail!("no parsable trades in {}", csv.display());
    }
    let bars = prepare_bars(&trades, timeframe);
    info!("running backtest on {} rows", bars.len());

    let bt = Backtest::new(bars, BacktestConfig::default())?;
    let mut strategy = build_strategy(kind, SmaCrossParams::default(), TrendObiParams::default());
    let result = bt.run(strategy.as_mut())?;
    Ok((bt, result))
}

pub async fn execute(args: &RunArgs) -> Result<()> {
    let timeframe = Timeframe::parse(&args.timeframe)?;
    let (bt, result) = backtest_file(&args.csv, timeframe, args.strategy)?;
    println!("{}", result.stats);

    write_bars_csv(&args.out, bt.bars())?;
    let report_dir = args
        .out
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    result.save(report_dir)?;

    if let Some(bucket) = &args.gcs_bucket {
        let dest = upload_dest(&args.csv);
        upload_file(bucket, &args.out, &dest).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn dest_uses_the_source_basename() {
        assert_eq!(
            upload_dest(&PathBuf::from("/data/BTCUSDT-trades-2024-11-01.zip")),
            "backtests/BTCUSDT-trades-2024-11-01.zip.ohlc.csv"
        );
    }

    #[test]
    fn empty_trade_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("empty.csv");
        std::fs::write(&csv, "id,price,qty,quote_qty,time,is_buyer_maker\n").unwrap();
        let tf = Timeframe::parse("1min").unwrap();
        assert!(backtest_file(&csv, tf, StrategyKind::SmaCross).is_err());
    }
}
