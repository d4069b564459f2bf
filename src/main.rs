use anyhow::Result;
use tickbars::{
    BacktestArgs, ConvertArgs, DownloadArgs, OptimizeArgs, RunArgs, UploadArgs, backtest,
    download, lean, optimize, run, upload,
};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download daily trade or kline archives from Binance public data
    Download(DownloadArgs),
    /// Backtest one strategy over bars built from downloaded trades
    Backtest(BacktestArgs),
    /// Grid-search strategy parameters
    Optimize(OptimizeArgs),
    /// Convert 1m klines into LEAN minute zips
    ConvertLean(ConvertArgs),
    /// Upload a file to Cloud Storage
    Upload(UploadArgs),
    /// Trades CSV -> bars -> backtest -> optional upload
    Run(RunArgs),
}

/// Backtest flags alone, used when no subcommand is given.
#[derive(Parser, Debug)]
struct DefaultBacktest {
    #[command(flatten)]
    args: BacktestArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Some(Command::Download(a)) => download::execute(&a).await?,
        Some(Command::Backtest(a)) => backtest::execute(&a)?,
        Some(Command::Optimize(a)) => optimize::execute(&a)?,
        Some(Command::ConvertLean(a)) => lean::execute(&a).await?,
        Some(Command::Upload(a)) => upload::execute(&a).await?,
        Some(Command::Run(a)) => run::execute(&a).await?,
        None => {
            // Default behavior: backtest the dump directory with default settings
            println!("Running default backtest (see --help for subcommands)...");
            let defaults = DefaultBacktest::parse_from(["tickbars"]);
            backtest::execute(&defaults.args)?;
        }
    }
    Ok(())
}
