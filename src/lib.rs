pub mod archive;
pub mod backtest;
pub mod bars;
pub mod download;
pub mod indicators;
pub mod lean;
pub mod optimize;
pub mod run;
pub mod stats;
pub mod strategy;
pub mod trades;
pub mod upload;

use clap::Args;
use std::path::PathBuf;

use crate::download::{AssetClass, DataType};
use crate::optimize::Maximize;
use crate::strategy::StrategyKind;

/// Fetch daily Binance public-data archives into a local dump directory.
#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Root directory the vendor layout is mirrored under
    #[arg(long, default_value = "./historical_data")]
    pub out: PathBuf,

    /// Trading pair, e.g. BTCUSDT
    #[arg(long, default_value = "BTCUSDT")]
    pub symbol: String,

    /// Market: spot, um (USD-M futures) or cm (COIN-M futures)
    #[arg(long, value_enum, default_value_t = AssetClass::Um)]
    pub asset_class: AssetClass,

    /// Archive kind to fetch
    #[arg(long, value_enum, default_value_t = DataType::Trades)]
    pub data_type: DataType,

    /// Kline interval (only used with --data-type klines)
    #[arg(long, default_value = "1m")]
    pub interval: String,

    /// Start date (inclusive), format YYYY-MM-DD. Defaults to 30 days before --end
    #[arg(long)]
    pub start: Option<String>,

    /// End date (inclusive), format YYYY-MM-DD. Defaults to yesterday (UTC)
    #[arg(long)]
    pub end: Option<String>,

    /// Parallel day downloads
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Re-download days that already exist locally
    #[arg(long)]
    pub update_existing: bool,

    /// Also unzip every downloaded archive next to it
    #[arg(long)]
    pub extract: bool,

    /// Optional lock file path to prevent concurrent runs
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

/// Where a backtest finds its trades and how they are bucketed into bars.
#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    /// Dump root written by `download`
    #[arg(long, default_value = "./historical_data")]
    pub data: PathBuf,

    #[arg(long, default_value = "BTCUSDT")]
    pub symbol: String,

    #[arg(long, value_enum, default_value_t = AssetClass::Um)]
    pub asset_class: AssetClass,

    /// Bar interval (5s, 1min, 15T, 1h)
    #[arg(long, default_value = "5s")]
    pub interval: String,
}

/// Broker knobs shared by `backtest` and `optimize`.
#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    #[arg(long, default_value_t = 100_000.0)]
    pub cash: f64,

    /// Commission as a fraction of traded notional
    #[arg(long, default_value_t = 0.0004)]
    pub commission: f64,

    /// Margin requirement; 0.05 means 20x leverage
    #[arg(long, default_value_t = 0.05)]
    pub margin: f64,

    /// Fill on the signal bar's close instead of the next bar's open
    #[arg(long)]
    pub trade_on_close: bool,

    /// Ignore new entries while a position is open instead of reversing it
    #[arg(long)]
    pub no_exclusive_orders: bool,
}

/// Replays one strategy over bars built from the dump directory.
#[derive(Args, Debug, Clone)]
pub struct BacktestArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub broker: BrokerArgs,

    #[arg(long, value_enum, default_value_t = StrategyKind::TrendObi)]
    pub strategy: StrategyKind,

    /// SMA crossover fast period
    #[arg(long, default_value_t = 5)]
    pub fast: usize,
    /// SMA crossover slow period
    #[arg(long, default_value_t = 20)]
    pub slow: usize,

    /// Trend filter EMA span
    #[arg(long, default_value_t = 200)]
    pub ema_period: usize,
    #[arg(long, default_value_t = 0.1)]
    pub obi_threshold: f64,
    #[arg(long, default_value_t = 0.0005)]
    pub sl_percent: f64,
    #[arg(long, default_value_t = 0.001)]
    pub tp_percent: f64,

    /// Directory for stats.json, trades.csv, equity_curve.csv and bars.csv
    #[arg(long, default_value = "./out/backtest")]
    pub out: PathBuf,
}

/// Grid-searches strategy parameters and reports the best combination.
#[derive(Args, Debug, Clone)]
pub struct OptimizeArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub broker: BrokerArgs,

    #[arg(long, value_enum, default_value_t = StrategyKind::TrendObi)]
    pub strategy: StrategyKind,

    #[arg(long, value_delimiter = ',', default_value = "5,10")]
    pub fast: Vec<usize>,
    #[arg(long, value_delimiter = ',', default_value = "20,50")]
    pub slow: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_value = "100,200")]
    pub ema_period: Vec<usize>,
    #[arg(long, value_delimiter = ',', default_value = "0.1,0.25,0.4")]
    pub obi_threshold: Vec<f64>,
    #[arg(long, value_delimiter = ',', default_value = "0.001")]
    pub sl_percent: Vec<f64>,
    #[arg(long, value_delimiter = ',', default_value = "0.0015")]
    pub tp_percent: Vec<f64>,

    /// Statistic to maximize
    #[arg(long, value_enum, default_value_t = Maximize::EquityFinal)]
    pub maximize: Maximize,

    /// Directory for the best run's artifacts and the full grid table
    #[arg(long, default_value = "./out/optimize")]
    pub out: PathBuf,
}

/// Rewrites Binance 1m kline dumps into LEAN's zipped daily minute files.
#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Dump root holding futures/um/daily/klines/<SYMBOL>/1m
    #[arg(long, default_value = "./raw_data")]
    pub raw: PathBuf,

    /// Output directory for <YYYYMMDD>_trade.zip files.
    /// Defaults to ./lean/data/crypto/binance/minute/<symbol>
    #[arg(long)]
    pub out: Option<PathBuf>,

    #[arg(long, default_value = "BTCUSDT")]
    pub symbol: String,

    /// Download the klines into --raw before converting
    #[arg(long)]
    pub download: bool,

    /// Download start date (with --download)
    #[arg(long)]
    pub start: Option<String>,

    /// Download end date (with --download)
    #[arg(long)]
    pub end: Option<String>,

    /// Re-download days already present in --raw (with --download)
    #[arg(long)]
    pub update_existing: bool,
}

/// Uploads one local file to a Cloud Storage bucket.
#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    #[arg(long)]
    pub bucket: String,

    /// Local file to upload
    #[arg(long)]
    pub source: PathBuf,

    /// Object name inside the bucket
    #[arg(long)]
    pub dest: String,
}

/// Single trade CSV -> bars -> backtest -> optional upload.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to trade CSV (or zip) to process
    #[arg(long)]
    pub csv: PathBuf,

    #[arg(long, default_value = "1min")]
    pub timeframe: String,

    /// GCS bucket to upload results (optional)
    #[arg(long)]
    pub gcs_bucket: Option<String>,

    #[arg(long, value_enum, default_value_t = StrategyKind::SmaCross)]
    pub strategy: StrategyKind,

    /// Where the resampled bars are written; reports land next to it
    #[arg(long, default_value = "/tmp/ohlc.csv")]
    pub out: PathBuf,
}
