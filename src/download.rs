use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, TimeDelta, Utc};
use clap::ValueEnum;
use futures::{StreamExt, stream};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::NamedTempFile;
use tokio_retry::{
    Retry,
    strategy::{ExponentialBackoff, jitter},
};
use tracing::{error, info, warn};

use fs2::FileExt; // for file locking

use crate::DownloadArgs;
use crate::archive::extract_all;

const DEFAULT_BASE_URL: &str = "https://data.binance.vision";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum AssetClass {
    Spot,
    /// USD-M futures
    Um,
    /// COIN-M futures
    Cm,
}

impl AssetClass {
    pub fn market_path(self) -> &'static str {
        match self {
            AssetClass::Spot => "spot",
            AssetClass::Um => "futures/um",
            AssetClass::Cm => "futures/cm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum DataType {
    Trades,
    Klines,
}

impl DataType {
    fn as_str(self) -> &'static str {
        match self {
            DataType::Trades => "trades",
            DataType::Klines => "klines",
        }
    }
}

/// One daily archive to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyFile {
    pub date: NaiveDate,
    /// Path below the dump root, shared by the remote URL and the local copy.
    pub key: String,
}

impl DailyFile {
    pub fn new(
        symbol: &str,
        asset_class: AssetClass,
        data_type: DataType,
        interval: &str,
        date: NaiveDate,
    ) -> Self {
        let day = date.format("%Y-%m-%d");
        let key = match data_type {
            DataType::Trades => format!(
                "{}/daily/trades/{symbol}/{symbol}-trades-{day}.zip",
                asset_class.market_path()
            ),
            DataType::Klines => format!(
                "{}/daily/klines/{symbol}/{interval}/{symbol}-{interval}-{day}.zip",
                asset_class.market_path()
            ),
        };
        Self { date, key }
    }

    pub fn url(&self, base: &str) -> String {
        format!("{}/data/{}", base.trim_end_matches('/'), self.key)
    }

    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(&self.key)
    }
}

/// Base URL of the public data mirror; `BINANCE_DATA_URL` overrides it.
pub fn base_url() -> String {
    env::var("BINANCE_DATA_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn parse_date(s: &str, flag: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid {flag} {s:?}"))
}

/// Inclusive day range. Archives are published the day after, so `end`
/// defaults to yesterday (UTC) and `start` to 30 days before `end`.
pub fn resolve_range(
    start: Option<&str>,
    end: Option<&str>,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate)> {
    let end = match end {
        Some(s) => parse_date(s, "--end")?,
        None => today - TimeDelta::days(1),
    };
    let start = match start {
        Some(s) => parse_date(s, "--start")?,
        None => end - TimeDelta::days(30),
    };
    if end < start {
        bail!("end date {} is before start date {}", end, start);
    }
    Ok((start, end))
}

pub fn daily_files(
    symbol: &str,
    asset_class: AssetClass,
    data_type: DataType,
    interval: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<DailyFile> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(|d| DailyFile::new(symbol, asset_class, data_type, interval, d))
        .collect()
}

/// Acquire an exclusive file lock; keep the file handle alive to hold the lock.
pub fn acquire_lock(lock_path: &Path) -> Result<fs::File> {
    if let Some(dir) = lock_path.parent() {
        fs::create_dir_all(dir).ok();
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("open lock file {}", lock_path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("lock {}", lock_path.display()))?;
    Ok(file)
}

pub fn mk_client() -> Result<Client> {
    let client = Client::builder()
        .user_agent("tickbars/0.1 (rust)")
        .timeout(Duration::from_secs(300))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()?;
    Ok(client)
}

/// GET with exponential backoff. `Ok(None)` means the day is not published (404).
async fn fetch_archive(client: &Client, url: &str) -> Result<Option<Vec<u8>>> {
    let backoff = ExponentialBackoff::from_millis(300)
        .max_delay(Duration::from_secs(10))
        .map(jitter)
        .take(5);

    Retry::spawn(backoff, || async move {
        let resp = client.get(url).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("{} -> HTTP {}, retrying", url, status);
            bail!("HTTP {} for {}: {}", status, url, body);
        }
        Ok::<_, anyhow::Error>(Some(resp.bytes().await?.to_vec()))
    })
    .await
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Downloaded,
    Existing,
    Missing,
    Failed,
}

async fn download_one(
    client: &Client,
    base: &str,
    root: &Path,
    file: &DailyFile,
    update_existing: bool,
    extract: bool,
) -> Outcome {
    let local = file.local_path(root);
    let dir = local.parent().unwrap_or(root);
    if local.exists() && !update_existing {
        // an earlier run may have downloaded without --extract
        if extract
            && !local.with_extension("csv").exists()
            && let Err(e) = extract_all(&local, dir)
        {
            error!("extract {} failed: {:#}", local.display(), e);
            return Outcome::Failed;
        }
        return Outcome::Existing;
    }

    let url = file.url(base);
    let bytes = match fetch_archive(client, &url).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            warn!("{} not published yet (404), skipping", file.date);
            return Outcome::Missing;
        }
        Err(e) => {
            error!("download {} failed: {:#}", url, e);
            return Outcome::Failed;
        }
    };

    if let Err(e) = write_atomic(&local, &bytes) {
        error!("write {} failed: {:#}", local.display(), e);
        return Outcome::Failed;
    }
    if extract {
        if let Err(e) = extract_all(&local, dir) {
            error!("extract {} failed: {:#}", local.display(), e);
            return Outcome::Failed;
        }
    }
    info!("saved {} ({} bytes)", local.display(), bytes.len());
    Outcome::Downloaded
}

/// Fetch every day in the range; returns how many files were newly written.
pub async fn download_range(
    client: &Client,
    base: &str,
    root: &Path,
    files: &[DailyFile],
    concurrency: usize,
    update_existing: bool,
    extract: bool,
) -> Result<usize> {
    let outcomes: Vec<Outcome> = stream::iter(files)
        .map(|f| download_one(client, base, root, f, update_existing, extract))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let count = |o: Outcome| outcomes.iter().filter(|x| **x == o).count();
    info!(
        "download finished: {} new, {} existing, {} unpublished, {} failed",
        count(Outcome::Downloaded),
        count(Outcome::Existing),
        count(Outcome::Missing),
        count(Outcome::Failed)
    );
    if count(Outcome::Failed) == files.len() && !files.is_empty() {
        bail!("every download failed");
    }
    Ok(count(Outcome::Downloaded))
}

pub async fn execute(args: &DownloadArgs) -> Result<()> {
    let (start, end) = resolve_range(
        args.start.as_deref(),
        args.end.as_deref(),
        Utc::now().date_naive(),
    )?;

    // Optional single-instance lock
    let _lock_guard = args
        .lock_file
        .as_deref()
        .map(acquire_lock)
        .transpose()?;

    let files = daily_files(
        &args.symbol,
        args.asset_class,
        args.data_type,
        &args.interval,
        start,
        end,
    );
    info!(
        "downloading {} {} {} from {} to {} ({} days) into {}",
        args.symbol,
        args.asset_class.market_path(),
        args.data_type.as_str(),
        start,
        end,
        files.len(),
        args.out.display()
    );

    let client = mk_client()?;
    download_range(
        &client,
        &base_url(),
        &args.out,
        &files,
        args.concurrency,
        args.update_existing,
        args.extract,
    )
    .await?;
    Ok(())
}
