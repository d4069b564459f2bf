use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use tracing::{error, info, warn};

use crate::{ConvertArgs, DownloadArgs};
use crate::archive::{prefer_extracted, with_csv_reader, write_single_member_zip};
use crate::download::{self, AssetClass, DataType};
use crate::trades::epoch_to_utc;

const MS_PER_DAY: i64 = 86_400_000;
const KLINE_INTERVAL: &str = "1m";

/// `<raw>/futures/um/daily/klines/<SYMBOL>/1m`
pub fn klines_dir(raw: &Path, symbol: &str) -> PathBuf {
    raw.join(AssetClass::Um.market_path())
        .join("daily")
        .join("klines")
        .join(symbol)
        .join(KLINE_INTERVAL)
}

pub fn default_out_dir(symbol: &str) -> PathBuf {
    PathBuf::from("./lean/data/crypto/binance/minute").join(symbol.to_lowercase())
}

/// Trading day encoded in `<SYMBOL>-1m-YYYY-MM-DD.(csv|zip)`.
pub fn date_from_file_name(name: &str, symbol: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix(&format!("{symbol}-{KLINE_INTERVAL}-"))?;
    let day = rest
        .strip_suffix(".csv")
        .or_else(|| rest.strip_suffix(".zip"))?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Kline open time (ms or µs since epoch) to milliseconds since UTC midnight.
fn ms_since_midnight(field: &str) -> Option<i64> {
    let raw: f64 = field.trim().parse().ok()?;
    if !raw.is_finite() {
        return None;
    }
    let ts = epoch_to_utc(raw as i64)?;
    Some(ts.timestamp_millis().rem_euclid(MS_PER_DAY))
}

/// LEAN minute rows: `ms_since_midnight,open,high,low,close,volume`, no header.
/// Rows with a non-numeric open time (headers included) are dropped.
fn lean_rows(reader: &mut dyn Read) -> Result<Vec<u8>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(Vec::new());

    for (line, rec) in rdr.records().enumerate() {
        let rec = rec?;
        let Some(time) = rec.get(0).and_then(ms_since_midnight) else {
            continue;
        };
        if rec.len() < 6 {
            bail!("line {}: expected at least 6 columns, got {}", line + 1, rec.len());
        }
        let time = time.to_string();
        wtr.write_record([time.as_str(), &rec[1], &rec[2], &rec[3], &rec[4], &rec[5]])?;
    }
    wtr.into_inner().context("flush lean rows")
}

/// Convert one kline file into `<out>/<YYYYMMDD>_trade.zip`.
pub fn convert_file(path: &Path, symbol: &str, date: NaiveDate, out_dir: &Path) -> Result<PathBuf> {
    let body = with_csv_reader(path, lean_rows)
        .with_context(|| format!("convert {}", path.display()))?;

    let lean_date = date.format("%Y%m%d").to_string();
    let zip_path = out_dir.join(format!("{lean_date}_trade.zip"));
    let member = format!("{lean_date}_{}_minute_trade.csv", symbol.to_lowercase());
    write_single_member_zip(&zip_path, &member, &body)?;
    Ok(zip_path)
}

/// Convert every daily kline file in `input_dir`; returns the number written.
pub fn convert_dir(input_dir: &Path, symbol: &str, out_dir: &Path) -> Result<usize> {
    if !input_dir.is_dir() {
        bail!("kline directory not found at {}", input_dir.display());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(input_dir)
        .with_context(|| format!("list {}", input_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .is_some_and(|ext| ext == "csv" || ext == "zip")
        })
        .collect();
    files.sort();
    let files = prefer_extracted(files);
    info!("found {} kline files in {}", files.len(), input_dir.display());

    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let mut written = 0usize;
    for path in &files {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let Some(date) = date_from_file_name(name, symbol) else {
            warn!("skipping {}: no date in file name", path.display());
            continue;
        };
        match convert_file(path, symbol, date, out_dir) {
            Ok(zip) => {
                written += 1;
                info!("wrote {}", zip.display());
            }
            Err(e) => error!("error on {}: {:#}", path.display(), e),
        }
    }
    info!("converted {} of {} files into {}", written, files.len(), out_dir.display());
    Ok(written)
}

/// Download request for the 1m futures klines `execute` converts.
pub fn kline_download_args(args: &ConvertArgs) -> DownloadArgs {
    DownloadArgs {
        out: args.raw.clone(),
        symbol: args.symbol.clone(),
        asset_class: AssetClass::Um,
        data_type: DataType::Klines,
        interval: KLINE_INTERVAL.to_string(),
        start: args.start.clone(),
        end: args.end.clone(),
        concurrency: 4,
        update_existing: args.update_existing,
        extract: false,
        lock_file: None,
    }
}

pub async fn execute(args: &ConvertArgs) -> Result<()> {
    if args.download {
        download::execute(&kline_download_args(args)).await?;
    }

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| default_out_dir(&args.symbol));
    convert_dir(&klines_dir(&args.raw, &args.symbol), &args.symbol, &out)?;
    Ok(())
}
