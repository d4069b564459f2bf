use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

use crate::archive::{prefer_extracted, with_csv_reader};
use crate::download::AssetClass;

/// Epoch values at or above this are microseconds (newer Binance spot dumps).
const MICROS_THRESHOLD: i64 = 100_000_000_000_000;

/// One aggressor trade from a Binance `trades` dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub qty: f64,
    pub quote_qty: f64,
    /// True when the buyer was the resting side, i.e. the taker sold.
    pub is_buyer_maker: bool,
}

impl TradeRecord {
    pub fn is_taker_buy(&self) -> bool {
        !self.is_buyer_maker
    }
}

/// Epoch milliseconds or microseconds to UTC.
pub fn epoch_to_utc(raw: i64) -> Option<DateTime<Utc>> {
    if raw >= MICROS_THRESHOLD {
        DateTime::from_timestamp_micros(raw)
    } else {
        DateTime::from_timestamp_millis(raw)
    }
}

fn parse_epoch(field: &str) -> Option<i64> {
    field
        .parse::<i64>()
        .ok()
        .or_else(|| field.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
}

fn parse_flag(field: &str) -> Option<bool> {
    match field.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Positional columns: id, price, qty, quote_qty, time, is_buyer_maker[, is_best_match].
fn parse_row(rec: &StringRecord) -> Option<TradeRecord> {
    let price: f64 = rec.get(1)?.parse().ok()?;
    let qty: f64 = rec.get(2)?.parse().ok()?;
    let timestamp = epoch_to_utc(parse_epoch(rec.get(4)?)?)?;
    let is_buyer_maker = parse_flag(rec.get(5)?)?;
    let quote_qty = rec
        .get(3)
        .and_then(|v| v.parse().ok())
        .unwrap_or(price * qty);
    if !price.is_finite() || !qty.is_finite() {
        return None;
    }
    Some(TradeRecord {
        timestamp,
        price,
        qty,
        quote_qty,
        is_buyer_maker,
    })
}

fn parse_trades(reader: &mut dyn Read) -> Result<Vec<TradeRecord>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut out = Vec::new();
    let mut dropped = 0usize;
    for rec in rdr.byte_records() {
        // rows that are not valid UTF-8 count as unparsable
        let row = StringRecord::from_byte_record(rec?).ok();
        match row.as_ref().and_then(parse_row) {
            Some(t) => out.push(t),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        // a header line lands here too
        debug!("dropped {} unparsable trade rows", dropped);
    }
    Ok(out)
}

/// Read one trades file; `.zip` archives are opened transparently.
///
/// Rows whose time, price, qty or maker flag do not parse are dropped, which
/// also skips an optional header line.
pub fn read_trade_csv(path: &Path) -> Result<Vec<TradeRecord>> {
    with_csv_reader(path, parse_trades).with_context(|| format!("read trades {}", path.display()))
}

/// Vendor layout: `<base>/<market>/daily/trades/<SYMBOL>`.
pub fn trades_dir(base: &Path, symbol: &str, asset_class: AssetClass) -> PathBuf {
    base.join(asset_class.market_path())
        .join("daily")
        .join("trades")
        .join(symbol)
}

fn is_trades_file(name: &str) -> bool {
    name.ends_with(".zip") || (name.ends_with(".csv") && name.contains("trades"))
}

/// Load every daily trades file for `symbol`, concatenated and time-sorted.
///
/// Returns `Ok(None)` when the directory is missing or nothing could be read;
/// files that fail to parse are logged and skipped.
pub fn load_and_combine_trades(
    base: &Path,
    symbol: &str,
    asset_class: AssetClass,
) -> Result<Option<Vec<TradeRecord>>> {
    let data_dir = trades_dir(base, symbol, asset_class);
    if !data_dir.is_dir() {
        error!(
            "data directory not found at {}; check your download path",
            data_dir.display()
        );
        return Ok(None);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(&data_dir)
        .with_context(|| format!("list {}", data_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_trades_file)
        })
        .collect();
    files.sort();
    let files = prefer_extracted(files);

    let mut all = Vec::new();
    for path in &files {
        match read_trade_csv(path) {
            Ok(mut rows) => all.append(&mut rows),
            Err(e) => warn!("skipping file {}: {:#}", path.display(), e),
        }
    }

    if all.is_empty() {
        error!("no trade data found; ensure the download completed");
        return Ok(None);
    }

    all.sort_by_key(|t| t.timestamp);
    info!(
        "loaded and combined {} trades from {} files",
        all.len(),
        files.len()
    );
    Ok(Some(all))
}
