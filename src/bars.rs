use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, fs, path::Path, str::FromStr};
use tracing::info;

use crate::DataArgs;
use crate::trades::{TradeRecord, load_and_combine_trades};

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

/// Fixed bar width, epoch aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeframe {
    millis: i64,
}

impl Timeframe {
    pub fn from_millis(millis: i64) -> Result<Self> {
        if millis <= 0 {
            bail!("timeframe must be positive, got {}ms", millis);
        }
        Ok(Self { millis })
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    /// Parse offset strings: `5s`, `1min`, `1Min`, `15T`, `1h`, `1D`, `250ms`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let n: i64 = if num.is_empty() {
            1
        } else {
            num.parse().with_context(|| format!("bad timeframe count in {:?}", s))?
        };
        let unit_ms = match unit.trim().to_ascii_lowercase().as_str() {
            "ms" | "l" => 1,
            "s" | "sec" => MS_PER_SECOND,
            "min" | "t" | "m" => MS_PER_MINUTE,
            "h" => MS_PER_HOUR,
            "d" => MS_PER_DAY,
            "" => bail!("timeframe {:?} has no unit", s),
            other => bail!("unknown timeframe unit {:?} in {:?}", other, s),
        };
        let millis = n
            .checked_mul(unit_ms)
            .with_context(|| format!("timeframe {:?} is too large", s))?;
        Self::from_millis(millis)
    }

    /// Start of the bucket containing `ts`.
    pub fn floor(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp_millis().div_euclid(self.millis) * self.millis
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.millis;
        if ms % MS_PER_DAY == 0 {
            write!(f, "{}d", ms / MS_PER_DAY)
        } else if ms % MS_PER_HOUR == 0 {
            write!(f, "{}h", ms / MS_PER_HOUR)
        } else if ms % MS_PER_MINUTE == 0 {
            write!(f, "{}min", ms / MS_PER_MINUTE)
        } else if ms % MS_PER_SECOND == 0 {
            write!(f, "{}s", ms / MS_PER_SECOND)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

/// OHLCV bar labelled by its interval start, with the optional OBI score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub obi: Option<f64>,
}

impl Bar {
    fn opening(timestamp: DateTime<Utc>, t: &TradeRecord) -> Self {
        Self {
            timestamp,
            open: t.price,
            high: t.price,
            low: t.price,
            close: t.price,
            volume: t.qty,
            obi: None,
        }
    }

    fn absorb(&mut self, t: &TradeRecord) {
        self.high = self.high.max(t.price);
        self.low = self.low.min(t.price);
        self.close = t.price;
        self.volume += t.qty;
    }
}

fn bucket_start(bucket: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(bucket)
}

/// Resample ticks into OHLCV bars. Empty intervals produce no bar.
///
/// Within a bucket, open/close follow input order, so callers pass
/// time-sorted trades (as `load_and_combine_trades` returns them).
pub fn resample_trades_to_ohlcv(trades: &[TradeRecord], tf: Timeframe) -> Vec<Bar> {
    let mut buckets: BTreeMap<i64, Bar> = BTreeMap::new();
    for t in trades {
        let key = tf.floor(t.timestamp);
        match buckets.get_mut(&key) {
            Some(bar) => bar.absorb(t),
            None => {
                if let Some(ts) = bucket_start(key) {
                    buckets.insert(key, Bar::opening(ts, t));
                }
            }
        }
    }
    info!(
        "resampling complete: {} bars at {} interval",
        buckets.len(),
        tf
    );
    buckets.into_values().collect()
}

/// Trade-side volume imbalance per interval: `(buy - sell) / (buy + sell)`.
///
/// Buy volume is taker-buy qty (`is_buyer_maker == false`). An interval with
/// zero total volume scores 0.
pub fn calculate_obi_proxy(trades: &[TradeRecord], tf: Timeframe) -> BTreeMap<DateTime<Utc>, f64> {
    let mut sides: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for t in trades {
        let entry = sides.entry(tf.floor(t.timestamp)).or_default();
        if t.is_taker_buy() {
            entry.0 += t.qty;
        } else {
            entry.1 += t.qty;
        }
    }
    sides
        .into_iter()
        .filter_map(|(key, (buy, sell))| {
            let total = buy + sell;
            let denom = if total == 0.0 { 1.0 } else { total };
            bucket_start(key).map(|ts| (ts, (buy - sell) / denom))
        })
        .collect()
}

/// Join OBI scores onto bars by timestamp; bars without a score are dropped.
pub fn attach_obi(bars: Vec<Bar>, obi: &BTreeMap<DateTime<Utc>, f64>) -> Vec<Bar> {
    bars.into_iter()
        .filter_map(|mut bar| {
            let score = *obi.get(&bar.timestamp)?;
            bar.obi = Some(score);
            Some(bar)
        })
        .collect()
}

/// Bars with OBI attached, ready for either strategy.
pub fn prepare_bars(trades: &[TradeRecord], tf: Timeframe) -> Vec<Bar> {
    let obi = calculate_obi_proxy(trades, tf);
    attach_obi(resample_trades_to_ohlcv(trades, tf), &obi)
}

/// Load the dump directory and build OBI-annotated bars at the requested interval.
pub fn load_bars(args: &DataArgs) -> Result<Vec<Bar>> {
    let tf = Timeframe::parse(&args.interval)?;
    let Some(trades) = load_and_combine_trades(&args.data, &args.symbol, args.asset_class)? else {
        bail!("data loading failed; backtest cannot run");
    };
    let bars = prepare_bars(&trades, tf);
    if bars.is_empty() {
        bail!("no bars produced from {} trades", trades.len());
    }
    info!("data preparation complete, OBI attached to {} bars", bars.len());
    Ok(bars)
}

pub fn write_bars_csv(path: &Path, bars: &[Bar]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let mut wtr = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("write {}", path.display()))?;
    for bar in bars {
        wtr.serialize(bar)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_bars_csv(path: &Path) -> Result<Vec<Bar>> {
    let mut rdr = ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("read {}", path.display()))?;
    let mut bars = Vec::new();
    for rec in rdr.deserialize::<Bar>() {
        bars.push(rec?);
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ms: i64, price: f64, qty: f64, is_buyer_maker: bool) -> TradeRecord {
        TradeRecord {
            timestamp: DateTime::from_timestamp_millis(ms).unwrap(),
            price,
            qty,
            quote_qty: price * qty,
            is_buyer_maker,
        }
    }

    #[test]
    fn timeframe_parsing() {
        assert_eq!(Timeframe::parse("5s").unwrap().millis(), 5_000);
        assert_eq!(Timeframe::parse("1min").unwrap().millis(), 60_000);
        assert_eq!(Timeframe::parse("1Min").unwrap().millis(), 60_000);
        assert_eq!(Timeframe::parse("15T").unwrap().millis(), 900_000);
        assert_eq!(Timeframe::parse("h").unwrap().millis(), 3_600_000);
        assert_eq!(Timeframe::parse("1D").unwrap().millis(), 86_400_000);
        assert_eq!(Timeframe::parse("250ms").unwrap().millis(), 250);
        assert!(Timeframe::parse("0s").is_err());
        assert!(Timeframe::parse("5").is_err());
        assert!(Timeframe::parse("5weeks").is_err());
        assert!(Timeframe::parse("999999999999999d").is_err());
    }

    #[test]
    fn timeframe_display_is_canonical() {
        assert_eq!(Timeframe::parse("60s").unwrap().to_string(), "1min");
        assert_eq!(Timeframe::parse("90s").unwrap().to_string(), "90s");
        assert_eq!(Timeframe::parse("24h").unwrap().to_string(), "1d");
    }

    #[test]
    fn resampling_builds_ohlcv_and_skips_empty_intervals() {
        let tf = Timeframe::parse("1min").unwrap();
        let base = 1_700_000_040_000; // aligned to a minute
        let trades = vec![
            trade(base + 1_000, 10.0, 1.0, false),
            trade(base + 20_000, 12.0, 2.0, true),
            trade(base + 40_000, 9.0, 0.5, false),
            trade(base + 59_999, 11.0, 1.5, true),
            // next minute is empty, then one trade two minutes later
            trade(base + 150_000, 20.0, 3.0, false),
        ];
        let bars = resample_trades_to_ohlcv(&trades, tf);
        assert_eq!(bars.len(), 2);

        let b = &bars[0];
        assert_eq!(b.timestamp.timestamp_millis(), base);
        assert_eq!((b.open, b.high, b.low, b.close), (10.0, 12.0, 9.0, 11.0));
        assert!((b.volume - 5.0).abs() < 1e-12);

        assert_eq!(bars[1].timestamp.timestamp_millis(), base + 120_000);
        assert_eq!(bars[1].open, 20.0);
        assert_eq!(bars[1].close, 20.0);
    }

    #[test]
    fn obi_is_bounded_and_signed_by_taker_side() {
        let tf = Timeframe::parse("5s").unwrap();
        let trades = vec![
            trade(0, 1.0, 3.0, false),
            trade(1_000, 1.0, 1.0, true),
            trade(5_000, 1.0, 2.0, true),
            trade(10_000, 1.0, 0.0, false),
        ];
        let obi = calculate_obi_proxy(&trades, tf);
        let scores: Vec<f64> = obi.values().copied().collect();
        assert_eq!(scores.len(), 3);
        assert!((scores[0] - 0.5).abs() < 1e-12);
        assert_eq!(scores[1], -1.0);
        assert_eq!(scores[2], 0.0);
        assert!(scores.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn prepared_bars_carry_obi() {
        let tf = Timeframe::parse("5s").unwrap();
        let trades = vec![trade(0, 1.0, 1.0, false), trade(6_000, 2.0, 1.0, true)];
        let bars = prepare_bars(&trades, tf);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].obi, Some(1.0));
        assert_eq!(bars[1].obi, Some(-1.0));
    }

    #[test]
    fn attach_drops_bars_without_score() {
        let tf = Timeframe::parse("5s").unwrap();
        let bars = resample_trades_to_ohlcv(&[trade(0, 1.0, 1.0, false), trade(5_000, 1.0, 1.0, false)], tf);
        let mut obi = BTreeMap::new();
        obi.insert(bars[1].timestamp, 0.25);
        let joined = attach_obi(bars, &obi);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].obi, Some(0.25));
    }

    #[test]
    fn bars_csv_round_trip_keeps_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ohlc.csv");
        let tf = Timeframe::parse("1s").unwrap();
        let bars = prepare_bars(&[trade(1_000, 5.0, 1.0, false), trade(2_500, 6.0, 1.0, true)], tf);
        write_bars_csv(&path, &bars).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("timestamp,open,high,low,close,volume,obi"));
        assert_eq!(read_bars_csv(&path).unwrap(), bars);
    }
}
