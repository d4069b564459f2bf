use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::{info, warn};

use crate::bars::{Bar, write_bars_csv};
use crate::stats::Stats;
use crate::strategy::{
    BarContext, Order, SmaCrossParams, Strategy, TrendObiParams, build_strategy,
};
use crate::{BacktestArgs, BrokerArgs, bars};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    EndOfData,
    Bankrupt,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacktestConfig {
    pub cash: f64,
    /// Fraction of traded notional charged at entry and again at exit.
    pub commission: f64,
    /// Margin requirement; leverage is its inverse.
    pub margin: f64,
    /// A new entry first closes whatever is open.
    pub exclusive_orders: bool,
    /// Fill on the signal bar's close rather than the next bar's open.
    pub trade_on_close: bool,
    /// Fraction of available buying power committed per entry.
    pub size: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            cash: 10_000.0,
            commission: 0.0005,
            margin: 1.0,
            exclusive_orders: true,
            trade_on_close: false,
            size: 0.9999,
        }
    }
}

impl BacktestConfig {
    pub fn leverage(&self) -> f64 {
        1.0 / self.margin
    }

    fn validate(&self) -> Result<()> {
        if !(self.cash > 0.0) {
            bail!("cash must be positive, got {}", self.cash);
        }
        if !(0.0..1.0).contains(&self.commission) {
            bail!("commission must be in [0, 1), got {}", self.commission);
        }
        if !(self.margin > 0.0 && self.margin <= 1.0) {
            bail!("margin must be in (0, 1], got {}", self.margin);
        }
        if !(self.size > 0.0 && self.size <= 1.0) {
            bail!("size must be in (0, 1], got {}", self.size);
        }
        Ok(())
    }
}

impl From<&BrokerArgs> for BacktestConfig {
    fn from(args: &BrokerArgs) -> Self {
        Self {
            cash: args.cash,
            commission: args.commission,
            margin: args.margin,
            exclusive_orders: !args.no_exclusive_orders,
            trade_on_close: args.trade_on_close,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub side: Side,
    pub units: f64,
    pub entry_bar: usize,
    pub exit_bar: usize,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Net of entry and exit commission.
    pub pnl: f64,
    /// Net PnL relative to entry notional, in percent.
    pub return_pct: f64,
    pub commission: f64,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub in_market: bool,
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub strategy: String,
    pub stats: Stats,
    pub trades: Vec<ClosedTrade>,
    pub equity: Vec<EquityPoint>,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    side: Side,
    units: f64,
    entry_price: f64,
    entry_bar: usize,
    entry_time: DateTime<Utc>,
    entry_fee: f64,
    sl: Option<f64>,
    tp: Option<f64>,
}

impl OpenPosition {
    fn unrealized(&self, price: f64) -> f64 {
        self.side.sign() * self.units * (price - self.entry_price)
    }

    /// Exit triggered inside `bar`, if any. Gaps through a level fill at the open;
    /// when both levels are touched the stop is assumed to have hit first.
    fn triggered_exit(&self, bar: &Bar) -> Option<(f64, ExitReason)> {
        let stop = self.sl.and_then(|sl| match self.side {
            Side::Long if bar.open <= sl => Some(bar.open),
            Side::Long if bar.low <= sl => Some(sl),
            Side::Short if bar.open >= sl => Some(bar.open),
            Side::Short if bar.high >= sl => Some(sl),
            _ => None,
        });
        if let Some(px) = stop {
            return Some((px, ExitReason::StopLoss));
        }
        let take = self.tp.and_then(|tp| match self.side {
            Side::Long if bar.open >= tp => Some(bar.open),
            Side::Long if bar.high >= tp => Some(tp),
            Side::Short if bar.open <= tp => Some(bar.open),
            Side::Short if bar.low <= tp => Some(tp),
            _ => None,
        });
        take.map(|px| (px, ExitReason::TakeProfit))
    }
}

/// Cash, the single open position, and the trade ledger.
struct Broker<'a> {
    config: &'a BacktestConfig,
    cash: f64,
    position: Option<OpenPosition>,
    trades: Vec<ClosedTrade>,
}

impl<'a> Broker<'a> {
    fn new(config: &'a BacktestConfig) -> Self {
        Self {
            config,
            cash: config.cash,
            position: None,
            trades: Vec::new(),
        }
    }

    fn equity(&self, price: f64) -> f64 {
        self.cash + self.position.as_ref().map_or(0.0, |p| p.unrealized(price))
    }

    fn side(&self) -> Option<Side> {
        self.position.as_ref().map(|p| p.side)
    }

    fn close(&mut self, price: f64, bar_idx: usize, time: DateTime<Utc>, reason: ExitReason) {
        let Some(pos) = self.position.take() else {
            return;
        };
        let exit_fee = self.config.commission * pos.units * price;
        let gross = pos.unrealized(price);
        self.cash += gross - exit_fee;

        let pnl = gross - pos.entry_fee - exit_fee;
        let notional = pos.entry_price * pos.units;
        self.trades.push(ClosedTrade {
            side: pos.side,
            units: pos.units,
            entry_bar: pos.entry_bar,
            exit_bar: bar_idx,
            entry_time: pos.entry_time,
            exit_time: time,
            entry_price: pos.entry_price,
            exit_price: price,
            pnl,
            return_pct: if notional > 0.0 { pnl / notional * 100.0 } else { 0.0 },
            commission: pos.entry_fee + exit_fee,
            exit_reason: reason,
        });
    }

    fn open(
        &mut self,
        side: Side,
        price: f64,
        bar_idx: usize,
        time: DateTime<Utc>,
        sl: Option<f64>,
        tp: Option<f64>,
    ) {
        let equity = self.equity(price);
        let units = equity * self.config.leverage() * self.config.size
            / (price * (1.0 + self.config.commission));
        if !(units.is_finite() && units > 0.0) {
            warn!("insufficient equity ({:.2}) to open at {}", equity, price);
            return;
        }
        let entry_fee = self.config.commission * units * price;
        self.cash -= entry_fee;
        self.position = Some(OpenPosition {
            side,
            units,
            entry_price: price,
            entry_bar: bar_idx,
            entry_time: time,
            entry_fee,
            sl,
            tp,
        });
    }

    fn execute(&mut self, order: Order, price: f64, bar_idx: usize, time: DateTime<Utc>) {
        let (side, sl, tp) = match order {
            Order::Close => {
                self.close(price, bar_idx, time, ExitReason::Signal);
                return;
            }
            Order::Buy { sl, tp } => (Side::Long, sl, tp),
            Order::Sell { sl, tp } => (Side::Short, sl, tp),
        };
        if self.position.is_some() {
            if !self.config.exclusive_orders {
                return;
            }
            self.close(price, bar_idx, time, ExitReason::Signal);
        }
        self.open(side, price, bar_idx, time, sl, tp);
    }

    fn check_exits(&mut self, bar: &Bar, bar_idx: usize) {
        let hit = self.position.as_ref().and_then(|p| p.triggered_exit(bar));
        if let Some((price, reason)) = hit {
            self.close(price, bar_idx, bar.timestamp, reason);
        }
    }
}

/// Entry must sit strictly between its protective levels.
fn levels_valid(order: &Order, reference: f64) -> bool {
    match *order {
        Order::Buy { sl, tp } => {
            sl.is_none_or(|sl| sl < reference) && tp.is_none_or(|tp| tp > reference)
        }
        Order::Sell { sl, tp } => {
            sl.is_none_or(|sl| sl > reference) && tp.is_none_or(|tp| tp < reference)
        }
        Order::Close => true,
    }
}

/// Bar-replay backtest of one strategy over a fixed bar set.
pub struct Backtest {
    bars: Vec<Bar>,
    config: BacktestConfig,
}

impl Backtest {
    pub fn new(bars: Vec<Bar>, config: BacktestConfig) -> Result<Self> {
        if bars.is_empty() {
            bail!("cannot backtest an empty bar set");
        }
        config.validate()?;
        Ok(Self { bars, config })
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    /// Orders emitted on bar `i` fill at the open of bar `i + 1` (or the close of
    /// bar `i` with `trade_on_close`); orders from the last bar are dropped. Stops and targets are checked on every bar
    /// from the fill onward; anything still open is closed on the last bar.
    pub fn run(&self, strategy: &mut dyn Strategy) -> Result<BacktestResult> {
        strategy
            .init(&self.bars)
            .with_context(|| format!("init {}", strategy.name()))?;
        let warmup = strategy.warmup();
        let last = self.bars.len() - 1;

        let mut broker = Broker::new(&self.config);
        let mut equity = Vec::with_capacity(self.bars.len());
        let mut pending: Option<Order> = None;
        let mut bankrupt = false;

        for (i, bar) in self.bars.iter().enumerate() {
            if let Some(order) = pending.take() {
                broker.execute(order, bar.open, i, bar.timestamp);
            }
            broker.check_exits(bar, i);

            if i >= warmup && !bankrupt {
                let ctx = BarContext {
                    index: i,
                    bars: &self.bars,
                    position: broker.side(),
                };
                if let Some(order) = strategy.next(&ctx).filter(|_| i < last) {
                    if !levels_valid(&order, bar.close) {
                        warn!(
                            "bar {}: rejecting {:?}, levels must bracket the price {}",
                            i, order, bar.close
                        );
                    } else if self.config.trade_on_close {
                        broker.execute(order, bar.close, i, bar.timestamp);
                    } else {
                        pending = Some(order);
                    }
                }
            }

            let mut value = broker.equity(bar.close);
            if !bankrupt && value <= 0.0 {
                warn!("equity exhausted at bar {}; no further trading", i);
                broker.close(bar.close, i, bar.timestamp, ExitReason::Bankrupt);
                value = broker.cash;
                bankrupt = true;
            }
            equity.push(EquityPoint {
                timestamp: bar.timestamp,
                equity: value,
                in_market: broker.position.is_some(),
            });
        }

        let final_bar = &self.bars[last];
        if broker.position.is_some() {
            broker.close(final_bar.close, last, final_bar.timestamp, ExitReason::EndOfData);
            if let Some(point) = equity.last_mut() {
                point.equity = broker.cash;
            }
        }

        let stats = Stats::compute(&self.bars, &equity, &broker.trades, self.config.cash);
        Ok(BacktestResult {
            strategy: strategy.name().to_string(),
            stats,
            trades: broker.trades,
            equity,
        })
    }
}

impl BacktestResult {
    /// Write `stats.json`, `trades.csv` and `equity_curve.csv` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

        fs::write(
            dir.join("stats.json"),
            serde_json::to_string_pretty(&self.stats)?,
        )?;

        let mut wtr = WriterBuilder::new().from_path(dir.join("trades.csv"))?;
        for t in &self.trades {
            wtr.serialize(t)?;
        }
        wtr.flush()?;

        let mut wtr = WriterBuilder::new().from_path(dir.join("equity_curve.csv"))?;
        for p in &self.equity {
            wtr.serialize(p)?;
        }
        wtr.flush()?;

        info!("wrote backtest report to {}", dir.display());
        Ok(())
    }
}

impl BacktestArgs {
    pub fn sma_params(&self) -> SmaCrossParams {
        SmaCrossParams {
            fast: self.fast,
            slow: self.slow,
        }
    }

    pub fn trend_obi_params(&self) -> TrendObiParams {
        TrendObiParams {
            ema_period: self.ema_period,
            obi_threshold: self.obi_threshold,
            sl_percent: self.sl_percent,
            tp_percent: self.tp_percent,
        }
    }
}

pub fn execute(args: &BacktestArgs) -> Result<()> {
    info!(
        "loading {} trades from {}",
        args.data.symbol,
        args.data.data.display()
    );
    let bars = bars::load_bars(&args.data)?;
    let bt = Backtest::new(bars, BacktestConfig::from(&args.broker))?;

    let mut strategy = build_strategy(args.strategy, args.sma_params(), args.trend_obi_params());
    info!("running {} over {} bars", strategy.name(), bt.bars().len());
    let result = bt.run(strategy.as_mut())?;

    println!("{}", result.stats);
    result.save(&args.out)?;
    write_bars_csv(&args.out.join("bars.csv"), bt.bars())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: DateTime::from_timestamp(i * 60, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1.0,
            obi: Some(0.0),
        }
    }

    /// Emits a fixed order on a fixed bar.
    struct Scripted {
        orders: Vec<(usize, Order)>,
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            "Scripted"
        }
        fn init(&mut self, _bars: &[Bar]) -> Result<()> {
            Ok(())
        }
        fn warmup(&self) -> usize {
            0
        }
        fn next(&mut self, ctx: &BarContext<'_>) -> Option<Order> {
            self.orders
                .iter()
                .find(|(i, _)| *i == ctx.index)
                .map(|(_, o)| *o)
        }
    }

    fn no_fees() -> BacktestConfig {
        BacktestConfig {
            cash: 1_000.0,
            commission: 0.0,
            size: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn empty_bars_are_rejected() {
        assert!(Backtest::new(vec![], BacktestConfig::default()).is_err());
    }

    #[test]
    fn orders_fill_at_next_open_and_close_at_end() {
        let bars = vec![
            bar(0, 10.0, 10.0, 10.0, 10.0),
            bar(1, 11.0, 12.0, 11.0, 12.0),
            bar(2, 12.0, 13.0, 12.0, 13.0),
        ];
        let bt = Backtest::new(bars, no_fees()).unwrap();
        let mut s = Scripted {
            orders: vec![(0, Order::Buy { sl: None, tp: None })],
        };
        let res = bt.run(&mut s).unwrap();

        assert_eq!(res.trades.len(), 1);
        let t = &res.trades[0];
        assert_eq!(t.entry_price, 11.0);
        assert_eq!(t.exit_price, 13.0);
        assert_eq!(t.exit_reason, ExitReason::EndOfData);
        // 1000 / 11 units * 2
        assert!((t.pnl - 1000.0 / 11.0 * 2.0).abs() < 1e-9);
        assert!((res.equity.last().unwrap().equity - (1000.0 + t.pnl)).abs() < 1e-9);
        assert!(!res.equity[0].in_market);
        assert!(res.equity[1].in_market);
    }

    #[test]
    fn stop_loss_takes_priority_when_both_levels_hit() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.5, 99.5, 100.0),
            bar(2, 100.0, 103.0, 97.0, 100.0),
        ];
        let bt = Backtest::new(bars, no_fees()).unwrap();
        let mut s = Scripted {
            orders: vec![(
                0,
                Order::Buy {
                    sl: Some(98.0),
                    tp: Some(102.0),
                },
            )],
        };
        let res = bt.run(&mut s).unwrap();
        assert_eq!(res.trades.len(), 1);
        assert_eq!(res.trades[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(res.trades[0].exit_price, 98.0);
        assert_eq!(res.trades[0].exit_bar, 2);
    }

    #[test]
    fn short_take_profit_and_gap_fill() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            // gaps below the target: fills at the open
            bar(2, 95.0, 96.0, 94.0, 95.0),
        ];
        let bt = Backtest::new(bars, no_fees()).unwrap();
        let mut s = Scripted {
            orders: vec![(
                0,
                Order::Sell {
                    sl: Some(101.0),
                    tp: Some(98.0),
                },
            )],
        };
        let res = bt.run(&mut s).unwrap();
        let t = &res.trades[0];
        assert_eq!(t.side, Side::Short);
        assert_eq!(t.exit_reason, ExitReason::TakeProfit);
        assert_eq!(t.exit_price, 95.0);
        assert!((t.pnl - 10.0 * 5.0).abs() < 1e-9);
    }

    #[test]
    fn commission_is_charged_on_both_legs() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            bar(2, 100.0, 100.0, 100.0, 100.0),
        ];
        let config = BacktestConfig {
            cash: 1_000.0,
            commission: 0.01,
            size: 1.0,
            ..Default::default()
        };
        let bt = Backtest::new(bars, config).unwrap();
        let mut s = Scripted {
            orders: vec![(0, Order::Buy { sl: None, tp: None }), (1, Order::Close)],
        };
        let res = bt.run(&mut s).unwrap();
        let t = &res.trades[0];
        let units = 1_000.0 / (100.0 * 1.01);
        assert!((t.units - units).abs() < 1e-9);
        assert!((t.commission - 2.0 * 0.01 * units * 100.0).abs() < 1e-9);
        assert!((t.pnl + t.commission).abs() < 1e-9);
        assert_eq!(t.exit_reason, ExitReason::Signal);
        assert!(res.equity.last().unwrap().equity < 1_000.0);
    }

    #[test]
    fn leverage_scales_position_size() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
        ];
        let config = BacktestConfig {
            margin: 0.05,
            ..no_fees()
        };
        let bt = Backtest::new(bars, config).unwrap();
        let mut s = Scripted {
            orders: vec![(0, Order::Buy { sl: None, tp: None })],
        };
        let res = bt.run(&mut s).unwrap();
        assert!((res.trades[0].units - 200.0).abs() < 1e-9);
    }

    #[test]
    fn misplaced_levels_reject_the_order() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
        ];
        let bt = Backtest::new(bars, no_fees()).unwrap();
        let mut s = Scripted {
            orders: vec![(
                0,
                Order::Buy {
                    sl: Some(101.0),
                    tp: None,
                },
            )],
        };
        let res = bt.run(&mut s).unwrap();
        assert!(res.trades.is_empty());
    }

    #[test]
    fn order_on_last_bar_is_discarded() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
        ];
        let bt = Backtest::new(bars, no_fees()).unwrap();
        let mut s = Scripted {
            orders: vec![(1, Order::Buy { sl: None, tp: None })],
        };
        let res = bt.run(&mut s).unwrap();
        assert!(res.trades.is_empty());
        assert_eq!(res.equity.last().unwrap().equity, 1_000.0);
    }

    #[test]
    fn order_on_last_bar_is_discarded_with_trade_on_close() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
        ];
        let config = BacktestConfig {
            trade_on_close: true,
            commission: 0.0005,
            ..no_fees()
        };
        let bt = Backtest::new(bars, config).unwrap();
        let mut s = Scripted {
            orders: vec![(1, Order::Buy { sl: None, tp: None })],
        };
        let res = bt.run(&mut s).unwrap();
        assert!(res.trades.is_empty());
        assert_eq!(res.equity.last().unwrap().equity, 1_000.0);
        assert_eq!(res.stats.commissions, 0.0);
    }

    #[test]
    fn trade_on_close_fills_at_signal_close() {
        let bars = vec![
            bar(0, 100.0, 101.0, 99.0, 100.0),
            bar(1, 105.0, 111.0, 104.0, 110.0),
            bar(2, 120.0, 121.0, 119.0, 120.0),
        ];
        let config = BacktestConfig {
            trade_on_close: true,
            ..no_fees()
        };
        let bt = Backtest::new(bars, config).unwrap();
        let mut s = Scripted {
            orders: vec![(0, Order::Buy { sl: None, tp: None }), (1, Order::Close)],
        };
        let res = bt.run(&mut s).unwrap();
        assert_eq!(res.trades.len(), 1);
        let t = &res.trades[0];
        assert_eq!((t.entry_bar, t.entry_price), (0, 100.0));
        assert_eq!((t.exit_bar, t.exit_price), (1, 110.0));
        assert_eq!(t.exit_reason, ExitReason::Signal);
        assert!(res.equity[0].in_market);
        assert!(!res.equity[2].in_market);
    }

    #[test]
    fn bankruptcy_closes_and_stops_trading() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            bar(2, 80.0, 80.0, 80.0, 80.0),
            bar(3, 80.0, 80.0, 80.0, 80.0),
            bar(4, 90.0, 90.0, 90.0, 90.0),
        ];
        let config = BacktestConfig {
            margin: 0.05,
            ..no_fees()
        };
        let bt = Backtest::new(bars, config).unwrap();
        let mut s = Scripted {
            orders: vec![
                (0, Order::Buy { sl: None, tp: None }),
                (3, Order::Buy { sl: None, tp: None }),
            ],
        };
        let res = bt.run(&mut s).unwrap();

        // 200 units, 20 points down
        assert_eq!(res.trades.len(), 1);
        assert_eq!(res.trades[0].exit_reason, ExitReason::Bankrupt);
        assert!((res.trades[0].pnl + 4_000.0).abs() < 1e-9);
        assert_eq!(res.trades[0].exit_bar, 2);
        assert!(res.equity[3..].iter().all(|p| !p.in_market));
        assert!((res.equity.last().unwrap().equity + 3_000.0).abs() < 1e-9);
    }

    #[test]
    fn non_exclusive_entry_is_ignored_while_in_position() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            bar(2, 110.0, 110.0, 110.0, 110.0),
            bar(3, 110.0, 110.0, 110.0, 110.0),
        ];
        let config = BacktestConfig {
            exclusive_orders: false,
            ..no_fees()
        };
        let bt = Backtest::new(bars, config).unwrap();
        let mut s = Scripted {
            orders: vec![
                (0, Order::Buy { sl: None, tp: None }),
                (1, Order::Sell { sl: None, tp: None }),
            ],
        };
        let res = bt.run(&mut s).unwrap();
        assert_eq!(res.trades.len(), 1);
        assert_eq!(res.trades[0].side, Side::Long);
        assert_eq!(res.trades[0].exit_reason, ExitReason::EndOfData);
    }

    #[test]
    fn exclusive_entry_reverses_position() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            bar(2, 110.0, 110.0, 110.0, 110.0),
            bar(3, 110.0, 110.0, 110.0, 110.0),
        ];
        let bt = Backtest::new(bars, no_fees()).unwrap();
        let mut s = Scripted {
            orders: vec![
                (0, Order::Buy { sl: None, tp: None }),
                (1, Order::Sell { sl: None, tp: None }),
            ],
        };
        let res = bt.run(&mut s).unwrap();
        assert_eq!(res.trades.len(), 2);
        assert_eq!(res.trades[0].side, Side::Long);
        assert_eq!(res.trades[0].exit_price, 110.0);
        assert_eq!(res.trades[1].side, Side::Short);
    }

    #[test]
    fn save_writes_report_files() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 101.0, 100.0, 101.0),
            bar(2, 101.0, 102.0, 101.0, 102.0),
        ];
        let bt = Backtest::new(bars, no_fees()).unwrap();
        let mut s = Scripted {
            orders: vec![(0, Order::Buy { sl: None, tp: None })],
        };
        let res = bt.run(&mut s).unwrap();

        let dir = tempfile::tempdir().unwrap();
        res.save(dir.path()).unwrap();
        for name in ["stats.json", "trades.csv", "equity_curve.csv"] {
            assert!(dir.path().join(name).is_file(), "{} missing", name);
        }
        let stats: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("stats.json")).unwrap())
                .unwrap();
        assert_eq!(stats["# Trades"], 1);
    }
}
