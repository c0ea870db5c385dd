//! Consumer-side aggregation of REST candles and realtime ticks.
//!
//! A [`CandleSeries`] is seeded with historical candles through
//! [`merge`](CandleSeries::merge) and then kept live with
//! [`apply_tick`](CandleSeries::apply_tick). Both return the index of the
//! first candle that changed so indicators only recompute the tail.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use tracing::{debug, trace};

use crate::models::{CandleData, RealtimeTickData};
use crate::resolution::CandleResolution;
use crate::{ChartfeedError, Result};

/// Ordered candles of one symbol at one resolution.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    symbol: String,
    resolution: CandleResolution,
    candles: Vec<CandleData>,
}

impl CandleSeries {
    #[must_use]
    pub fn new(symbol: impl Into<String>, resolution: CandleResolution) -> Self {
        Self {
            symbol: symbol.into(),
            resolution,
            candles: Vec::new(),
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn resolution(&self) -> CandleResolution {
        self.resolution
    }

    #[must_use]
    pub fn candles(&self) -> &[CandleData] {
        &self.candles
    }

    #[must_use]
    pub fn last(&self) -> Option<&CandleData> {
        self.candles.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Merges candles into the series. A candle whose timestamp is already
    /// present replaces the stored one.
    ///
    /// Returns the index of the first changed candle, or `None` if
    /// `incoming` was empty.
    pub fn merge<I>(&mut self, incoming: I) -> Option<usize>
    where
        I: IntoIterator<Item = CandleData>,
    {
        let mut first_changed: Option<usize> = None;
        for candle in incoming {
            let index = match self
                .candles
                .binary_search_by(|probe| probe.timestamp.cmp(&candle.timestamp))
            {
                Ok(index) => {
                    self.candles[index] = candle;
                    index
                }
                Err(index) => {
                    self.candles.insert(index, candle);
                    index
                }
            };
            first_changed = Some(first_changed.map_or(index, |first| first.min(index)));
        }

        if let Some(first) = first_changed {
            debug!(
                symbol = %self.symbol,
                resolution = self.resolution.as_str(),
                first,
                len = self.candles.len(),
                "Merged candles"
            );
        }
        first_changed
    }

    /// Folds a trade into the series.
    ///
    /// A trade in the newest bucket updates that candle. A later trade opens
    /// a new candle at its bucket start, unless its conditions forbid moving
    /// the last price. An older trade updates the candle containing it but
    /// never its close. Returns the index of the changed candle.
    pub fn apply_tick(&mut self, tick: &RealtimeTickData) -> Option<usize> {
        let context = tick.context;
        let Some(last) = self.candles.last() else {
            return self.open_candle(tick);
        };

        let delta = self
            .resolution
            .get_delta_candle_count(&last.timestamp, &tick.timestamp);
        match delta {
            0 => {
                let index = self.candles.len() - 1;
                let candle = &mut self.candles[index];
                update_extremes(candle, tick);
                if context.updates_last() {
                    candle.close = tick.price;
                }
                Some(index)
            }
            delta if delta > 0 => self.open_candle(tick),
            _ => {
                let index = self
                    .candles
                    .partition_point(|candle| candle.timestamp <= tick.timestamp)
                    .checked_sub(1)?;
                let candle = &mut self.candles[index];
                if self
                    .resolution
                    .get_delta_candle_count(&candle.timestamp, &tick.timestamp)
                    != 0
                {
                    trace!(symbol = %self.symbol, at = %tick.timestamp, "Late trade falls into a gap");
                    return None;
                }
                update_extremes(candle, tick);
                Some(index)
            }
        }
    }

    fn open_candle(&mut self, tick: &RealtimeTickData) -> Option<usize> {
        if !tick.context.updates_last() {
            return None;
        }
        let start = self.resolution.get_recent_candle_start_time(&tick.timestamp);
        let volume = if tick.context.updates_volume() {
            tick.volume
        } else {
            Decimal::ZERO
        };
        self.candles.push(CandleData::from_trade(start, tick.price, volume));
        Some(self.candles.len() - 1)
    }
}

fn update_extremes(candle: &mut CandleData, tick: &RealtimeTickData) {
    if tick.context.updates_high_low() {
        candle.high = candle.high.max(tick.price);
        candle.low = candle.low.min(tick.price);
    }
    if tick.context.updates_volume() {
        candle.volume += tick.volume;
    }
}

/// Indicators known to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndicatorKind {
    /// Simple moving average of closes.
    Sma,
}

impl IndicatorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sma => "sma",
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndicatorKind {
    type Err = ChartfeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sma" => Ok(Self::Sma),
            other => Err(ChartfeedError::Config(format!("unknown indicator: {other}"))),
        }
    }
}

/// A series derived from candles, one value per candle.
pub trait Indicator: Send {
    fn kind(&self) -> IndicatorKind;

    /// Recomputes values from `first_changed` onwards. Values before it are
    /// kept.
    fn update(&mut self, candles: &[CandleData], first_changed: usize);

    /// One entry per candle; `None` where the indicator is not yet defined.
    fn values(&self) -> &[Option<Decimal>];
}

/// Simple moving average over `period` closes.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    values: Vec<Option<Decimal>>,
}

impl Sma {
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Config`] for a zero period.
    pub fn new(period: usize) -> Result<Self> {
        if period == 0 {
            return Err(ChartfeedError::Config("SMA period must be positive".to_string()));
        }
        Ok(Self {
            period,
            values: Vec::new(),
        })
    }

    #[must_use]
    pub fn period(&self) -> usize {
        self.period
    }
}

impl Indicator for Sma {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::Sma
    }

    fn update(&mut self, candles: &[CandleData], first_changed: usize) {
        self.values.truncate(first_changed.min(candles.len()));
        let divisor = Decimal::from(self.period);
        for end in self.values.len()..candles.len() {
            let value = (end + 1 >= self.period).then(|| {
                candles[end + 1 - self.period..=end]
                    .iter()
                    .map(|candle| candle.close)
                    .sum::<Decimal>()
                    / divisor
            });
            self.values.push(value);
        }
    }

    fn values(&self) -> &[Option<Decimal>] {
        &self.values
    }
}

/// Builds an indicator from its period.
pub type IndicatorFactory = fn(usize) -> Result<Box<dyn Indicator>>;

fn sma_factory(period: usize) -> Result<Box<dyn Indicator>> {
    Ok(Box::new(Sma::new(period)?))
}

/// Explicit map of indicator constructors, populated at start-up.
#[derive(Clone, Default)]
pub struct IndicatorRegistry {
    factories: HashMap<IndicatorKind, IndicatorFactory>,
}

impl fmt::Debug for IndicatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndicatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl IndicatorRegistry {
    /// Registry holding every built-in indicator.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(IndicatorKind::Sma, sma_factory);
        registry
    }

    /// Adds or replaces the factory for `kind`.
    pub fn register(&mut self, kind: IndicatorKind, factory: IndicatorFactory) {
        self.factories.insert(kind, factory);
    }

    /// # Errors
    ///
    /// Returns [`ChartfeedError::NotSupported`] if `kind` is not registered,
    /// or the factory's own error.
    pub fn create(&self, kind: IndicatorKind, period: usize) -> Result<Box<dyn Indicator>> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| ChartfeedError::NotSupported(format!("indicator {kind}")))?;
        factory(period)
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<IndicatorKind> {
        let mut kinds: Vec<IndicatorKind> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeContext;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, h, m, s).unwrap()
    }

    fn tick(t: DateTime<Utc>, price: Decimal, context: TradeContext) -> RealtimeTickData {
        RealtimeTickData {
            timestamp: t,
            price,
            volume: dec!(10),
            context,
        }
    }

    fn candle(t: DateTime<Utc>, close: Decimal) -> CandleData {
        CandleData {
            timestamp: t,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(100),
        }
    }

    #[test]
    fn merge_dedupes_and_sorts() {
        let mut series = CandleSeries::new("AAPL", CandleResolution::Minute1);
        assert_eq!(
            series.merge([candle(at(10, 2, 0), dec!(3)), candle(at(10, 0, 0), dec!(1))]),
            Some(0)
        );
        assert_eq!(
            series.merge([candle(at(10, 1, 0), dec!(2)), candle(at(10, 2, 0), dec!(4))]),
            Some(1)
        );

        let closes: Vec<Decimal> = series.candles().iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![dec!(1), dec!(2), dec!(4)]);
        assert_eq!(series.merge(Vec::new()), None);
    }

    #[test]
    fn tick_in_current_bucket_updates_candle() {
        let mut series = CandleSeries::new("AAPL", CandleResolution::Minute5);
        series.merge([candle(at(10, 0, 0), dec!(100))]);

        let changed = series.apply_tick(&tick(at(10, 3, 59), dec!(105), TradeContext::REGULAR));
        assert_eq!(changed, Some(0));
        let last = series.last().unwrap();
        assert_eq!(last.high, dec!(105));
        assert_eq!(last.close, dec!(105));
        assert_eq!(last.volume, dec!(110));
    }

    #[test]
    fn tick_in_later_bucket_opens_candle_at_bucket_start() {
        let mut series = CandleSeries::new("AAPL", CandleResolution::Minute5);
        series.merge([candle(at(10, 0, 0), dec!(100))]);

        let changed = series.apply_tick(&tick(at(10, 17, 30), dec!(99), TradeContext::REGULAR));
        assert_eq!(changed, Some(1));
        let last = series.last().unwrap();
        assert_eq!(last.timestamp, at(10, 15, 0));
        assert_eq!(last.open, dec!(99));
        assert_eq!(last.volume, dec!(10));
    }

    #[test]
    fn late_tick_never_moves_close() {
        let mut series = CandleSeries::new("AAPL", CandleResolution::Minute1);
        series.merge([candle(at(10, 0, 0), dec!(100)), candle(at(10, 1, 0), dec!(101))]);

        let changed = series.apply_tick(&tick(at(10, 0, 30), dec!(90), TradeContext::REGULAR));
        assert_eq!(changed, Some(0));
        let first = &series.candles()[0];
        assert_eq!(first.low, dec!(90));
        assert_eq!(first.close, dec!(100));
    }

    #[test]
    fn inhibited_trade_only_adds_volume() {
        let mut series = CandleSeries::new("AAPL", CandleResolution::Minute1);
        series.merge([candle(at(10, 0, 0), dec!(100))]);

        let odd_lot = TradeContext::SKIP_LAST | TradeContext::SKIP_HIGH_LOW;
        series.apply_tick(&tick(at(10, 0, 10), dec!(120), odd_lot));
        let last = series.last().unwrap();
        assert_eq!(last.high, dec!(100));
        assert_eq!(last.close, dec!(100));
        assert_eq!(last.volume, dec!(110));

        assert_eq!(series.apply_tick(&tick(at(10, 5, 0), dec!(120), odd_lot)), None);
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn sma_recomputes_tail_only() {
        let mut series = CandleSeries::new("AAPL", CandleResolution::Minute1);
        series.merge((0..4).map(|i| candle(at(10, i, 0), Decimal::from(i + 1))));

        let mut sma = Sma::new(2).unwrap();
        sma.update(series.candles(), 0);
        assert_eq!(
            sma.values(),
            &[None, Some(dec!(1.5)), Some(dec!(2.5)), Some(dec!(3.5))]
        );

        let changed = series
            .apply_tick(&tick(at(10, 3, 30), dec!(6), TradeContext::REGULAR))
            .unwrap();
        sma.update(series.candles(), changed);
        assert_eq!(sma.values()[3], Some(dec!(4.5)));
        assert_eq!(sma.values().len(), 4);
    }

    #[test]
    fn registry_creates_registered_indicators() {
        let registry = IndicatorRegistry::with_builtin();
        assert_eq!(registry.kinds(), vec![IndicatorKind::Sma]);
        let sma = registry.create("SMA".parse().unwrap(), 20).unwrap();
        assert_eq!(sma.kind(), IndicatorKind::Sma);
        assert!(registry.create(IndicatorKind::Sma, 0).is_err());
        assert!(matches!(
            IndicatorRegistry::default().create(IndicatorKind::Sma, 5),
            Err(ChartfeedError::NotSupported(_))
        ));
    }
}
