//! Built-in indicators and the name -> constructor registry.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use crate::domain::{IndicatorResult, Kline, Signal};
use crate::error::{Error, Result};

/// A technical indicator. Each computation receives the full candle
/// window; indicators hold parameters, not K-line history.
pub trait Indicator: Send + std::fmt::Debug {
    /// Closed candles required before the first computation.
    fn min_klines(&self) -> usize;

    /// Consume the historical window once, before live updates.
    fn initialize(&mut self, klines: &[Kline]) -> Result<()>;

    fn compute(&mut self, klines: &[Kline]) -> IndicatorResult;
}

pub type IndicatorCtor = fn(&serde_json::Value) -> Result<Box<dyn Indicator>>;

/// Maps indicator names to constructors. Populated before any
/// subscription is honored.
#[derive(Default)]
pub struct IndicatorRegistry {
    ctors: HashMap<String, IndicatorCtor>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ma", MovingAverage::create);
        registry.register("rsi", Rsi::create);
        registry.register("ma_stop", MaStop::create);
        registry
    }

    pub fn register(&mut self, name: &str, ctor: IndicatorCtor) {
        self.ctors.insert(name.to_string(), ctor);
    }

    pub fn create(&self, name: &str, params: &serde_json::Value) -> Result<Box<dyn Indicator>> {
        // Strategy files may carry the `_ta` module suffix from the
        // indicator naming convention.
        let lookup = name.strip_suffix("_ta").unwrap_or(name);
        let ctor = self
            .ctors
            .get(lookup)
            .ok_or_else(|| Error::Config(format!("unknown indicator: {name}")))?;
        ctor(params)
    }
}

fn closes(klines: &[Kline]) -> Vec<Decimal> {
    klines.iter().map(|k| k.close).collect()
}

fn simple_ma(closes: &[Decimal], period: usize) -> Option<Decimal> {
    if closes.len() < period || period == 0 {
        return None;
    }
    let sum: Decimal = closes[closes.len() - period..].iter().copied().sum();
    Some(sum / Decimal::from(period))
}

#[derive(Debug, Deserialize)]
struct MaParams {
    period: usize,
}

/// Simple moving-average cross: close above the average is long
/// pressure, below is short.
#[derive(Debug)]
pub struct MovingAverage {
    period: usize,
}

impl MovingAverage {
    pub fn create(params: &serde_json::Value) -> Result<Box<dyn Indicator>> {
        let params: MaParams = serde_json::from_value(params.clone())
            .map_err(|e| Error::Config(format!("invalid ma params: {e}")))?;
        if params.period == 0 {
            return Err(Error::Config("ma period must be positive".into()));
        }
        Ok(Box::new(Self { period: params.period }))
    }
}

impl Indicator for MovingAverage {
    fn min_klines(&self) -> usize {
        self.period
    }

    fn initialize(&mut self, klines: &[Kline]) -> Result<()> {
        if klines.len() < self.min_klines() {
            return Err(Error::Business(format!(
                "ma needs {} candles, got {}",
                self.min_klines(),
                klines.len()
            )));
        }
        Ok(())
    }

    fn compute(&mut self, klines: &[Kline]) -> IndicatorResult {
        let closes = closes(klines);
        let Some(ma) = simple_ma(&closes, self.period) else {
            return IndicatorResult { signal: Signal::None, data: json!({}) };
        };
        let close = closes[closes.len() - 1];
        let signal = if close > ma {
            Signal::Long
        } else if close < ma {
            Signal::Short
        } else {
            Signal::None
        };
        IndicatorResult {
            signal,
            data: json!({ "ma": ma, "close": close }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RsiParams {
    period: usize,
    #[serde(default = "default_overbought")]
    overbought: Decimal,
    #[serde(default = "default_oversold")]
    oversold: Decimal,
}

fn default_overbought() -> Decimal {
    Decimal::from(70)
}

fn default_oversold() -> Decimal {
    Decimal::from(30)
}

/// Relative strength index with configurable bands. Oversold reads
/// long, overbought reads short.
#[derive(Debug)]
pub struct Rsi {
    period: usize,
    overbought: Decimal,
    oversold: Decimal,
}

impl Rsi {
    pub fn create(params: &serde_json::Value) -> Result<Box<dyn Indicator>> {
        let params: RsiParams = serde_json::from_value(params.clone())
            .map_err(|e| Error::Config(format!("invalid rsi params: {e}")))?;
        if params.period == 0 {
            return Err(Error::Config("rsi period must be positive".into()));
        }
        Ok(Box::new(Self {
            period: params.period,
            overbought: params.overbought,
            oversold: params.oversold,
        }))
    }

    fn rsi(&self, closes: &[Decimal]) -> Option<Decimal> {
        if closes.len() < self.period + 1 {
            return None;
        }
        let window = &closes[closes.len() - self.period - 1..];
        let mut gains = Decimal::ZERO;
        let mut losses = Decimal::ZERO;
        for pair in window.windows(2) {
            let change = pair[1] - pair[0];
            if change >= Decimal::ZERO {
                gains += change;
            } else {
                losses -= change;
            }
        }
        if losses == Decimal::ZERO {
            return Some(Decimal::from(100));
        }
        let rs = gains / losses;
        Some(Decimal::from(100) - Decimal::from(100) / (Decimal::ONE + rs))
    }
}

impl Indicator for Rsi {
    fn min_klines(&self) -> usize {
        self.period + 1
    }

    fn initialize(&mut self, klines: &[Kline]) -> Result<()> {
        if klines.len() < self.min_klines() {
            return Err(Error::Business(format!(
                "rsi needs {} candles, got {}",
                self.min_klines(),
                klines.len()
            )));
        }
        Ok(())
    }

    fn compute(&mut self, klines: &[Kline]) -> IndicatorResult {
        let closes = closes(klines);
        let Some(rsi) = self.rsi(&closes) else {
            return IndicatorResult { signal: Signal::None, data: json!({}) };
        };
        let signal = if rsi <= self.oversold {
            Signal::Long
        } else if rsi >= self.overbought {
            Signal::Short
        } else {
            Signal::None
        };
        IndicatorResult { signal, data: json!({ "rsi": rsi }) }
    }
}

#[derive(Debug, Deserialize)]
struct MaStopParams {
    period: usize,
    #[serde(default = "default_stop_ratio")]
    stop_ratio: Decimal,
}

fn default_stop_ratio() -> Decimal {
    Decimal::new(2, 2)
}

/// Moving-average trend filter with a stop band around the average.
/// Price clearing the band in either direction is a directional signal;
/// inside the band is no-man's-land.
#[derive(Debug)]
pub struct MaStop {
    period: usize,
    stop_ratio: Decimal,
}

impl MaStop {
    pub fn create(params: &serde_json::Value) -> Result<Box<dyn Indicator>> {
        let params: MaStopParams = serde_json::from_value(params.clone())
            .map_err(|e| Error::Config(format!("invalid ma_stop params: {e}")))?;
        if params.period == 0 {
            return Err(Error::Config("ma_stop period must be positive".into()));
        }
        if params.stop_ratio <= Decimal::ZERO || params.stop_ratio >= Decimal::ONE {
            return Err(Error::Config("ma_stop stop_ratio must be in (0, 1)".into()));
        }
        Ok(Box::new(Self {
            period: params.period,
            stop_ratio: params.stop_ratio,
        }))
    }
}

impl Indicator for MaStop {
    fn min_klines(&self) -> usize {
        self.period
    }

    fn initialize(&mut self, klines: &[Kline]) -> Result<()> {
        if klines.len() < self.min_klines() {
            return Err(Error::Business(format!(
                "ma_stop needs {} candles, got {}",
                self.min_klines(),
                klines.len()
            )));
        }
        Ok(())
    }

    fn compute(&mut self, klines: &[Kline]) -> IndicatorResult {
        let closes = closes(klines);
        let Some(ma) = simple_ma(&closes, self.period) else {
            return IndicatorResult { signal: Signal::None, data: json!({}) };
        };
        let close = closes[closes.len() - 1];
        let upper = ma * (Decimal::ONE + self.stop_ratio);
        let lower = ma * (Decimal::ONE - self.stop_ratio);
        let signal = if close > upper {
            Signal::Long
        } else if close < lower {
            Signal::Short
        } else {
            Signal::None
        };
        IndicatorResult {
            signal,
            data: json!({ "ma": ma, "upper": upper, "lower": lower }),
        }
    }
}
