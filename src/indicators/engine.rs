// =============================================================================
// Indicator Engine - request evaluation and timestamp alignment
// =============================================================================
//
// The free functions in the sibling modules return empty vectors on short
// input. The engine is the checked front door: it validates parameters and
// input, surfaces `IndicatorError`s synchronously, and attaches timestamps.
//
// Alignment: every output series is a suffix of its input. A series of `n`
// values computed from `m` candles takes the open times of the last `n`
// candles.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bollinger::{calculate_bollinger, DEFAULT_STD_DEV_MULTIPLIER};
use super::ema::calculate_ema;
use super::macd::calculate_macd;
use super::registry::{IndicatorOptions, IndicatorRegistry};
use super::rsi::calculate_rsi;
use super::sma::calculate_sma;
use crate::error::IndicatorError;
use crate::market_data::{Candle, KlineInterval};

fn default_std_dev() -> f64 {
    DEFAULT_STD_DEV_MULTIPLIER
}

/// A parameterised indicator to evaluate over a candle series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorRequest {
    Sma {
        period: usize,
    },
    Ema {
        period: usize,
    },
    Rsi {
        period: usize,
    },
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
    },
    Bollinger {
        period: usize,
        #[serde(default = "default_std_dev")]
        std_dev: f64,
    },
    Custom {
        name: String,
        #[serde(default)]
        period: usize,
        #[serde(default)]
        options: IndicatorOptions,
    },
}

impl IndicatorRequest {
    /// Minimum input length for every output series to be non-empty.
    pub fn required_len(&self) -> usize {
        match self {
            Self::Sma { period } | Self::Ema { period } | Self::Bollinger { period, .. } => {
                *period
            }
            Self::Rsi { period } => period + 1,
            Self::Macd { slow, signal, .. } => slow + signal.saturating_sub(1),
            Self::Custom { .. } => 0,
        }
    }

    /// Period recorded alongside stored results.
    pub fn period(&self) -> usize {
        match self {
            Self::Sma { period }
            | Self::Ema { period }
            | Self::Rsi { period }
            | Self::Bollinger { period, .. }
            | Self::Custom { period, .. } => *period,
            Self::Macd { slow, .. } => *slow,
        }
    }

    fn validate(&self) -> Result<(), IndicatorError> {
        match self {
            Self::Sma { period } | Self::Ema { period } | Self::Rsi { period }
                if *period == 0 =>
            {
                Err(IndicatorError::InvalidParameters("period must be >= 1".into()))
            }
            Self::Bollinger { period, std_dev } => {
                if *period == 0 {
                    Err(IndicatorError::InvalidParameters("period must be >= 1".into()))
                } else if !std_dev.is_finite() || *std_dev < 0.0 {
                    Err(IndicatorError::InvalidParameters(format!(
                        "std_dev multiplier must be finite and >= 0, got {std_dev}"
                    )))
                } else {
                    Ok(())
                }
            }
            Self::Macd { fast, slow, signal } => {
                if *fast == 0 || *signal == 0 {
                    Err(IndicatorError::InvalidParameters(
                        "MACD periods must be >= 1".into(),
                    ))
                } else if slow <= fast {
                    Err(IndicatorError::InvalidParameters(format!(
                        "MACD slow period ({slow}) must exceed fast period ({fast})"
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// One `(timestamp, value)` point of a derived series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorEntry {
    pub timestamp: i64,
    pub value: f64,
}

/// A named, parameterised series derived from a candle series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSeries {
    pub name: String,
    pub period: usize,
    pub entries: Vec<IndicatorEntry>,
}

impl IndicatorSeries {
    /// Name a series is stored under for one kline interval, e.g. `SMA@1h`.
    /// Storage keys carry no interval, so series of different intervals of
    /// the same symbol must not share a name.
    pub fn stored_name(name: &str, interval: KlineInterval) -> String {
        format!("{name}@{interval}")
    }

    pub fn scoped_to(mut self, interval: KlineInterval) -> Self {
        self.name = Self::stored_name(&self.name, interval);
        self
    }
}

/// Evaluates built-in and registered custom indicators.
///
/// Computation is synchronous and never suspends; share one engine behind an
/// `Arc` across tasks.
#[derive(Debug, Default, Clone)]
pub struct IndicatorEngine {
    registry: Arc<IndicatorRegistry>,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<IndicatorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<IndicatorRegistry> {
        &self.registry
    }

    /// Evaluate `request` over raw values, returning `(series name, values)`
    /// pairs. Values are right-aligned with `data`.
    pub fn evaluate_values(
        &self,
        request: &IndicatorRequest,
        data: &[f64],
    ) -> Result<Vec<(String, Vec<f64>)>, IndicatorError> {
        request.validate()?;

        if let Some(index) = data.iter().position(|v| !v.is_finite()) {
            return Err(IndicatorError::NonFiniteInput { index });
        }

        let required = request.required_len();
        if data.len() < required {
            return Err(IndicatorError::InsufficientData {
                required,
                actual: data.len(),
            });
        }

        let out = match request {
            IndicatorRequest::Sma { period } => vec![("SMA".into(), calculate_sma(data, *period))],
            IndicatorRequest::Ema { period } => vec![("EMA".into(), calculate_ema(data, *period))],
            IndicatorRequest::Rsi { period } => vec![("RSI".into(), calculate_rsi(data, *period))],
            IndicatorRequest::Macd { fast, slow, signal } => {
                let r = calculate_macd(data, *fast, *slow, *signal);
                let suffix = format!("{fast}_{slow}_{signal}");
                vec![
                    (format!("MACD_{suffix}"), r.macd),
                    (format!("MACD_SIGNAL_{suffix}"), r.signal),
                    (format!("MACD_HIST_{suffix}"), r.histogram),
                ]
            }
            IndicatorRequest::Bollinger { period, std_dev } => {
                let bands = calculate_bollinger(data, *period, *std_dev);
                vec![
                    (
                        format!("BB_UPPER_{std_dev}"),
                        bands.iter().map(|b| b.upper).collect(),
                    ),
                    (
                        format!("BB_MIDDLE_{std_dev}"),
                        bands.iter().map(|b| b.middle).collect(),
                    ),
                    (
                        format!("BB_LOWER_{std_dev}"),
                        bands.iter().map(|b| b.lower).collect(),
                    ),
                ]
            }
            IndicatorRequest::Custom { name, options, .. } => {
                let values = self.registry.compute(name, data, options)?;
                if values.len() > data.len() {
                    return Err(IndicatorError::Custom {
                        name: name.clone(),
                        reason: format!(
                            "produced {} values from {} inputs",
                            values.len(),
                            data.len()
                        ),
                    });
                }
                vec![(name.clone(), values)]
            }
        };

        Ok(out)
    }

    /// Evaluate `request` over candle close prices and attach the open time of
    /// the candle each value belongs to.
    pub fn evaluate(
        &self,
        request: &IndicatorRequest,
        candles: &[Candle],
    ) -> Result<Vec<IndicatorSeries>, IndicatorError> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let timestamps: Vec<i64> = candles.iter().map(|c| c.open_time).collect();

        self.evaluate_values(request, &closes)?
            .into_iter()
            .map(|(name, values)| {
                Ok(IndicatorSeries {
                    entries: align_to_suffix(&timestamps, &values),
                    name,
                    period: request.period(),
                })
            })
            .collect()
    }
}

/// Pair `values` with the last `values.len()` timestamps.
///
/// Callers guarantee `values.len() <= timestamps.len()`.
pub fn align_to_suffix(timestamps: &[i64], values: &[f64]) -> Vec<IndicatorEntry> {
    let start = timestamps.len() - values.len();
    timestamps[start..]
        .iter()
        .zip(values)
        .map(|(&timestamp, &value)| IndicatorEntry { timestamp, value })
        .collect()
}
