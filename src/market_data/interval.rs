// =============================================================================
// Interval calendar - kline interval names and their durations
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IngestError;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Candle intervals accepted by the exchange kline endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KlineInterval {
    Min1,
    Min3,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour2,
    Hour4,
    Hour6,
    Hour8,
    Hour12,
    Day1,
    Day3,
    Week1,
    Month1,
}

impl KlineInterval {
    /// All intervals, finest first.
    pub fn all() -> &'static [KlineInterval] {
        use KlineInterval::*;
        &[
            Min1, Min3, Min5, Min15, Min30, Hour1, Hour2, Hour4, Hour6, Hour8, Hour12, Day1,
            Day3, Week1, Month1,
        ]
    }

    /// Wire name, e.g. `"1m"` or `"1M"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min3 => "3m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour2 => "2h",
            Self::Hour4 => "4h",
            Self::Hour6 => "6h",
            Self::Hour8 => "8h",
            Self::Hour12 => "12h",
            Self::Day1 => "1d",
            Self::Day3 => "3d",
            Self::Week1 => "1w",
            Self::Month1 => "1M",
        }
    }

    /// Bar duration in milliseconds. A month is counted as 30 days.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::Min1 => MINUTE_MS,
            Self::Min3 => 3 * MINUTE_MS,
            Self::Min5 => 5 * MINUTE_MS,
            Self::Min15 => 15 * MINUTE_MS,
            Self::Min30 => 30 * MINUTE_MS,
            Self::Hour1 => HOUR_MS,
            Self::Hour2 => 2 * HOUR_MS,
            Self::Hour4 => 4 * HOUR_MS,
            Self::Hour6 => 6 * HOUR_MS,
            Self::Hour8 => 8 * HOUR_MS,
            Self::Hour12 => 12 * HOUR_MS,
            Self::Day1 => DAY_MS,
            Self::Day3 => 3 * DAY_MS,
            Self::Week1 => 7 * DAY_MS,
            Self::Month1 => 30 * DAY_MS,
        }
    }
}

impl FromStr for KlineInterval {
    type Err = IngestError;

    // Case matters: "1m" is a minute, "1M" is a month.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KlineInterval::all()
            .iter()
            .copied()
            .find(|iv| iv.as_str() == s)
            .ok_or_else(|| IngestError::UnknownInterval(s.to_string()))
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for KlineInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for KlineInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Duration in milliseconds of a named interval.
pub fn interval_to_ms(name: &str) -> Result<i64, IngestError> {
    name.parse::<KlineInterval>().map(|iv| iv.duration_ms())
}
