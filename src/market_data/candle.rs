use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IngestError;
use crate::market_data::KlineInterval;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle.
///
/// For a contiguous series, `open_time` of candle N+1 equals `close_time` of
/// candle N plus one millisecond.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Whether `next` starts exactly one millisecond after this candle closes.
    pub fn is_followed_by(&self, next: &Candle) -> bool {
        next.open_time == self.close_time + 1
    }
}

/// Composite key that identifies a unique candle series.
///
/// Together with a candle's `open_time` it forms the upsert identity: the
/// last write for a given `(key, open_time)` wins.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: KlineInterval,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: KlineInterval) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            interval,
        }
    }
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// Wire decoding
// ---------------------------------------------------------------------------

/// The exchange sends decimals as JSON strings, sometimes as numbers.
///
/// Anything else, including strings such as `"NaN"` that parse to a
/// non-finite float, is rejected rather than coerced.
pub fn parse_decimal(val: &Value, name: &str) -> Result<f64, IngestError> {
    let parsed = match val {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| IngestError::MalformedMessage(format!("field {name}: '{s}' is not a number")))?,
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| IngestError::MalformedMessage(format!("field {name} is not a valid f64")))?,
        other => {
            return Err(IngestError::MalformedMessage(format!(
                "field {name} has unexpected JSON type: {other}"
            )))
        }
    };

    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(IngestError::MalformedMessage(format!("field {name} is not finite")))
    }
}

/// Integer fields (timestamps, counts) arrive as numbers, occasionally as
/// strings.
pub fn parse_int(val: &Value, name: &str) -> Result<i64, IngestError> {
    match val {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| IngestError::MalformedMessage(format!("field {name} is not an integer"))),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| IngestError::MalformedMessage(format!("field {name}: '{s}' is not an integer"))),
        Value::Null => Err(IngestError::MalformedMessage(format!("missing field {name}"))),
        other => Err(IngestError::MalformedMessage(format!(
            "field {name} has unexpected JSON type: {other}"
        ))),
    }
}

/// Decode one row of the REST klines response.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades,
///   [9] takerBuyBaseVolume, [10] takerBuyQuoteVolume
///
/// `now_ms` decides finality: a candle whose close time has passed is closed.
pub fn candle_from_rest_row(row: &Value, now_ms: i64) -> Result<Candle, IngestError> {
    let arr = row
        .as_array()
        .ok_or_else(|| IngestError::MalformedMessage("kline row is not an array".into()))?;

    if arr.len() < 11 {
        return Err(IngestError::MalformedMessage(format!(
            "kline row has {} elements, expected 11",
            arr.len()
        )));
    }

    let open_time = parse_int(&arr[0], "openTime")?;
    let close_time = parse_int(&arr[6], "closeTime")?;
    let trades_count = parse_int(&arr[8], "numberOfTrades")?;

    Ok(Candle {
        open_time,
        close_time,
        open: parse_decimal(&arr[1], "open")?,
        high: parse_decimal(&arr[2], "high")?,
        low: parse_decimal(&arr[3], "low")?,
        close: parse_decimal(&arr[4], "close")?,
        volume: parse_decimal(&arr[5], "volume")?,
        quote_volume: parse_decimal(&arr[7], "quoteAssetVolume")?,
        trades_count: trades_count.max(0) as u64,
        taker_buy_volume: parse_decimal(&arr[9], "takerBuyBaseVolume")?,
        taker_buy_quote_volume: parse_decimal(&arr[10], "takerBuyQuoteVolume")?,
        is_closed: close_time < now_ms,
    })
}

/// Parse a kline stream event.
///
/// Accepts both the single-stream payload and the combined-stream envelope:
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": ..., "T": ..., "i": "1m", ... } }
/// { "stream": "btcusdt@kline_1m", "data": { ... } }
/// ```
pub fn parse_kline_event(root: &Value) -> Result<(CandleKey, Candle), IngestError> {
    let data = root.get("data").unwrap_or(root);

    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| IngestError::MalformedMessage("missing field s".into()))?;

    let k = data
        .get("k")
        .filter(|k| k.is_object())
        .ok_or_else(|| IngestError::MalformedMessage("missing kline object k".into()))?;

    let interval: KlineInterval = k["i"]
        .as_str()
        .ok_or_else(|| IngestError::MalformedMessage("missing field k.i".into()))?
        .parse()
        .map_err(|e: IngestError| IngestError::MalformedMessage(e.to_string()))?;

    let trades_count = parse_int(&k["n"], "k.n")?;
    let is_closed = k["x"]
        .as_bool()
        .ok_or_else(|| IngestError::MalformedMessage("missing field k.x".into()))?;

    let candle = Candle {
        open_time: parse_int(&k["t"], "k.t")?,
        close_time: parse_int(&k["T"], "k.T")?,
        open: parse_decimal(&k["o"], "k.o")?,
        high: parse_decimal(&k["h"], "k.h")?,
        low: parse_decimal(&k["l"], "k.l")?,
        close: parse_decimal(&k["c"], "k.c")?,
        volume: parse_decimal(&k["v"], "k.v")?,
        quote_volume: parse_decimal(&k["q"], "k.q")?,
        trades_count: trades_count.max(0) as u64,
        taker_buy_volume: parse_decimal(&k["V"], "k.V")?,
        taker_buy_quote_volume: parse_decimal(&k["Q"], "k.Q")?,
        is_closed,
    };

    Ok((CandleKey::new(symbol, interval), candle))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decimals_from_strings_and_numbers() {
        assert_eq!(parse_decimal(&json!("37000.50"), "p").unwrap(), 37000.5);
        assert_eq!(parse_decimal(&json!(12.25), "p").unwrap(), 12.25);
    }

    #[test]
    fn non_numeric_decimal_is_rejected() {
        assert!(parse_decimal(&json!("abc"), "p").is_err());
        assert!(parse_decimal(&json!("NaN"), "p").is_err());
        assert!(parse_decimal(&json!(null), "p").is_err());
        assert!(parse_decimal(&json!([1]), "p").is_err());
    }

    #[test]
    fn rest_row_decodes() {
        let row = json!([
            1700000000000_i64, "37000.00", "37050.00", "36990.00", "37020.00", "123.456",
            1700000059999_i64, "4567890.12", 1500, "60.123", "2224455.66", "0"
        ]);
        let candle = candle_from_rest_row(&row, 1700000060000).unwrap();
        assert_eq!(candle.open_time, 1700000000000);
        assert_eq!(candle.close_time, 1700000059999);
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert_eq!(candle.trades_count, 1500);
        assert!(candle.is_closed);
    }

    #[test]
    fn rest_row_in_progress_is_open() {
        let row = json!([0, "1", "2", "0.5", "1.5", "100", 59_999, "0", 1, "0", "0"]);
        let candle = candle_from_rest_row(&row, 30_000).unwrap();
        assert!(!candle.is_closed);
    }

    #[test]
    fn short_rest_row_is_rejected() {
        let row = json!([0, "1", "2"]);
        assert!(candle_from_rest_row(&row, 0).is_err());
    }

    #[test]
    fn kline_event_single_and_combined() {
        let single = json!({
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000_i64, "T": 1700000059999_i64, "i": "1m",
                "o": "37000.00", "h": "37050.00", "l": "36990.00", "c": "37020.00",
                "v": "123.456", "q": "4567890.12", "n": 1500,
                "V": "60.123", "Q": "2224455.66", "x": false
            }
        });
        let (key, candle) = parse_kline_event(&single).expect("should parse");
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.interval, KlineInterval::Min1);
        assert!(!candle.is_closed);

        let combined = json!({ "stream": "btcusdt@kline_1m", "data": single });
        let (key2, candle2) = parse_kline_event(&combined).expect("should parse");
        assert_eq!(key, key2);
        assert_eq!(candle, candle2);
    }

    #[test]
    fn kline_event_without_k_is_malformed() {
        let msg = json!({ "e": "kline", "s": "BTCUSDT" });
        assert!(matches!(
            parse_kline_event(&msg),
            Err(IngestError::MalformedMessage(_))
        ));
    }

    #[test]
    fn contiguity() {
        let a = candle_from_rest_row(
            &json!([0, "1", "1", "1", "1", "0", 59_999, "0", 0, "0", "0"]),
            i64::MAX,
        )
        .unwrap();
        let b = candle_from_rest_row(
            &json!([60_000, "1", "1", "1", "1", "0", 119_999, "0", 0, "0", "0"]),
            i64::MAX,
        )
        .unwrap();
        assert!(a.is_followed_by(&b));
        assert!(!b.is_followed_by(&a));
    }
}
