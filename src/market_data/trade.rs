// =============================================================================
// Trades - typed form of the trade channel payload
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IngestError;
use crate::market_data::candle::{parse_decimal, parse_int};

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub trade_time: i64,
    /// Buyer is maker, so the taker sold.
    pub is_buyer_maker: bool,
}

impl Trade {
    /// Quote-currency value of the trade.
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Parse a trade (or aggTrade) message.
///
/// Expected shape:
/// ```json
/// { "e": "trade", "s": "BTCUSDT", "t": 12345, "p": "37000.00", "q": "0.123", "T": 1700000000000, "m": true }
/// ```
/// aggTrade frames carry the id in `a` instead of `t`.
pub fn parse_trade_event(root: &Value) -> Result<Trade, IngestError> {
    let data = root.get("data").unwrap_or(root);

    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| IngestError::MalformedMessage("missing field s".into()))?
        .to_uppercase();

    let id_field = if data.get("t").is_some() { "t" } else { "a" };
    let trade_id = parse_int(&data[id_field], id_field)?;

    let is_buyer_maker = data["m"]
        .as_bool()
        .ok_or_else(|| IngestError::MalformedMessage("missing field m".into()))?;

    Ok(Trade {
        symbol,
        trade_id: trade_id.max(0) as u64,
        price: parse_decimal(&data["p"], "p")?,
        quantity: parse_decimal(&data["q"], "q")?,
        trade_time: parse_int(&data["T"], "T")?,
        is_buyer_maker,
    })
}
