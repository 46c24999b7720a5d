// =============================================================================
// Order-book depth snapshots and update-id sequencing
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IngestError;
use crate::market_data::candle::{parse_decimal, parse_int};

/// One price level of the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Point-in-time book state keyed by `(symbol, last_update_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Spread in basis points of the mid price.
    pub fn spread_bps(&self) -> Option<f64> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        let mid = (bid + ask) / 2.0;
        if mid > 0.0 {
            Some(((ask - bid) / mid) * 10_000.0)
        } else {
            None
        }
    }

    /// (bid depth - ask depth) / total depth, in [-1, 1].
    pub fn imbalance(&self) -> f64 {
        let bid_depth: f64 = self.bids.iter().map(|l| l.quantity).sum();
        let ask_depth: f64 = self.asks.iter().map(|l| l.quantity).sum();
        let total = bid_depth + ask_depth;
        if total > 0.0 {
            (bid_depth - ask_depth) / total
        } else {
            0.0
        }
    }
}

/// Parse a depth payload.
///
/// Both shapes the exchange uses are accepted:
/// ```json
/// { "e": "depthUpdate", "s": "BTCUSDT", "u": 160, "b": [["37000.00", "1.5"]], "a": [...] }
/// { "lastUpdateId": 160, "bids": [["37000.00", "1.5"]], "asks": [...] }
/// ```
/// Partial-depth payloads carry no symbol, so `fallback_symbol` is used.
pub fn parse_depth_event(root: &Value, fallback_symbol: &str) -> Result<DepthSnapshot, IngestError> {
    let data = root.get("data").unwrap_or(root);

    let id_field = if data.get("u").is_some() { "u" } else { "lastUpdateId" };
    let last_update_id = parse_int(&data[id_field], id_field)?;
    if last_update_id < 0 {
        return Err(IngestError::MalformedMessage(format!(
            "negative update id {last_update_id}"
        )));
    }

    let bids = data.get("b").or_else(|| data.get("bids"));
    let asks = data.get("a").or_else(|| data.get("asks"));

    let symbol = data["s"]
        .as_str()
        .unwrap_or(fallback_symbol)
        .to_uppercase();

    Ok(DepthSnapshot {
        symbol,
        last_update_id: last_update_id as u64,
        bids: parse_levels(bids, "bids")?,
        asks: parse_levels(asks, "asks")?,
    })
}

fn parse_levels(val: Option<&Value>, name: &str) -> Result<Vec<DepthLevel>, IngestError> {
    let arr = val
        .and_then(Value::as_array)
        .ok_or_else(|| IngestError::MalformedMessage(format!("missing field {name}")))?;

    arr.iter()
        .map(|level| {
            let pair = level
                .as_array()
                .filter(|p| p.len() >= 2)
                .ok_or_else(|| IngestError::MalformedMessage(format!("bad level in {name}")))?;
            Ok(DepthLevel {
                price: parse_decimal(&pair[0], name)?,
                quantity: parse_decimal(&pair[1], name)?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

/// Remembers the last dispatched update id per symbol and rejects snapshots
/// that do not move it forward.
#[derive(Debug, Default)]
pub struct DepthSequencer {
    last_dispatched: HashMap<String, u64>,
}

impl DepthSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records the id when the snapshot is newer than
    /// anything dispatched for its symbol. Ids equal to or below the last
    /// dispatched one are stale.
    pub fn admit(&mut self, snapshot: &DepthSnapshot) -> bool {
        match self.last_dispatched.get(&snapshot.symbol) {
            Some(&last) if snapshot.last_update_id <= last => false,
            _ => {
                self.last_dispatched
                    .insert(snapshot.symbol.clone(), snapshot.last_update_id);
                true
            }
        }
    }
}
