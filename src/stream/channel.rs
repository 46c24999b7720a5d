use std::fmt;

use serde::{Deserialize, Serialize};

use crate::market_data::KlineInterval;

/// Push channel of a subscription.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "interval", rename_all = "snake_case")]
pub enum Channel {
    Kline(KlineInterval),
    Depth,
    Trade,
}

/// Logical identity of a subscription: one symbol on one channel.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamId {
    /// Upper-case exchange symbol.
    pub symbol: String,
    pub channel: Channel,
}

impl StreamId {
    pub fn new(symbol: impl Into<String>, channel: Channel) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            channel,
        }
    }

    pub fn kline(symbol: impl Into<String>, interval: KlineInterval) -> Self {
        Self::new(symbol, Channel::Kline(interval))
    }

    pub fn depth(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Channel::Depth)
    }

    pub fn trade(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Channel::Trade)
    }

    /// Exchange stream name, e.g. `btcusdt@kline_1m`.
    pub fn stream_name(&self) -> String {
        let lower = self.symbol.to_lowercase();
        match self.channel {
            Channel::Kline(interval) => format!("{lower}@kline_{interval}"),
            Channel::Depth => format!("{lower}@depth"),
            Channel::Trade => format!("{lower}@trade"),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stream_name())
    }
}
