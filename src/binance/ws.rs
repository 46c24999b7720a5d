// =============================================================================
// Binance WebSocket transport - raw single-stream connections
// =============================================================================

use async_trait::async_trait;
use futures_util::{future, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

use crate::error::IngestError;
use crate::stream::{FrameStream, StreamId, StreamTransport};

const DEFAULT_WS_BASE_URL: &str = "wss://stream.binance.com:9443";

/// Opens `<ws_base_url>/ws/<stream>` for each logical stream.
#[derive(Debug, Clone)]
pub struct BinanceWsTransport {
    ws_base_url: String,
}

impl BinanceWsTransport {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn production() -> Self {
        Self::new(DEFAULT_WS_BASE_URL)
    }

    pub fn url_for(&self, stream: &StreamId) -> String {
        format!("{}/ws/{}", self.ws_base_url, stream.stream_name())
    }
}

#[async_trait]
impl StreamTransport for BinanceWsTransport {
    async fn connect(&self, stream: &StreamId) -> Result<FrameStream, IngestError> {
        let url = self.url_for(stream);
        info!(url = %url, stream = %stream, "connecting to WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .map_err(|e| IngestError::Transport(format!("{url}: {e}")))?;

        info!(stream = %stream, "WebSocket connected");

        // Ping/Pong replies are handled by tungstenite; Close ends the stream.
        let frames = ws_stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(IngestError::from(e))),
                })
            });

        Ok(Box::pin(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::KlineInterval;

    #[test]
    fn builds_single_stream_urls() {
        let transport = BinanceWsTransport::new("wss://example.test:9443/");
        assert_eq!(
            transport.url_for(&StreamId::kline("BTCUSDT", KlineInterval::Hour4)),
            "wss://example.test:9443/ws/btcusdt@kline_4h"
        );
        assert_eq!(
            BinanceWsTransport::production().url_for(&StreamId::depth("ETHUSDT")),
            "wss://stream.binance.com:9443/ws/ethusdt@depth"
        );
    }
}
