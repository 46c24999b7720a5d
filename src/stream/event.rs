// ---------------------------------------------------------------------------
// Typed push events and per-channel decoding
// ---------------------------------------------------------------------------

use serde_json::Value;

use crate::error::IngestError;
use crate::market_data::candle::parse_kline_event;
use crate::market_data::depth::parse_depth_event;
use crate::market_data::trade::parse_trade_event;
use crate::market_data::{Candle, CandleKey, DepthSnapshot, Trade};
use crate::stream::channel::{Channel, StreamId};

/// A decoded push message.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Kline { key: CandleKey, candle: Candle },
    Depth(DepthSnapshot),
    Trade(Trade),
}

/// Decode one text frame received on `stream`.
///
/// A kline frame for a different interval than the subscription's is
/// rejected; every failure is a `MalformedMessage`.
pub fn decode_event(stream: &StreamId, text: &str) -> Result<MarketEvent, IngestError> {
    let root: Value = serde_json::from_str(text)
        .map_err(|e| IngestError::MalformedMessage(format!("invalid JSON: {e}")))?;

    match stream.channel {
        Channel::Kline(interval) => {
            let (key, candle) = parse_kline_event(&root)?;
            if key.interval != interval {
                return Err(IngestError::MalformedMessage(format!(
                    "kline for {} on stream {stream}",
                    key.interval
                )));
            }
            Ok(MarketEvent::Kline { key, candle })
        }
        Channel::Depth => Ok(MarketEvent::Depth(parse_depth_event(&root, &stream.symbol)?)),
        Channel::Trade => Ok(MarketEvent::Trade(parse_trade_event(&root)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::KlineInterval;

    const KLINE: &str = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":60000,"T":119999,"s":"BTCUSDT","i":"1m","o":"1.0","c":"2.0","h":"3.0","l":"0.5","v":"10","n":5,"x":true,"q":"20","V":"4","Q":"8"}}"#;

    #[test]
    fn decodes_kline_frame() {
        let id = StreamId::kline("BTCUSDT", KlineInterval::Min1);
        match decode_event(&id, KLINE).unwrap() {
            MarketEvent::Kline { key, candle } => {
                assert_eq!(key, CandleKey::new("BTCUSDT", KlineInterval::Min1));
                assert_eq!(candle.open_time, 60_000);
                assert!(candle.is_closed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn kline_for_other_interval_is_malformed() {
        let id = StreamId::kline("BTCUSDT", KlineInterval::Min5);
        assert!(matches!(
            decode_event(&id, KLINE),
            Err(IngestError::MalformedMessage(_))
        ));
    }

    #[test]
    fn decodes_depth_and_trade() {
        let depth = decode_event(
            &StreamId::depth("BTCUSDT"),
            r#"{"lastUpdateId":7,"bids":[["100.0","1"]],"asks":[["101.0","2"]]}"#,
        )
        .unwrap();
        assert!(matches!(&depth, MarketEvent::Depth(d) if d.symbol == "BTCUSDT"));

        let trade = decode_event(
            &StreamId::trade("BTCUSDT"),
            r#"{"e":"trade","s":"BTCUSDT","t":9,"p":"100.5","q":"0.1","T":5,"m":false}"#,
        )
        .unwrap();
        assert!(matches!(trade, MarketEvent::Trade(ref t) if t.trade_id == 9));
    }

    #[test]
    fn garbage_is_malformed() {
        let id = StreamId::trade("BTCUSDT");
        assert!(matches!(
            decode_event(&id, "not json"),
            Err(IngestError::MalformedMessage(_))
        ));
        assert!(matches!(
            decode_event(&id, r#"{"e":"trade"}"#),
            Err(IngestError::MalformedMessage(_))
        ));
    }
}
