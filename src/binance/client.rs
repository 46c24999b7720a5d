// =============================================================================
// Binance REST API Client - public market-data endpoints
// =============================================================================
//
// Only unsigned endpoints are used: historical klines for backfill. Every
// response feeds the shared rate-limit tracker so concurrent backfills back
// off together before the exchange starts answering 429.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::backfill::{KlineSource, PageRequest};
use crate::binance::rate_limit::{RateLimitTracker, WEIGHT_HARD_LIMIT};
use crate::error::IngestError;

/// Request weight of GET /api/v3/klines for limits up to 1000.
const KLINES_WEIGHT: u32 = 2;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Binance REST client for public market data.
#[derive(Clone)]
pub struct BinanceRestClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceRestClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client against `base_url` (no trailing slash needed).
    pub fn new(base_url: impl Into<String>) -> Result<Self, IngestError> {
        Self::with_tracker(base_url, Arc::new(RateLimitTracker::new()))
    }

    /// Create a client that shares `rate_limit` with other clients.
    pub fn with_tracker(
        base_url: impl Into<String>,
        rate_limit: Arc<RateLimitTracker>,
    ) -> Result<Self, IngestError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        debug!(base_url = %base_url, "BinanceRestClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit,
        })
    }

    /// Client against the production endpoint.
    pub fn production() -> Result<Self, IngestError> {
        Self::new(DEFAULT_BASE_URL)
    }

    pub fn rate_limit(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limit
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public - no signature required).
    ///
    /// Returns the raw array-of-arrays body; decoding and validation belong
    /// to the backfiller.
    #[instrument(
        skip(self, request),
        fields(symbol = %request.symbol, interval = %request.interval, start = request.start_time),
        name = "binance::get_klines"
    )]
    pub async fn get_klines(&self, request: &PageRequest) -> Result<Vec<Value>, IngestError> {
        if !self.rate_limit.can_send_request(KLINES_WEIGHT) {
            return Err(IngestError::RateLimited {
                used: self.rate_limit.used_weight(),
                limit: WEIGHT_HARD_LIMIT,
            });
        }

        let url = format!("{}/api/v3/klines", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", request.symbol.clone()),
                ("interval", request.interval.as_str().to_string()),
                ("startTime", request.start_time.to_string()),
                ("endTime", request.end_time.to_string()),
                ("limit", request.limit.to_string()),
            ])
            .send()
            .await?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            warn!(status = status.as_u16(), body = %text, "klines request rejected");
            return Err(IngestError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let body: Value = serde_json::from_str(&text)?;
        let Value::Array(rows) = body else {
            return Err(IngestError::MalformedPage(
                "klines response is not an array".into(),
            ));
        };

        debug!(count = rows.len(), "klines fetched");
        Ok(rows)
    }
}

#[async_trait]
impl KlineSource for BinanceRestClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Value>, IngestError> {
        self.get_klines(request).await
    }
}

impl std::fmt::Debug for BinanceRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceRestClient")
            .field("base_url", &self.base_url)
            .field("used_weight_1m", &self.rate_limit.used_weight())
            .finish()
    }
}
