// =============================================================================
// Rate-Limit Tracker - monitors REST request weight to avoid 429s
// =============================================================================
//
// The exchange allows 1200 request weight per minute; we hard-cap ourselves at
// 1000. The tracker reads `X-MBX-USED-WEIGHT-1M` after every response and
// keeps an atomic counter any task may query lock-free.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
pub const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

/// Thread-safe request-weight tracker.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
        }
    }

    /// Update the counter from response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record_weight(w);
    }

    /// Store the used weight reported by the exchange.
    pub fn record_weight(&self, weight: u32) {
        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "rate-limit weight updated");
    }

    /// Whether `weight` more can be spent without crossing the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked - would exceed rate-limit"
            );
        }
        allowed
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }

    /// Reset the 1-minute weight counter (call from a periodic timer).
    pub fn reset_1m_weight(&self) {
        self.used_weight_1m.store(0, Ordering::Relaxed);
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight())
            .finish()
    }
}
