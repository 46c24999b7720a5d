// =============================================================================
// Ingest Configuration - JSON settings with atomic save
// =============================================================================
//
// Every tunable of the host lives here. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
// Persistence uses an atomic tmp + rename pattern.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backfill::DEFAULT_PAGE_SIZE;
use crate::indicators::IndicatorRequest;
use crate::market_data::KlineInterval;
use crate::retry::RetryPolicy;
use crate::scheduler::Schedule;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_intervals() -> Vec<KlineInterval> {
    vec![KlineInterval::Min1, KlineInterval::Hour1]
}

fn default_backfill_lookback_hours() -> u64 {
    24
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_gap_fill_every_secs() -> u64 {
    300
}

fn default_indicators() -> Vec<IndicatorRequest> {
    vec![
        IndicatorRequest::Sma { period: 20 },
        IndicatorRequest::Ema { period: 50 },
        IndicatorRequest::Rsi { period: 14 },
        IndicatorRequest::Macd {
            fast: 12,
            slow: 26,
            signal: 9,
        },
        IndicatorRequest::Bollinger {
            period: 20,
            std_dev: 2.0,
        },
    ]
}

fn default_indicator_window() -> usize {
    500
}

// =============================================================================
// IngestConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    // --- What to ingest ------------------------------------------------------

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Kline intervals ingested for every symbol.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<KlineInterval>,

    /// How far back the start-up backfill reaches.
    #[serde(default = "default_backfill_lookback_hours")]
    pub backfill_lookback_hours: u64,

    /// Subscribe to the depth channel of every symbol.
    #[serde(default = "default_true")]
    pub enable_depth: bool,

    /// Subscribe to the trade channel of every symbol.
    #[serde(default = "default_true")]
    pub enable_trades: bool,

    // --- Exchange endpoints --------------------------------------------------

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    // --- Persistence ---------------------------------------------------------

    /// SQLite file; in-memory storage when unset.
    #[serde(default)]
    pub storage_path: Option<String>,

    /// Cadence of the trailing-window gap fill. Zero disables it.
    #[serde(default = "default_gap_fill_every_secs")]
    pub gap_fill_every_secs: u64,

    /// Cron expression (with seconds) for the gap fill; takes precedence
    /// over `gap_fill_every_secs`.
    #[serde(default)]
    pub gap_fill_cron: Option<String>,

    // --- Indicators ----------------------------------------------------------

    #[serde(default = "default_indicators")]
    pub indicators: Vec<IndicatorRequest>,

    /// Closed candles loaded for each indicator recompute.
    #[serde(default = "default_indicator_window")]
    pub indicator_window: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            intervals: default_intervals(),
            backfill_lookback_hours: default_backfill_lookback_hours(),
            enable_depth: true,
            enable_trades: true,
            page_size: default_page_size(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            retry: RetryPolicy::default(),
            storage_path: None,
            gap_fill_every_secs: default_gap_fill_every_secs(),
            gap_fill_cron: None,
            indicators: default_indicators(),
            indicator_window: default_indicator_window(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ingest config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse ingest config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            intervals = ?config.intervals,
            "ingest config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise ingest config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "ingest config saved (atomic)");
        Ok(())
    }

    /// Apply `INGEST_SYMBOLS` (comma list) and `INGEST_STORAGE_PATH` from the
    /// process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("INGEST_SYMBOLS") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        if let Some(path) = lookup("INGEST_STORAGE_PATH") {
            let path = path.trim().to_string();
            self.storage_path = (!path.is_empty()).then_some(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.symbols.is_empty(), "at least one symbol is required");
        ensure!(!self.intervals.is_empty(), "at least one interval is required");
        ensure!(
            (1..=DEFAULT_PAGE_SIZE).contains(&self.page_size),
            "page_size must be within 1..={DEFAULT_PAGE_SIZE}, got {}",
            self.page_size
        );
        ensure!(self.indicator_window > 0, "indicator_window must be positive");
        self.gap_fill_schedule()?;
        Ok(())
    }

    /// Gap-fill schedule, or `None` when gap filling is disabled.
    pub fn gap_fill_schedule(&self) -> Result<Option<Schedule>> {
        if let Some(expr) = &self.gap_fill_cron {
            let schedule = Schedule::cron(expr)
                .with_context(|| format!("invalid gap_fill_cron expression {expr:?}"))?;
            return Ok(Some(schedule));
        }
        Ok((self.gap_fill_every_secs > 0).then(|| Schedule::every_secs(self.gap_fill_every_secs)))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn backfill_lookback(&self) -> Duration {
        Duration::from_secs(self.backfill_lookback_hours * 3600)
    }
}
