pub mod client;
pub mod rate_limit;
pub mod ws;

pub use client::BinanceRestClient;
pub use rate_limit::RateLimitTracker;
pub use ws::BinanceWsTransport;
