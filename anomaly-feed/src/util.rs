//! Defaults and environment configuration.

use std::env;

/// Default analysis API base, used unless `ANOMALY_FEED_API` is set.
pub static DEFAULT_API_BASE: &str = "http://localhost:8000";

/// Default live endpoint, used unless `ANOMALY_FEED_STREAM` is set.
pub static DEFAULT_STREAM_URL: &str = "ws://localhost:8000/ws/stream";

/// Environment variable holding the bearer token for the tools.
pub static TOKEN_ENV_VAR: &str = "ANOMALY_FEED_TOKEN";

/// Default size of the channel between a link's reader thread and the loop.
pub static DEFAULT_RX_CHANNEL_SIZE: usize = 256;

pub fn default_api_base() -> String {
    env::var("ANOMALY_FEED_API").unwrap_or_else(|_| DEFAULT_API_BASE.to_string())
}

pub fn default_stream_url() -> String {
    env::var("ANOMALY_FEED_STREAM").unwrap_or_else(|_| DEFAULT_STREAM_URL.to_string())
}

/// Link channel size. Can be raised (never lowered) with
/// `ANOMALY_FEED_RX_BUFSIZE`.
pub fn stream_rx_channel_size() -> usize {
    let min_size = DEFAULT_RX_CHANNEL_SIZE;
    if let Ok(req) = env::var("ANOMALY_FEED_RX_BUFSIZE") {
        std::cmp::max(req.parse().unwrap_or(0), min_size)
    } else {
        min_size
    }
}
