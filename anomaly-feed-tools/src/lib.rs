use anomaly_feed::api::{ApiClient, RequestError};
use anomaly_feed::auth::{EnvToken, FileToken, TokenProvider};
use anomaly_feed::stream::ws::WsConnector;
use anomaly_feed::stream::{Event, LiveStreamClient};
use anomaly_feed::util;
use clap::Parser;
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug, Clone)]
pub struct FeedOpts {
    /// Analysis API base address (e.g., http://localhost:8000)
    #[arg(
        short = 'a',
        long = "api",
        default_value_t = util::default_api_base(),
        help = "Analysis API base address"
    )]
    pub api: String,

    /// Live feed endpoint (e.g., ws://localhost:8000/ws/stream)
    #[arg(
        short = 's',
        long = "stream",
        default_value_t = util::default_stream_url(),
        help = "Live feed endpoint"
    )]
    pub stream: String,

    /// Read the bearer token from this file, re-read on every use
    #[arg(long = "token-file", env = "ANOMALY_FEED_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Environment variable holding the bearer token
    #[arg(long = "token-env", default_value_t = util::TOKEN_ENV_VAR.to_string())]
    pub token_env: String,
}

impl FeedOpts {
    /// Where credentials come from. A token file wins over the environment.
    pub fn provider(&self) -> Box<dyn TokenProvider + Send> {
        match &self.token_file {
            Some(path) => Box::new(FileToken::new(path.clone())),
            None => Box::new(EnvToken::new(&self.token_env)),
        }
    }

    pub fn api_client(&self) -> Result<ApiClient, RequestError> {
        ApiClient::new(&self.api)
    }

    pub fn stream_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.stream)
    }

    /// A live client over WebSocket, not yet started.
    pub fn live_client(&self) -> Result<LiveStreamClient, url::ParseError> {
        Ok(LiveStreamClient::new(
            self.stream_url()?,
            self.provider(),
            Box::new(WsConnector::new()),
        ))
    }
}

/// One line describing a live feed status event.
pub fn describe_event(event: &Event) -> String {
    match event {
        Event::Connecting(attempt) => format!("connecting (attempt {})", attempt),
        Event::Connected => "connected".to_string(),
        Event::Disconnected => "disconnected".to_string(),
        Event::CredentialUnavailable(err) => format!("no credential: {}", err),
        Event::ConnectFailed(err) => format!("connect failed: {}", err),
        Event::ReconnectScheduled(delay) => format!("reconnecting in {}s", delay.as_secs()),
        Event::MessageDropped(err) => format!("dropped malformed message: {}", err),
        Event::TornDown => "stopped".to_string(),
    }
}
