//! Live stream
//!
//! The `LiveStreamClient` keeps one connection to the live event endpoint
//! open whenever it is allowed to, and pushes every valid event it receives
//! into an `EventWindow`. Transient failures never surface as errors: a
//! closed or failed connection, or a missing credential, schedules a single
//! new attempt `RECONNECT_DELAY` later.
//!
//! The client is a state machine driven by its owner's event loop:
//! - `start()` kicks off the first attempt,
//! - messages from `inbound()` are handed back via `handle()`,
//! - `poll()` is called once `next_deadline()` has passed,
//! - `teardown()` (or drop) stops everything for good.
//!
//! The network side lives behind the `Connector` trait. A `Link` bridges
//! whatever thread does the I/O to the loop with a crossbeam channel; see
//! `ws::WsConnector` for the WebSocket implementation.

pub mod ws;

use crate::auth::{AuthError, Token, TokenProvider};
use crate::event::{DecodeError, LiveEvent};
use crate::window::EventWindow;

use std::time::{Duration, Instant};

use crossbeam::channel;
use url::Url;

/// Delay before any new connection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Query parameter carrying the bearer credential.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Possible errors from the transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("io: {0}")]
    IO(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// What a link delivers to the loop, in order.
#[derive(Debug)]
pub enum Inbound {
    /// Handshake completed.
    Opened,
    /// One text frame.
    Message(String),
    /// Peer closed the connection.
    Closed,
    /// Connection failed or broke.
    Failed(TransportError),
}

/// One connection attempt. Dropping it closes the connection.
pub struct Link {
    rx: channel::Receiver<Inbound>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Link {
    /// `closer` is called exactly once, when the link is closed or dropped.
    pub fn new(rx: channel::Receiver<Inbound>, closer: Box<dyn FnOnce() + Send>) -> Link {
        Link {
            rx,
            closer: Some(closer),
        }
    }

    pub fn receiver(&self) -> &channel::Receiver<Inbound> {
        &self.rx
    }

    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens links to a live endpoint.
pub trait Connector {
    /// Start connecting to `url`. Returning Ok does not mean the connection
    /// is open: that is signalled by `Inbound::Opened` on the link.
    fn connect(&mut self, url: &Url) -> Result<Link, TransportError>;
}

/// Public connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Status event that the client sends to an optional user specified channel
#[derive(Debug)]
pub enum Event {
    Connecting(u64),
    Connected,
    Disconnected,
    CredentialUnavailable(AuthError),
    ConnectFailed(TransportError),
    ReconnectScheduled(Duration),
    MessageDropped(DecodeError),
    TornDown,
}

/// Counters describing the health of the feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Connection attempts, including ones that never got a credential.
    pub attempts: u64,
    /// Attempts that reached the open state.
    pub opened: u64,
    /// Valid events pushed to the window.
    pub received: u64,
    /// Messages dropped because they could not be decoded.
    pub dropped: u64,
}

/// Endpoint URL for one attempt, carrying `token` as a query parameter.
pub fn endpoint_with_token(endpoint: &Url, token: &Token) -> Url {
    let mut url = endpoint.clone();
    let retained: Vec<(String, String)> = endpoint
        .query_pairs()
        .filter(|(k, _)| k != TOKEN_QUERY_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(TOKEN_QUERY_PARAM, token.as_str());
    url
}

pub struct LiveStreamClient {
    endpoint: Url,
    provider: Box<dyn TokenProvider + Send>,
    connector: Box<dyn Connector + Send>,
    status_queue: Option<channel::Sender<Event>>,

    state: ConnectionState,
    link: Option<Link>,
    /// At most one pending attempt.
    retry_at: Option<Instant>,
    torn_down: bool,
    stats: StreamStats,
}

impl LiveStreamClient {
    pub fn new(
        endpoint: Url,
        provider: Box<dyn TokenProvider + Send>,
        connector: Box<dyn Connector + Send>,
    ) -> LiveStreamClient {
        LiveStreamClient {
            endpoint,
            provider,
            connector,
            status_queue: None,
            state: ConnectionState::Disconnected,
            link: None,
            retry_at: None,
            torn_down: false,
            stats: StreamStats::default(),
        }
    }

    /// Send status events to `queue`. Events are dropped if it is full.
    pub fn with_status_queue(mut self, queue: channel::Sender<Event>) -> LiveStreamClient {
        self.status_queue = Some(queue);
        self
    }

    fn report(&self, event: Event) {
        if let Some(queue) = &self.status_queue {
            let _ = queue.try_send(event);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Connect now, unless a connection already exists or the client was
    /// torn down. A pending retry is replaced by this attempt.
    pub fn start(&mut self, now: Instant) {
        if self.torn_down || self.link.is_some() {
            return;
        }
        self.attempt(now);
    }

    fn attempt(&mut self, now: Instant) {
        self.retry_at = None;
        self.stats.attempts += 1;
        self.report(Event::Connecting(self.stats.attempts));

        let token = match self.provider.token() {
            Ok(token) => token,
            Err(err) => {
                log::warn!("live feed: no credential ({}), not connecting", err);
                self.report(Event::CredentialUnavailable(err));
                self.state = ConnectionState::Disconnected;
                self.schedule_retry(now);
                return;
            }
        };

        self.state = ConnectionState::Connecting;
        let url = endpoint_with_token(&self.endpoint, &token);
        match self.connector.connect(&url) {
            Ok(link) => {
                self.link = Some(link);
            }
            Err(err) => {
                log::warn!("live feed: connect to {} failed: {}", self.endpoint, err);
                self.report(Event::ConnectFailed(err));
                self.state = ConnectionState::Disconnected;
                self.schedule_retry(now);
            }
        }
    }

    fn schedule_retry(&mut self, now: Instant) {
        if self.torn_down {
            return;
        }
        self.retry_at = Some(now + RECONNECT_DELAY);
        self.report(Event::ReconnectScheduled(RECONNECT_DELAY));
    }

    /// When `poll()` next needs to run, if ever.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Run the pending attempt if it is due.
    pub fn poll(&mut self, now: Instant) {
        if self.torn_down {
            return;
        }
        if let Some(at) = self.retry_at {
            if now >= at {
                self.attempt(now);
            }
        }
    }

    /// Receiver for the current link. Never ready while there is no link.
    pub fn inbound(&self) -> channel::Receiver<Inbound> {
        match &self.link {
            Some(link) => link.receiver().clone(),
            None => channel::never(),
        }
    }

    /// Process one message from `inbound()`. Valid events go to `window`.
    pub fn handle(&mut self, inbound: Inbound, window: &mut EventWindow, now: Instant) {
        if self.torn_down || self.link.is_none() {
            // Late delivery from a link that is already gone.
            return;
        }
        match inbound {
            Inbound::Opened => {
                self.state = ConnectionState::Open;
                self.stats.opened += 1;
                log::info!("live feed: connected to {}", self.endpoint);
                self.report(Event::Connected);
            }
            Inbound::Message(text) => {
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Open;
                    self.stats.opened += 1;
                    self.report(Event::Connected);
                }
                match LiveEvent::from_json(&text) {
                    Ok(event) => {
                        self.stats.received += 1;
                        window.push(event);
                    }
                    Err(err) => {
                        self.stats.dropped += 1;
                        log::debug!("live feed: dropping malformed message: {}", err);
                        self.report(Event::MessageDropped(err));
                    }
                }
            }
            Inbound::Closed => {
                log::warn!(
                    "live feed: connection closed, retrying in {}s",
                    RECONNECT_DELAY.as_secs()
                );
                self.lost(now);
            }
            Inbound::Failed(err) => {
                log::warn!("live feed: connection error: {}", err);
                if self.state == ConnectionState::Connecting {
                    self.report(Event::ConnectFailed(err));
                }
                self.lost(now);
            }
        }
    }

    /// The link channel disconnected without a close message.
    pub fn link_lost(&mut self, now: Instant) {
        if self.torn_down || self.link.is_none() {
            return;
        }
        self.lost(now);
    }

    fn lost(&mut self, now: Instant) {
        drop(self.link.take());
        self.state = ConnectionState::Disconnected;
        self.report(Event::Disconnected);
        self.schedule_retry(now);
    }

    /// Stop for good: cancel the pending attempt and close the connection.
    /// Nothing the client receives afterwards has any effect.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.retry_at = None;
        if let Some(mut link) = self.link.take() {
            self.state = ConnectionState::Closing;
            link.close();
        }
        self.state = ConnectionState::Disconnected;
        self.report(Event::TornDown);
    }
}

impl Drop for LiveStreamClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Connector handing out in-memory links, remembering the sending side.
    #[derive(Clone, Default)]
    struct MemConnector {
        links: Arc<Mutex<Vec<(Url, channel::Sender<Inbound>)>>>,
        closed: Arc<AtomicUsize>,
        refuse: Arc<Mutex<bool>>,
    }

    impl Connector for MemConnector {
        fn connect(&mut self, url: &Url) -> Result<Link, TransportError> {
            if *self.refuse.lock().unwrap() {
                return Err(TransportError::Other("refused".to_string()));
            }
            let (tx, rx) = channel::unbounded();
            self.links.lock().unwrap().push((url.clone(), tx));
            let closed = self.closed.clone();
            Ok(Link::new(
                rx,
                Box::new(move || {
                    closed.fetch_add(1, Ordering::SeqCst);
                }),
            ))
        }
    }

    impl MemConnector {
        fn count(&self) -> usize {
            self.links.lock().unwrap().len()
        }

        fn last(&self) -> channel::Sender<Inbound> {
            self.links.lock().unwrap().last().unwrap().1.clone()
        }
    }

    fn endpoint() -> Url {
        Url::parse("ws://localhost:8000/ws/stream").unwrap()
    }

    fn client(conn: &MemConnector) -> LiveStreamClient {
        LiveStreamClient::new(
            endpoint(),
            Box::new(StaticToken::new(Token::new("tok").unwrap())),
            Box::new(conn.clone()),
        )
    }

    fn deliver(client: &mut LiveStreamClient, window: &mut EventWindow, now: Instant) {
        let rx = client.inbound();
        while let Ok(msg) = rx.try_recv() {
            client.handle(msg, window, now);
        }
    }

    #[test]
    fn token_goes_in_query() {
        let url = Url::parse("ws://h/ws/stream?a=1&token=old").unwrap();
        let out = endpoint_with_token(&url, &Token::new("new tok").unwrap());
        assert_eq!(out.as_str(), "ws://h/ws/stream?a=1&token=new+tok");
    }

    #[test]
    fn connects_and_fills_window() {
        let conn = MemConnector::default();
        let mut client = client(&conn);
        let mut window = EventWindow::new();
        let t0 = Instant::now();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.start(t0);
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(conn.count(), 1);
        assert_eq!(
            conn.links.lock().unwrap()[0].0.query(),
            Some("token=tok")
        );

        let tx = conn.last();
        tx.send(Inbound::Opened).unwrap();
        tx.send(Inbound::Message(r#"{"n":1}"#.to_string())).unwrap();
        tx.send(Inbound::Message(r#"{"n":2}"#.to_string())).unwrap();
        deliver(&mut client, &mut window, t0);

        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(window.len(), 2);
        assert_eq!(window.newest().unwrap().get("n"), Some(&serde_json::Value::from(2)));
        assert_eq!(client.stats().received, 2);
    }

    #[test]
    fn second_start_does_not_open_parallel_link() {
        let conn = MemConnector::default();
        let mut client = client(&conn);
        let t0 = Instant::now();
        client.start(t0);
        client.start(t0);
        client.start(t0 + Duration::from_secs(1));
        assert_eq!(conn.count(), 1);
    }

    #[test]
    fn malformed_message_is_dropped() {
        let conn = MemConnector::default();
        let mut client = client(&conn);
        let mut window = EventWindow::new();
        let t0 = Instant::now();
        client.start(t0);

        let tx = conn.last();
        tx.send(Inbound::Opened).unwrap();
        tx.send(Inbound::Message(r#"{"n":1}"#.to_string())).unwrap();
        tx.send(Inbound::Message("{oops".to_string())).unwrap();
        tx.send(Inbound::Message("42".to_string())).unwrap();
        tx.send(Inbound::Message(r#"{"n":2}"#.to_string())).unwrap();
        deliver(&mut client, &mut window, t0);

        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(window.len(), 2);
        assert_eq!(client.stats().dropped, 2);
        assert_eq!(client.next_deadline(), None);
    }

    #[test]
    fn close_schedules_exactly_one_retry() {
        let conn = MemConnector::default();
        let mut client = client(&conn);
        let mut window = EventWindow::new();
        let t0 = Instant::now();
        client.start(t0);
        conn.last().send(Inbound::Opened).unwrap();
        deliver(&mut client, &mut window, t0);

        let t1 = t0 + Duration::from_secs(3);
        conn.last().send(Inbound::Closed).unwrap();
        deliver(&mut client, &mut window, t1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.next_deadline(), Some(t1 + RECONNECT_DELAY));
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);

        // Not yet due.
        client.poll(t1 + Duration::from_secs(4));
        assert_eq!(conn.count(), 1);

        client.poll(t1 + RECONNECT_DELAY);
        assert_eq!(conn.count(), 2);
        assert_eq!(client.next_deadline(), None);
        assert_eq!(client.state(), ConnectionState::Connecting);

        // Failure on the second link: again a single pending attempt.
        let t2 = t1 + Duration::from_secs(6);
        conn.last()
            .send(Inbound::Failed(TransportError::Other("reset".to_string())))
            .unwrap();
        deliver(&mut client, &mut window, t2);
        assert_eq!(client.next_deadline(), Some(t2 + RECONNECT_DELAY));
        client.link_lost(t2 + Duration::from_secs(1));
        assert_eq!(client.next_deadline(), Some(t2 + RECONNECT_DELAY));
    }

    #[test]
    fn missing_credential_never_touches_network() {
        let conn = MemConnector::default();
        let mut client = LiveStreamClient::new(
            endpoint(),
            Box::new(StaticToken::anonymous()),
            Box::new(conn.clone()),
        );
        let t0 = Instant::now();
        client.start(t0);
        assert_eq!(conn.count(), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.next_deadline(), Some(t0 + RECONNECT_DELAY));

        client.poll(t0 + RECONNECT_DELAY);
        assert_eq!(conn.count(), 0);
        assert_eq!(client.stats().attempts, 2);
        assert_eq!(
            client.next_deadline(),
            Some(t0 + RECONNECT_DELAY + RECONNECT_DELAY)
        );
    }

    #[test]
    fn credential_is_fetched_per_attempt() {
        let conn = MemConnector::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Token::new(format!("tok{}", n))
        };
        let mut client =
            LiveStreamClient::new(endpoint(), Box::new(provider), Box::new(conn.clone()));
        let mut window = EventWindow::new();
        let t0 = Instant::now();
        client.start(t0);
        conn.last().send(Inbound::Closed).unwrap();
        deliver(&mut client, &mut window, t0);
        client.poll(t0 + RECONNECT_DELAY);

        let links = conn.links.lock().unwrap();
        assert_eq!(links[0].0.query(), Some("token=tok0"));
        assert_eq!(links[1].0.query(), Some("token=tok1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn connect_error_schedules_retry() {
        let conn = MemConnector::default();
        *conn.refuse.lock().unwrap() = true;
        let mut client = client(&conn);
        let t0 = Instant::now();
        client.start(t0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.next_deadline(), Some(t0 + RECONNECT_DELAY));

        *conn.refuse.lock().unwrap() = false;
        client.poll(t0 + RECONNECT_DELAY);
        assert_eq!(conn.count(), 1);
    }

    #[test]
    fn teardown_stops_everything() {
        let conn = MemConnector::default();
        let (status_tx, status_rx) = channel::bounded(32);
        let mut client = client(&conn).with_status_queue(status_tx);
        let mut window = EventWindow::new();
        let t0 = Instant::now();
        client.start(t0);
        let tx = conn.last();
        tx.send(Inbound::Opened).unwrap();
        tx.send(Inbound::Message(r#"{"n":1}"#.to_string())).unwrap();
        deliver(&mut client, &mut window, t0);
        let rx = client.inbound();

        client.teardown();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
        assert_eq!(client.next_deadline(), None);

        // Late traffic from the old link is ignored.
        tx.send(Inbound::Message(r#"{"n":2}"#.to_string())).unwrap();
        tx.send(Inbound::Closed).unwrap();
        while let Ok(msg) = rx.try_recv() {
            client.handle(msg, &mut window, t0);
        }
        assert_eq!(window.len(), 1);
        assert_eq!(client.next_deadline(), None);

        client.start(t0 + Duration::from_secs(30));
        client.poll(t0 + Duration::from_secs(60));
        assert_eq!(conn.count(), 1);

        let events: Vec<Event> = status_rx.try_iter().collect();
        assert!(matches!(events.last(), Some(Event::TornDown)));
    }

    #[test]
    fn teardown_while_waiting_cancels_retry() {
        let conn = MemConnector::default();
        let mut client = client(&conn);
        let mut window = EventWindow::new();
        let t0 = Instant::now();
        client.start(t0);
        conn.last().send(Inbound::Closed).unwrap();
        deliver(&mut client, &mut window, t0);
        assert!(client.next_deadline().is_some());

        client.teardown();
        assert_eq!(client.next_deadline(), None);
        client.poll(t0 + RECONNECT_DELAY * 3);
        assert_eq!(conn.count(), 1);
    }

    #[test]
    fn drop_closes_link() {
        let conn = MemConnector::default();
        {
            let mut client = client(&conn);
            client.start(Instant::now());
        }
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
    }
}
