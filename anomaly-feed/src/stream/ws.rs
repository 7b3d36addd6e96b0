//! WebSocket transport
//!
//! Implements a `Connector` over a blocking `tungstenite` socket. Each link
//! gets a dedicated thread which opens the TCP connection, performs the
//! handshake and then reads frames, forwarding them to the link channel in
//! order. Connecting and the handshake are bounded by the handshake timeout;
//! a stall ends the link with `Inbound::Failed`.
//!
//! The link keeps a clone of the TCP stream, so closing the link shuts the
//! socket down immediately, whatever state the reader thread is in.

use super::{Connector, Inbound, Link, TransportError};
use crate::util;

use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{HandshakeError, Message, WebSocket};
use url::Url;

/// How often a reader thread checks whether its link was closed.
const CLOSE_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound on the TCP connect and on the WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Stream clone shared between a link and its reader thread.
type StreamSlot = Arc<Mutex<Option<TcpStream>>>;

pub struct WsConnector {
    channel_size: usize,
    handshake_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        WsConnector::new()
    }
}

impl WsConnector {
    pub fn new() -> WsConnector {
        WsConnector {
            channel_size: util::stream_rx_channel_size(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> WsConnector {
        self.handshake_timeout = timeout;
        self
    }
}

impl Connector for WsConnector {
    fn connect(&mut self, url: &Url) -> Result<Link, TransportError> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::Other(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }
        let (tx, rx) = channel::bounded::<Inbound>(self.channel_size);
        let closing = Arc::new(AtomicBool::new(false));
        let slot: StreamSlot = Arc::new(Mutex::new(None));
        let reader = Reader {
            url: url.clone(),
            tx,
            closing: closing.clone(),
            slot: slot.clone(),
            timeout: self.handshake_timeout,
        };
        thread::Builder::new()
            .name("live-feed".to_string())
            .spawn(move || reader.run())?;
        Ok(Link::new(
            rx,
            Box::new(move || {
                closing.store(true, Ordering::SeqCst);
                if let Ok(slot) = slot.lock() {
                    if let Some(stream) = slot.as_ref() {
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                }
            }),
        ))
    }
}

fn timed_out(what: &str) -> TransportError {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what)).into()
}

fn shut(socket: &mut Socket) {
    let _ = socket.close(None);
    let _ = socket.flush();
}

struct Reader {
    url: Url,
    tx: channel::Sender<Inbound>,
    closing: Arc<AtomicBool>,
    slot: StreamSlot,
    timeout: Duration,
}

impl Reader {
    fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn run(self) {
        let mut socket = match self.open() {
            Ok(socket) => socket,
            Err(err) => {
                if !self.closing() {
                    let _ = self.tx.send(Inbound::Failed(err));
                }
                return;
            }
        };
        if self.closing() || self.tx.send(Inbound::Opened).is_err() {
            shut(&mut socket);
            return;
        }

        loop {
            if self.closing() {
                shut(&mut socket);
                break;
            }
            match socket.read() {
                Ok(Message::Text(text)) => {
                    if self.tx.send(Inbound::Message(text)).is_err() {
                        // Nobody is listening anymore
                        shut(&mut socket);
                        break;
                    }
                }
                // Pings are answered by tungstenite, binary frames are not events.
                Ok(_) => {}
                Err(tungstenite::Error::Io(err))
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(_) if self.closing() => break,
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {
                    let _ = self.tx.send(Inbound::Closed);
                    break;
                }
                Err(err) => {
                    let _ = self.tx.send(Inbound::Failed(err.into()));
                    break;
                }
            }
        }
    }

    /// Connect, publish the stream to the link, then run the handshake.
    fn open(&self) -> Result<Socket, TransportError> {
        let deadline = Instant::now() + self.timeout;
        let stream = self.connect_tcp()?;
        stream.set_read_timeout(Some(CLOSE_CHECK_INTERVAL.min(self.timeout)))?;
        stream.set_write_timeout(Some(self.timeout))?;
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(stream.try_clone()?);
        }
        // The closer may have run before the clone was published.
        if self.closing() {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(TransportError::Other("link closed".to_string()));
        }
        self.handshake(stream, deadline)
    }

    fn connect_tcp(&self) -> Result<TcpStream, TransportError> {
        let mut last_err = None;
        for addr in self.url.socket_addrs(|| None)? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => err.into(),
            None => TransportError::Other(format!("no address for '{}'", self.url)),
        })
    }

    fn handshake(&self, stream: TcpStream, deadline: Instant) -> Result<Socket, TransportError> {
        let mut attempt = tungstenite::client_tls(self.url.as_str(), stream);
        loop {
            match attempt {
                Ok((socket, _response)) => return Ok(socket),
                Err(HandshakeError::Failure(err)) => return Err(err.into()),
                Err(HandshakeError::Interrupted(mid)) => {
                    if self.closing() {
                        return Err(TransportError::Other("link closed".to_string()));
                    }
                    if Instant::now() >= deadline {
                        return Err(timed_out("handshake"));
                    }
                    attempt = mid.handshake();
                }
            }
        }
    }
}
