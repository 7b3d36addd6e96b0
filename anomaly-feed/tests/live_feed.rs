//! End-to-end tests of the live feed against a local WebSocket server.

use anomaly_feed::auth::{StaticToken, Token};
use anomaly_feed::stream::ws::WsConnector;
use anomaly_feed::stream::{ConnectionState, Event, LiveStreamClient, RECONNECT_DELAY};
use anomaly_feed::Dashboard;

use std::io::Read;
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use tungstenite::handshake::server::{Request, Response};
use tungstenite::Message;
use url::Url;

/// Accept one client, send `frames`, then close from the server side.
/// Returns the address and a receiver for the request URI the client used.
fn serve_once(frames: Vec<&'static str>) -> (String, channel::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (uri_tx, uri_rx) = channel::bounded(1);
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut ws = tungstenite::accept_hdr(stream, |req: &Request, resp: Response| {
            let _ = uri_tx.send(req.uri().to_string());
            Ok(resp)
        })
        .unwrap();
        for frame in frames {
            ws.send(Message::Text(frame.to_string())).unwrap();
        }
        let _ = ws.close(None);
        // Complete the closing handshake.
        while ws.read().is_ok() {}
    });
    (addr, uri_rx)
}

/// Accept one client and read its upgrade request without ever answering.
/// The first receiver fires once the full request arrived, the second once
/// the client went away.
fn silent_server() -> (String, channel::Receiver<()>, channel::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (request_tx, request_rx) = channel::bounded(1);
    let (gone_tx, gone_rx) = channel::bounded(1);
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        let _ = request_tx.try_send(());
                    }
                }
            }
        }
        let _ = gone_tx.send(());
    });
    (addr, request_rx, gone_rx)
}

fn pump_until<F: Fn(&Dashboard) -> bool>(dash: &mut Dashboard, done: F) {
    let give_up = Instant::now() + Duration::from_secs(10);
    while !done(dash) {
        assert!(Instant::now() < give_up, "timed out");
        let live = dash.live_inbound();
        crossbeam::select! {
            recv(live) -> msg => dash.handle_inbound(msg, Instant::now()),
            default(Duration::from_millis(20)) => {}
        }
        dash.poll(Instant::now());
    }
}

#[test]
fn receives_events_and_schedules_reconnect_on_close() {
    let (addr, uri_rx) = serve_once(vec![
        r#"{"timestamp":"2024-05-01T10:00:00","Port":443,"anomaly":0}"#,
        "this is not json",
        r#"{"timestamp":"2024-05-01T10:00:01","Port":22,"anomaly":1,"anomaly_reason":"Simulated high traffic"}"#,
    ]);
    let endpoint = Url::parse(&format!("ws://{}/ws/stream", addr)).unwrap();
    let (status_tx, status_rx) = channel::bounded(64);
    let client = LiveStreamClient::new(
        endpoint,
        Box::new(StaticToken::new(Token::new("abc123").unwrap())),
        Box::new(WsConnector::new()),
    )
    .with_status_queue(status_tx);

    let mut dash = Dashboard::new();
    dash.attach_live(client, Instant::now());

    pump_until(&mut dash, |d| {
        d.view().connection == ConnectionState::Disconnected && d.next_deadline().is_some()
    });

    assert_eq!(
        uri_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        "/ws/stream?token=abc123"
    );

    let view = dash.view();
    assert_eq!(view.live_rows.len(), 2);
    assert_eq!(view.live_rows[0].cell("Port"), "22");
    assert_eq!(
        view.live_rows[0].anomaly_reason(),
        Some("Simulated high traffic")
    );
    assert_eq!(view.live_rows[1].cell("Port"), "443");
    assert_eq!(view.live_anomalies, 1);
    assert_eq!(view.stream_stats.opened, 1);
    assert_eq!(view.stream_stats.dropped, 1);

    // Exactly one retry, RECONNECT_DELAY out.
    let retry = dash.next_deadline().unwrap();
    assert!(retry > Instant::now() + RECONNECT_DELAY - Duration::from_secs(2));

    dash.teardown();
    assert_eq!(dash.next_deadline(), None);

    let events: Vec<Event> = status_rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, Event::Connected)));
    assert!(events.iter().any(|e| matches!(e, Event::MessageDropped(_))));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::ReconnectScheduled(_)))
            .count(),
        1
    );
}

#[test]
fn teardown_while_open_closes_the_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (closed_tx, closed_rx) = channel::bounded(1);
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut ws = tungstenite::accept(stream).unwrap();
        ws.send(Message::Text(r#"{"n":1}"#.to_string())).unwrap();
        // Wait for the client to go away.
        loop {
            match ws.read() {
                Ok(Message::Close(_)) => {}
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = closed_tx.send(());
    });

    let endpoint = Url::parse(&format!("ws://{}/ws/stream", addr)).unwrap();
    let client = LiveStreamClient::new(
        endpoint,
        Box::new(StaticToken::new(Token::new("t").unwrap())),
        Box::new(WsConnector::new()),
    );
    let mut dash = Dashboard::new();
    dash.attach_live(client, Instant::now());
    pump_until(&mut dash, |d| d.view().live_rows.len() == 1);
    assert_eq!(dash.view().connection, ConnectionState::Open);

    drop(dash);
    closed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server did not see the client close");
}

#[test]
fn stalled_handshake_fails_and_schedules_retry() {
    let (addr, request_rx, _gone_rx) = silent_server();
    let endpoint = Url::parse(&format!("ws://{}/ws/stream", addr)).unwrap();
    let (status_tx, status_rx) = channel::bounded(64);
    let client = LiveStreamClient::new(
        endpoint,
        Box::new(StaticToken::new(Token::new("t").unwrap())),
        Box::new(WsConnector::new().with_handshake_timeout(Duration::from_millis(500))),
    )
    .with_status_queue(status_tx);

    let mut dash = Dashboard::new();
    dash.attach_live(client, Instant::now());
    assert_eq!(dash.view().connection, ConnectionState::Connecting);

    pump_until(&mut dash, |d| {
        d.view().connection == ConnectionState::Disconnected && d.next_deadline().is_some()
    });
    request_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("server never saw the upgrade request");

    let view = dash.view();
    assert_eq!(view.stream_stats.attempts, 1);
    assert_eq!(view.stream_stats.opened, 0);
    let retry = dash.next_deadline().unwrap();
    assert!(retry > Instant::now() + RECONNECT_DELAY - Duration::from_secs(2));

    let events: Vec<Event> = status_rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, Event::ConnectFailed(_))));
    assert!(!events.iter().any(|e| matches!(e, Event::Connected)));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::ReconnectScheduled(_)))
            .count(),
        1
    );
}

#[test]
fn teardown_while_connecting_closes_the_socket() {
    let (addr, request_rx, gone_rx) = silent_server();
    let endpoint = Url::parse(&format!("ws://{}/ws/stream", addr)).unwrap();
    let client = LiveStreamClient::new(
        endpoint,
        Box::new(StaticToken::new(Token::new("t").unwrap())),
        Box::new(WsConnector::new()),
    );
    let mut dash = Dashboard::new();
    dash.attach_live(client, Instant::now());
    request_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server never saw the upgrade request");
    assert_eq!(dash.view().connection, ConnectionState::Connecting);

    dash.teardown();
    gone_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("server did not see the client close");
}
