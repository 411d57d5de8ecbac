use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use packets::{CLOSE_SYNC_FAILED, EVENT_SYNCED};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

// =============================================================================
// MOCK SERVER
// =============================================================================

struct MockServer {
    addr: std::net::SocketAddr,
    conns: mpsc::UnboundedReceiver<MockConn>,
}

struct MockConn {
    cookie: Option<String>,
    uri: String,
    ws: WebSocketStream<TcpStream>,
}

async fn mock_server() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, conns) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut cookie = None;
                let mut uri = String::new();
                let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    cookie = req
                        .headers()
                        .get("cookie")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    uri = req.uri().to_string();
                    Ok(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let _ = tx.send(MockConn { cookie, uri, ws });
            });
        }
    });

    MockServer { addr, conns }
}

impl MockServer {
    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn accept(&mut self) -> MockConn {
        timeout(Duration::from_millis(500), self.conns.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("server stopped")
    }

    async fn assert_no_connection(&mut self) {
        let next = timeout(Duration::from_millis(200), self.conns.recv()).await;
        assert!(next.is_err(), "unexpected connection attempt");
    }
}

impl MockConn {
    async fn recv(&mut self) -> Packet {
        loop {
            let msg = timeout(Duration::from_millis(500), self.ws.next())
                .await
                .expect("timed out waiting for packet")
                .expect("connection ended")
                .expect("transport error");
            match msg {
                Message::Text(text) => return packets::decode_text(text.as_str()).expect("decode"),
                Message::Binary(bytes) => return packets::decode_packet(&bytes).expect("decode"),
                _ => {}
            }
        }
    }

    async fn send(&mut self, packet: &Packet) {
        self.ws
            .send(Message::Text(packets::encode_text(packet).into()))
            .await
            .expect("send");
    }

    async fn sync(&mut self, token: &str, serial: u64) {
        self.send(&Packet::event(
            EVENT_SYNCED,
            json!({"actions": [], "serial": serial, "values": {"id": token}}),
        ))
        .await;
        assert_eq!(self.recv().await, Packet::Sync { serial });
    }

    async fn close(mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "bye".to_owned().into(),
        };
        let _ = self.ws.close(Some(frame)).await;
    }

    /// Wait for the peer's close frame.
    async fn closed_code(&mut self) -> Option<u16> {
        loop {
            let msg = timeout(Duration::from_millis(500), self.ws.next())
                .await
                .expect("timed out waiting for close");
            match msg {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => {}
                _ => return None,
            }
        }
    }
}

async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_millis(500), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

/// Connector that always fails, counting attempts.
struct Refusing {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for Refusing {
    async fn connect(&self, url: &str, _token: Option<&str>) -> Result<Transport, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ClientError::InvalidUrl(url.to_owned()))
    }
}

// =============================================================================
// execute
// =============================================================================

#[tokio::test]
async fn execute_resolves_result_and_remote_error() {
    let mut server = mock_server().await;
    let (client, _events) = Client::start(ClientConfig::new(server.url()).token("abc"));
    let mut conn = server.accept().await;
    assert_eq!(conn.cookie.as_deref(), Some("session=abc"));
    assert_eq!(client.wait_for(ConnectionState::Open).await, ConnectionState::Open);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.execute("add", json!([1, 2])).await }
    });
    let Packet::Api { id, name, payload } = conn.recv().await else {
        panic!("expected api packet");
    };
    assert_eq!((id, name.as_str(), payload), (1, "add", json!([1, 2])));
    conn.send(&Packet::api_ok(id, json!(3))).await;
    assert_eq!(call.await.expect("join").expect("add"), json!(3));

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.execute("nope", Value::Null).await }
    });
    let Packet::Api { id, .. } = conn.recv().await else {
        panic!("expected api packet");
    };
    assert_eq!(id, 2);
    conn.send(&Packet::api_err(id, "Unknown api nope")).await;
    let err = call.await.expect("join").expect_err("remote error");
    assert!(matches!(err, ClientError::Remote(ref m) if m == "Unknown api nope"), "{err:?}");
}

#[tokio::test]
async fn no_cookie_without_token() {
    let mut server = mock_server().await;
    let (_client, _events) = Client::start(ClientConfig::new(server.url()));
    let conn = server.accept().await;
    assert_eq!(conn.cookie, None);
}

#[tokio::test]
async fn execute_while_offline_fails_fast() {
    let mut server = mock_server().await;
    let (_online, reachability) = watch::channel(false);
    let (client, _events) = Client::start(ClientConfig::new(server.url()).reachability(reachability));

    let err = client.execute("add", json!([1, 2])).await.expect_err("offline");
    assert!(matches!(err, ClientError::NotConnected));
    assert_eq!(client.state(), ConnectionState::Idle);
    server.assert_no_connection().await;
}

#[tokio::test]
async fn pending_requests_fail_when_connection_drops() {
    let mut server = mock_server().await;
    let (client, _events) = Client::start(ClientConfig::new(server.url()));
    let mut conn = server.accept().await;
    client.wait_for(ConnectionState::Open).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.execute("slow", Value::Null).await }
    });
    conn.recv().await;
    drop(conn);

    let err = call.await.expect("join").expect_err("dropped");
    assert!(matches!(err, ClientError::Disconnected), "{err:?}");
}

// =============================================================================
// events
// =============================================================================

#[tokio::test]
async fn server_event_surfaces() {
    let mut server = mock_server().await;
    let (_client, mut events) = Client::start(ClientConfig::new(server.url()));
    let mut conn = server.accept().await;

    conn.send(&Packet::event("PI", json!(std::f64::consts::PI))).await;

    loop {
        if let ClientEvent::Event { name, data } = next_event(&mut events).await {
            assert_eq!(name, "PI");
            assert_eq!(data, json!(std::f64::consts::PI));
            break;
        }
    }
}

#[tokio::test]
async fn tracker_packets_surface_as_updates() {
    let mut server = mock_server().await;
    let (_client, mut events) = Client::start(ClientConfig::new(server.url()));
    let mut conn = server.accept().await;

    conn.send(&Packet::TrackerOpen { tracker: "t1".into() }).await;

    loop {
        if let ClientEvent::Tracker { tracker, update } = next_event(&mut events).await {
            assert_eq!(tracker, "t1");
            assert_eq!(update, TrackerUpdate::Open);
            break;
        }
    }
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let mut server = mock_server().await;
    let (client, mut events) = Client::start(ClientConfig::new(server.url()));
    let mut conn = server.accept().await;

    conn.ws
        .send(Message::Text("[99]".to_owned().into()))
        .await
        .expect("send");
    conn.send(&Packet::event("after", json!(1))).await;

    loop {
        if let ClientEvent::Event { name, .. } = next_event(&mut events).await {
            assert_eq!(name, "after");
            break;
        }
    }
    assert_eq!(client.state(), ConnectionState::Open);
}

// =============================================================================
// reconnect
// =============================================================================

#[tokio::test]
async fn reachability_drives_reconnect_until_rejected() {
    let mut server = mock_server().await;
    let (online, reachability) = watch::channel(false);
    let (client, mut events) = Client::start(ClientConfig::new(server.url()).reachability(reachability));

    server.assert_no_connection().await;
    assert_eq!(client.state(), ConnectionState::Idle);
    assert!(events.try_recv().is_err());

    online.send_replace(true);
    let mut first = server.accept().await;
    assert_eq!(next_event(&mut events).await, ClientEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut events).await, ClientEvent::Open);

    online.send_replace(false);
    assert_eq!(next_event(&mut events).await, ClientEvent::Close { code: 1005 });
    assert_eq!(first.closed_code().await, Some(CLOSE_NORMAL));
    assert_eq!(client.state(), ConnectionState::Closed);
    server.assert_no_connection().await;

    online.send_replace(true);
    let second = server.accept().await;
    assert_eq!(next_event(&mut events).await, ClientEvent::Connecting { attempt: 0 });
    assert_eq!(next_event(&mut events).await, ClientEvent::Open);

    second.close(CLOSE_SYNC_FAILED).await;
    assert_eq!(next_event(&mut events).await, ClientEvent::Rejected { code: 4001 });
    assert_eq!(client.wait_for(ConnectionState::Rejected).await, ConnectionState::Rejected);
    server.assert_no_connection().await;

    let err = client.execute("add", json!([1, 2])).await.expect_err("rejected");
    assert!(matches!(err, ClientError::Closed));
}

#[tokio::test]
async fn transient_close_reconnects_immediately() {
    let mut server = mock_server().await;
    let (_client, mut events) = Client::start(ClientConfig::new(server.url()));

    let first = server.accept().await;
    first.close(CLOSE_NORMAL).await;

    let _second = server.accept().await;
    let mut seen = Vec::new();
    while seen.len() < 5 {
        seen.push(next_event(&mut events).await);
    }
    assert_eq!(
        seen,
        vec![
            ClientEvent::Connecting { attempt: 0 },
            ClientEvent::Open,
            ClientEvent::Close { code: 1000 },
            ClientEvent::Connecting { attempt: 0 },
            ClientEvent::Open,
        ]
    );
}

#[tokio::test]
async fn reconnect_resumes_session_and_serial() {
    let mut server = mock_server().await;
    let (client, _events) = Client::start(ClientConfig::new(server.url()));

    let mut first = server.accept().await;
    assert_eq!(first.uri, "/ws");
    first.sync("tok-1", 2).await;
    first
        .send(&Packet::event(EVENT_ACTION, json!({"action": {"type": "X"}, "serial": 3})))
        .await;
    timeout(Duration::from_millis(500), async {
        while client.serial() != Some(3) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("serial never advanced");
    assert_eq!(client.token().as_deref(), Some("tok-1"));

    client.acknowledge();
    assert_eq!(first.recv().await, Packet::Sync { serial: 3 });
    drop(first);

    let second = server.accept().await;
    assert_eq!(second.cookie.as_deref(), Some("session=tok-1"));
    assert_eq!(second.uri, "/ws?serial=3");
}

#[tokio::test]
async fn binary_encoding_sends_protobuf_frames() {
    let mut server = mock_server().await;
    let (client, _events) = Client::start(ClientConfig::new(server.url()).encoding(Encoding::Binary));
    let mut conn = server.accept().await;
    assert_eq!(conn.uri, "/ws?encoding=binary");
    client.wait_for(ConnectionState::Open).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.execute("ping", Value::Null).await }
    });
    let msg = timeout(Duration::from_millis(500), conn.ws.next())
        .await
        .expect("timed out")
        .expect("ended")
        .expect("transport error");
    let Message::Binary(bytes) = msg else {
        panic!("expected binary frame, got {msg:?}");
    };
    let Packet::Api { id, .. } = packets::decode_packet(&bytes).expect("decode") else {
        panic!("expected api packet");
    };
    conn.send(&Packet::api_ok(id, json!("pong"))).await;
    assert_eq!(call.await.expect("join").expect("ping"), json!("pong"));
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_exponentially() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = Refusing {
        attempts: Arc::clone(&attempts),
    };
    let config = ClientConfig::new("ws://unused/ws")
        .connector(Arc::new(connector))
        .backoff(Duration::from_secs(1), Duration::from_secs(4));
    let (client, mut events) = Client::start(config);

    let mut stamps = Vec::new();
    for expected in 0..5 {
        let event = events.recv().await.expect("event");
        assert_eq!(event, ClientEvent::Connecting { attempt: expected });
        stamps.push(Instant::now());
    }
    let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(4),
        ]
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    client.close();
}

// =============================================================================
// close
// =============================================================================

#[tokio::test]
async fn close_is_terminal() {
    let mut server = mock_server().await;
    let (client, _events) = Client::start(ClientConfig::new(server.url()));
    let mut conn = server.accept().await;
    client.wait_for(ConnectionState::Open).await;

    client.close();

    assert_eq!(conn.closed_code().await, Some(CLOSE_NORMAL));
    assert_eq!(client.wait_for(ConnectionState::Terminated).await, ConnectionState::Terminated);
    let err = client.execute("add", json!([1, 2])).await.expect_err("closed");
    assert!(matches!(err, ClientError::Closed));
    server.assert_no_connection().await;
}

#[tokio::test]
async fn dropping_every_handle_stops_the_driver() {
    let mut server = mock_server().await;
    let (client, _events) = Client::start(ClientConfig::new(server.url()));
    let mut conn = server.accept().await;
    client.wait_for(ConnectionState::Open).await;

    drop(client);

    assert_eq!(conn.closed_code().await, Some(CLOSE_NORMAL));
}
