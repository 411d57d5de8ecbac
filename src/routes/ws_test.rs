use super::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_extra::extract::cookie::Cookie;
use client::{Client, ClientConfig, ClientEvent, ConnectionState, TrackerUpdate};
use futures::{SinkExt, StreamExt};
use packets::{CLOSE_REPLACED, EVENT_ACTION, EVENT_SYNCED};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};

use crate::config::ServerConfig;
use crate::demo;
use crate::routes;
use crate::services::channel::ChannelHub;

// =============================================================================
// Connect
// =============================================================================

fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[test]
fn connect_defaults() {
    let connect = Connect::from_request(&CookieJar::new(), HashMap::new());
    assert_eq!(
        connect,
        Connect {
            token: None,
            serial: None,
            encoding: Encoding::Json,
            context: Value::Null,
        }
    );
}

#[test]
fn connect_reads_cookie_serial_and_encoding() {
    let jar = CookieJar::new().add(Cookie::new(SESSION_COOKIE, "tok"));
    let connect = Connect::from_request(&jar, params(&[("serial", "12"), ("encoding", "binary")]));

    assert_eq!(connect.token.as_deref(), Some("tok"));
    assert_eq!(connect.serial, Some(12));
    assert_eq!(connect.encoding, Encoding::Binary);
    assert_eq!(connect.context, Value::Null);
}

#[test]
fn connect_collects_remaining_params_as_context() {
    let connect = Connect::from_request(&CookieJar::new(), params(&[("room", "a"), ("serial", "x")]));

    assert_eq!(connect.serial, None);
    assert_eq!(connect.context, json!({"room": "a"}));
}

#[test]
fn connect_unknown_encoding_falls_back_to_json() {
    let connect = Connect::from_request(&CookieJar::new(), params(&[("encoding", "xml")]));
    assert_eq!(connect.encoding, Encoding::Json);
}

#[test]
fn attach_close_code_names_the_refusal() {
    assert_eq!(attach_close_code(&SessionError::Replaced), CLOSE_REPLACED);
    assert_eq!(attach_close_code(&SessionError::Closed("s".into())), CLOSE_SESSION_CLOSED);
    assert_eq!(attach_close_code(&SessionError::Populate("down".into())), CLOSE_SYNC_FAILED);
    assert_eq!(attach_close_code(&SessionError::Init("bad".into())), CLOSE_SYNC_FAILED);
}

// =============================================================================
// SERVER FIXTURE
// =============================================================================

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> SocketAddr {
    let hub = ChannelHub::local(16);
    let state = AppState::new(
        ServerConfig::default(),
        hub.clone(),
        demo::apis(hub),
        Arc::new(demo::DemoInit),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, routes::app(state)).await;
    });
    addr
}

async fn connect(addr: SocketAddr, query: &str, token: Option<&str>) -> Socket {
    let mut request = format!("ws://{addr}/ws{query}")
        .into_client_request()
        .expect("request");
    if let Some(token) = token {
        let cookie = HeaderValue::from_str(&format!("{SESSION_COOKIE}={token}")).expect("cookie");
        request.headers_mut().insert("cookie", cookie);
    }
    let (socket, _) = tokio_tungstenite::connect_async(request).await.expect("connect");
    socket
}

async fn recv(socket: &mut Socket) -> Packet {
    loop {
        let msg = timeout(Duration::from_millis(500), socket.next())
            .await
            .expect("timed out waiting for packet")
            .expect("socket ended")
            .expect("transport error");
        match msg {
            tungstenite::Message::Text(text) => return packets::decode_text(text.as_str()).expect("decode"),
            tungstenite::Message::Binary(bytes) => return packets::decode_packet(&bytes).expect("decode"),
            tungstenite::Message::Close(frame) => panic!("socket closed: {frame:?}"),
            _ => {}
        }
    }
}

async fn recv_event(socket: &mut Socket) -> (String, Value) {
    match recv(socket).await {
        Packet::Event { name, data } => (name, data),
        other => panic!("expected event, got {other:?}"),
    }
}

async fn send(socket: &mut Socket, packet: &Packet) {
    socket
        .send(tungstenite::Message::Text(packets::encode_text(packet).into()))
        .await
        .expect("send");
}

async fn close_code(socket: &mut Socket) -> u16 {
    loop {
        let msg = timeout(Duration::from_millis(500), socket.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(_)) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

fn api(id: u64, name: &str, payload: Value) -> Packet {
    Packet::Api {
        id,
        name: name.into(),
        payload,
    }
}

// =============================================================================
// SOCKET
// =============================================================================

#[tokio::test]
async fn new_connection_is_synced_with_context() {
    let addr = serve().await;
    let mut socket = connect(addr, "?room=a", None).await;

    let (name, data) = recv_event(&mut socket).await;
    assert_eq!(name, EVENT_SYNCED);
    assert_eq!(data["serial"], json!(0));
    assert_eq!(data["actions"], json!([{"type": "WELCOME", "payload": {"room": "a"}}]));
    assert_eq!(data["values"]["context"], json!({"room": "a"}));
    assert_eq!(data["values"]["id"].as_str().map(str::len), Some(64));
}

#[tokio::test]
async fn api_call_round_trips() {
    let addr = serve().await;
    let mut socket = connect(addr, "", Some("t-api")).await;
    recv_event(&mut socket).await;

    send(&mut socket, &api(1, "add", json!([1, 2]))).await;
    assert_eq!(recv(&mut socket).await, Packet::api_ok(1, json!(3)));

    send(&mut socket, &api(2, "missing", Value::Null)).await;
    assert_eq!(recv(&mut socket).await, Packet::api_err(2, "Unknown api missing"));
}

#[tokio::test]
async fn malformed_token_is_rejected() {
    let addr = serve().await;
    let mut socket = connect(addr, "", Some("bad.token")).await;
    assert_eq!(close_code(&mut socket).await, CLOSE_INVALID_SESSION);
}

#[tokio::test]
async fn malformed_frame_is_ignored() {
    let addr = serve().await;
    let mut socket = connect(addr, "", Some("t-junk")).await;
    recv_event(&mut socket).await;

    socket
        .send(tungstenite::Message::Text("not json".to_owned().into()))
        .await
        .expect("send");
    send(&mut socket, &api(1, "add", json!([2, 2]))).await;
    assert_eq!(recv(&mut socket).await, Packet::api_ok(1, json!(4)));
}

#[tokio::test]
async fn second_socket_replaces_first() {
    let addr = serve().await;
    let mut first = connect(addr, "", Some("t-dup")).await;
    recv_event(&mut first).await;

    let mut second = connect(addr, "?serial=0", Some("t-dup")).await;
    assert_eq!(close_code(&mut first).await, CLOSE_REPLACED);
    let (name, data) = recv_event(&mut second).await;
    assert_eq!(name, EVENT_SYNCED);
    assert_eq!(data["actions"], json!([]));
}

#[tokio::test]
async fn reconnect_replays_only_missed_actions() {
    let addr = serve().await;
    let mut socket = connect(addr, "", Some("t-resume")).await;
    recv_event(&mut socket).await;

    send(&mut socket, &api(1, "increment", Value::Null)).await;
    let mut acked = false;
    let mut seen = false;
    while !(acked && seen) {
        match recv(&mut socket).await {
            Packet::Event { name, data } if name == EVENT_ACTION => {
                assert_eq!(data["serial"], json!(1));
                seen = true;
            }
            Packet::ApiResponse { id: 1, .. } => acked = true,
            other => panic!("unexpected packet {other:?}"),
        }
    }
    drop(socket);

    // Two more actions on a socket the final connection never saw.
    let mut other = connect(addr, "?serial=1", Some("t-resume")).await;
    recv_event(&mut other).await;
    send(&mut other, &api(1, "increment", Value::Null)).await;
    send(&mut other, &api(2, "increment", Value::Null)).await;
    let mut replies = 0;
    while replies < 2 {
        if let Packet::ApiResponse { .. } = recv(&mut other).await {
            replies += 1;
        }
    }
    drop(other);

    let mut socket = connect(addr, "?serial=1", Some("t-resume")).await;
    let (name, data) = recv_event(&mut socket).await;
    assert_eq!(name, EVENT_SYNCED);
    assert_eq!(data["serial"], json!(3));
    assert_eq!(data["actions"], json!([{"type": "INCREMENT"}, {"type": "INCREMENT"}]));
}

#[tokio::test]
async fn binary_encoding_round_trips() {
    let addr = serve().await;
    let mut socket = connect(addr, "?encoding=binary", Some("t-bin")).await;

    let msg = timeout(Duration::from_millis(500), socket.next())
        .await
        .expect("timed out")
        .expect("ended")
        .expect("transport error");
    assert!(matches!(msg, tungstenite::Message::Binary(_)), "{msg:?}");

    socket
        .send(tungstenite::Message::Binary(
            packets::encode_packet(&api(5, "add", json!([40, 2]))).into(),
        ))
        .await
        .expect("send");
    assert_eq!(recv(&mut socket).await, Packet::api_ok(5, json!(42)));
}

#[tokio::test]
async fn healthz_responds() {
    let addr = serve().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await
    .expect("write");
    let mut body = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut body)
        .await
        .expect("read");
    assert!(body.starts_with("HTTP/1.1 200"), "{body}");
}

// =============================================================================
// END TO END
// =============================================================================

#[tokio::test]
async fn client_executes_against_server() {
    let addr = serve().await;
    let (client, _events) = Client::start(ClientConfig::new(format!("ws://{addr}/ws")));
    assert_eq!(client.wait_for(ConnectionState::Open).await, ConnectionState::Open);

    assert_eq!(client.execute("add", json!([1, 2])).await.expect("add"), json!(3));
    let err = client.execute("nope", Value::Null).await.expect_err("unknown api");
    assert_eq!(err.to_string(), "Unknown api nope");
    client.close();
}

#[tokio::test]
async fn client_adopts_session_token_from_server() {
    let addr = serve().await;
    let (client, _events) = Client::start(ClientConfig::new(format!("ws://{addr}/ws")));
    client.wait_for(ConnectionState::Open).await;

    timeout(Duration::from_millis(500), async {
        while client.token().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("token never adopted");
    assert_eq!(client.token().map(|t| t.len()), Some(64));
    client.close();
}

#[tokio::test]
async fn client_receives_tracker_stream() {
    let hub = ChannelHub::local(16);
    let state = AppState::new(
        ServerConfig::default(),
        hub.clone(),
        demo::apis(hub.clone()),
        Arc::new(demo::DemoInit),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, routes::app(state)).await;
    });

    let (client, mut events) = Client::start(ClientConfig::new(format!("ws://{addr}/ws")));
    client.wait_for(ConnectionState::Open).await;
    client
        .execute("track_clock", json!({"id": "clock"}))
        .await
        .expect("track");

    let mut opened = false;
    loop {
        let event = timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("timed out waiting for tracker")
            .expect("events closed");
        let ClientEvent::Tracker { tracker, update } = event else {
            continue;
        };
        assert_eq!(tracker, "clock");
        match update {
            TrackerUpdate::Action { action, .. } if action["type"] == "INIT" => {}
            TrackerUpdate::Open => {
                opened = true;
                hub.channel(demo::CLOCK_CHANNEL)
                    .publish(json!({"type": "TICK"}))
                    .await
                    .expect("publish");
            }
            TrackerUpdate::Action { action, serial } => {
                assert!(opened);
                assert_eq!(action, json!({"type": "TICK"}));
                assert_eq!(serial, 1);
                break;
            }
            other => panic!("unexpected tracker update {other:?}"),
        }
    }
    client.close();
}
