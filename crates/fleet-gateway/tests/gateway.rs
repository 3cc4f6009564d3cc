//! End-to-end tests: a real gateway on an ephemeral port, driven over
//! WebSocket with tokens signed by the test key in `tests/fixtures/`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_adapters::{AdapterRegistry, MockAdapter, RobotAdapter};
use fleet_gateway::codec;
use fleet_gateway::{BridgeEvent, Gateway, GatewayConfig, GatewayServer, PumpSettings, TokenValidator};
use fleet_types::{
    AuthPayload, CmdAckPayload, ConnStatusPayload, EStopPayload, ErrorCode, ErrorPayload,
    LockStatusPayload, Message, MessageType, RobotCommand, RobotState, RobotStatusPayload,
    SafetyAlertKind, SafetyAlertPayload, VelocityCmdPayload,
};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const PRIVATE_PEM: &[u8] = include_bytes!("fixtures/test_ed25519_private.pem");
const PUBLIC_PEM: &[u8] = include_bytes!("fixtures/test_ed25519_public.pem");

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ────────────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────────────

struct TestGateway {
    addr: SocketAddr,
    gateway: Gateway,
    r1: Arc<MockAdapter>,
}

async fn start(mut config: GatewayConfig) -> TestGateway {
    config.server.max_messages_per_second = 0;
    let registry = Arc::new(AdapterRegistry::with_builtin_drivers());
    let r1 = Arc::new(MockAdapter::new("r1"));
    registry.insert(r1.clone()).unwrap();
    registry.insert(Arc::new(MockAdapter::new("r2"))).unwrap();

    let validator = TokenValidator::from_pem(PUBLIC_PEM, Algorithm::EdDSA).unwrap();
    let gateway = Gateway::build(&config, registry, validator).await.unwrap();
    let server = GatewayServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        gateway.handler(),
        PumpSettings::from(&config.server),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    TestGateway { addr, gateway, r1 }
}

fn token(sub: &str, role: Option<&str>) -> String {
    let exp = chrono::Utc::now().timestamp() + 600;
    let mut claims = json!({ "sub": sub, "exp": exp });
    if let Some(role) = role {
        claims["role"] = json!(role);
    }
    let key = EncodingKey::from_ed_pem(PRIVATE_PEM).unwrap();
    encode(&Header::new(Algorithm::EdDSA), &claims, &key).unwrap()
}

async fn connect_as(gw: &TestGateway, sub: &str, role: Option<&str>) -> Ws {
    let url = format!("ws://{}/ws?token={}", gw.addr, token(sub, role));
    connect_async(url).await.expect("handshake").0
}

async fn connect_anonymous(gw: &TestGateway) -> Ws {
    connect_async(format!("ws://{}/ws", gw.addr)).await.expect("handshake").0
}

async fn send(ws: &mut Ws, msg: Message) {
    let text = serde_json::to_string(&msg).unwrap();
    ws.send(WsMessage::Text(text.into())).await.unwrap();
}

/// Next gateway message of `msg_type`, skipping anything else.
async fn recv_type(ws: &mut Ws, msg_type: MessageType) -> Message {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .unwrap_or_else(|_| panic!("no {msg_type} within three seconds"))
            .expect("connection open")
            .expect("read ok");
        let data = match frame {
            WsMessage::Binary(data) => data.to_vec(),
            WsMessage::Text(text) => text.as_str().as_bytes().to_vec(),
            _ => continue,
        };
        let msg = codec::decode(&data, usize::MAX).unwrap();
        if msg.msg_type == msg_type {
            return msg;
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn velocity(robot_id: &str, linear_x: f64) -> Message {
    Message::new(MessageType::VelocityCmd)
        .with_robot(robot_id)
        .with_payload(&VelocityCmdPayload {
            linear_x,
            ..Default::default()
        })
}

fn error_code(msg: &Message) -> ErrorCode {
    msg.payload_as::<ErrorPayload>().unwrap().code
}

// ────────────────────────────────────────────────────────────────────────────
// HTTP surface
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let gw = start(GatewayConfig::default()).await;
    let response = http_get(gw.addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with(r#"{"status":"ok","service":"gateway"}"#), "{response}");
}

#[tokio::test]
async fn unknown_path_is_404_and_plain_ws_is_426() {
    let gw = start(GatewayConfig::default()).await;
    assert!(http_get(gw.addr, "/metrics").await.starts_with("HTTP/1.1 404"));
    assert!(http_get(gw.addr, "/ws").await.starts_with("HTTP/1.1 426"));
}

#[tokio::test]
async fn invalid_token_is_refused_at_handshake() {
    let gw = start(GatewayConfig::default()).await;
    let url = format!("ws://{}/ws?token=not.a.jwt", gw.addr);
    match connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected 401, got {:?}", other.map(|(_, r)| r.status())),
    }
    assert_eq!(gw.gateway.hub().client_count(), 0);
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn anonymous_client_must_authenticate_first() {
    let gw = start(GatewayConfig::default()).await;
    let mut ws = connect_anonymous(&gw).await;

    send(&mut ws, velocity("r1", 0.2)).await;
    let err = recv_type(&mut ws, MessageType::Error).await;
    assert_eq!(error_code(&err), ErrorCode::NotAuthenticated);

    send(&mut ws, Message::new(MessageType::Ping)).await;
    let err = recv_type(&mut ws, MessageType::Error).await;
    assert_eq!(error_code(&err), ErrorCode::NotAuthenticated);

    send(
        &mut ws,
        Message::new(MessageType::Auth).with_payload(&AuthPayload {
            token: token("alice", None),
        }),
    )
    .await;
    let status: ConnStatusPayload = recv_type(&mut ws, MessageType::ConnStatus)
        .await
        .payload_as()
        .unwrap();
    assert!(status.authenticated);

    send(&mut ws, velocity("r1", 0.2)).await;
    let ack: CmdAckPayload = recv_type(&mut ws, MessageType::CmdAck).await.payload_as().unwrap();
    assert!(ack.success);
}

#[tokio::test]
async fn application_ping_is_echoed() {
    let gw = start(GatewayConfig::default()).await;
    let mut ws = connect_as(&gw, "alice", None).await;
    let mut ping = Message::new(MessageType::Ping);
    ping.payload = json!({ "seq": 42 });
    send(&mut ws, ping).await;
    let pong = recv_type(&mut ws, MessageType::Pong).await;
    assert_eq!(pong.payload["seq"], 42);
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let mut config = GatewayConfig::default();
    config.server.max_message_bytes = 1024;
    let gw = start(config).await;
    let mut ws = connect_as(&gw, "alice", None).await;

    let _ = ws.send(WsMessage::Text("x".repeat(4096).into())).await;
    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection should close after an oversized frame");
}

// ────────────────────────────────────────────────────────────────────────────
// Safety scenarios
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn over_limit_velocity_is_clamped_not_rejected() {
    let gw = start(GatewayConfig::default()).await;
    let mut ws = connect_as(&gw, "alice", None).await;

    send(&mut ws, velocity("r1", 2.0)).await;
    let ack: CmdAckPayload = recv_type(&mut ws, MessageType::CmdAck).await.payload_as().unwrap();
    assert!(ack.success);
    assert!(ack.clamped);

    match gw.r1.last_command() {
        Some(RobotCommand::Velocity { linear, .. }) => assert_eq!(linear.x, 1.0),
        other => panic!("unexpected command {other:?}"),
    }
}

#[tokio::test]
async fn second_operator_cannot_take_a_held_lock() {
    let gw = start(GatewayConfig::default()).await;
    let mut alice = connect_as(&gw, "alice", None).await;
    let mut bob = connect_as(&gw, "bob", None).await;

    send(&mut alice, Message::new(MessageType::OpLock).with_robot("r1")).await;
    let status: LockStatusPayload = recv_type(&mut alice, MessageType::LockStatus)
        .await
        .payload_as()
        .unwrap();
    assert!(status.locked);

    send(&mut bob, Message::new(MessageType::OpLock).with_robot("r1")).await;
    let status: LockStatusPayload = recv_type(&mut bob, MessageType::LockStatus)
        .await
        .payload_as()
        .unwrap();
    assert!(!status.locked);
    assert_eq!(status.holder.as_deref(), Some("alice"));
}

#[tokio::test]
async fn watchdog_stops_robot_and_reports_status() {
    let mut config = GatewayConfig::default();
    config.safety.watchdog_timeout_ms = 100;
    let gw = start(config).await;
    let mut ws = connect_as(&gw, "alice", None).await;

    send(&mut ws, Message::new(MessageType::Subscribe).with_robot("r1")).await;
    recv_type(&mut ws, MessageType::RobotStatus).await;

    send(&mut ws, velocity("r1", 0.5)).await;
    recv_type(&mut ws, MessageType::CmdAck).await;

    let status: RobotStatusPayload = recv_type(&mut ws, MessageType::RobotStatus)
        .await
        .payload_as()
        .unwrap();
    assert_eq!(status.state, RobotState::Stopped);
    assert_eq!(status.reason.as_deref(), Some("watchdog_timeout"));
    assert_eq!(gw.r1.last_command(), Some(RobotCommand::Stop));
}

#[tokio::test]
async fn estop_alert_reaches_clients_subscribed_elsewhere() {
    let gw = start(GatewayConfig::default()).await;
    let mut operator = connect_as(&gw, "alice", None).await;
    let mut watcher = connect_as(&gw, "bob", None).await;

    send(&mut watcher, Message::new(MessageType::Subscribe).with_robot("r2")).await;
    recv_type(&mut watcher, MessageType::RobotStatus).await;

    send(
        &mut operator,
        Message::new(MessageType::Estop)
            .with_robot("r1")
            .with_payload(&EStopPayload {
                activate: true,
                all: false,
                reason: Some("person in aisle".into()),
            }),
    )
    .await;

    let alert: SafetyAlertPayload = recv_type(&mut watcher, MessageType::SafetyAlert)
        .await
        .payload_as()
        .unwrap();
    assert_eq!(alert.alert, SafetyAlertKind::EstopActivated);
    assert_eq!(alert.robots, vec!["r1"]);
    assert_eq!(alert.reason.as_deref(), Some("person in aisle"));
    assert_eq!(gw.r1.emergency_stop_count(), 1);

    let ack: CmdAckPayload = recv_type(&mut operator, MessageType::CmdAck).await.payload_as().unwrap();
    assert_eq!(ack.command, MessageType::Estop);
    assert!(ack.success);

    send(&mut operator, velocity("r1", 0.1)).await;
    let ack: CmdAckPayload = recv_type(&mut operator, MessageType::CmdAck).await.payload_as().unwrap();
    assert_eq!(ack.code, Some(ErrorCode::EstopActive));

    // Bob did not activate the stop and has no release role.
    send(
        &mut watcher,
        Message::new(MessageType::Estop)
            .with_robot("r1")
            .with_payload(&EStopPayload {
                activate: false,
                all: false,
                reason: None,
            }),
    )
    .await;
    let ack: CmdAckPayload = recv_type(&mut watcher, MessageType::CmdAck).await.payload_as().unwrap();
    assert_eq!(ack.code, Some(ErrorCode::Forbidden));
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry and recording
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sensor_data_is_relayed_to_subscribers() {
    let gw = start(GatewayConfig::default()).await;
    let mut ws = connect_as(&gw, "alice", None).await;
    send(&mut ws, Message::new(MessageType::Subscribe).with_robot("r1")).await;
    recv_type(&mut ws, MessageType::RobotStatus).await;

    let mut delivered = 0;
    for _ in 0..50 {
        delivered = gw.r1.inject(json!({ "battery": 64.0 }));
        if delivered > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered > 0, "telemetry relay never subscribed");

    let sample = recv_type(&mut ws, MessageType::SensorData).await;
    assert_eq!(sample.robot_id, "r1");
    assert_eq!(sample.payload["battery"], 64.0);
}

#[tokio::test]
async fn recorded_commands_reach_the_bridge() {
    let mut config = GatewayConfig::default();
    config.recording.enabled = true;
    config.recording.record_all = true;
    let gw = start(config).await;
    let mut events = gw.gateway.take_bridge_events().expect("recording enabled");
    let mut ws = connect_as(&gw, "alice", None).await;

    send(&mut ws, velocity("r2", 0.4)).await;
    recv_type(&mut ws, MessageType::CmdAck).await;

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within two seconds")
        .expect("bridge open");
    match event {
        BridgeEvent::CommandData(record) => {
            assert_eq!(record.robot_id, "r2");
            assert_eq!(record.user_id, "alice");
            assert_eq!(record.command, "velocity");
            assert!(record.success);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_stops_robots() {
    let gw = start(GatewayConfig::default()).await;
    let r1 = Arc::clone(&gw.r1);
    gw.gateway.shutdown().await;
    assert_eq!(r1.last_command(), Some(RobotCommand::Stop));
    assert!(!r1.is_connected());
}
