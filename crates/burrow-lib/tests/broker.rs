//! End-to-end broker scenarios with real sockets
//!
//! Each test runs a full broker against a file-backed SQLite store on
//! ephemeral ports, drives it with hand-rolled agent and external client
//! sockets, and asserts on both the wire behavior and the persisted rows.

use burrow_broker_db::entities::{
    connection_record::{self, RecordStatus},
    connection_session::{self, SessionStatus},
    port_assignment, team, team_token,
};
use burrow_broker_db::Store;
use burrow_control::{TunnelConfig, TunnelState};
use burrow_lib::{Broker, BrokerConfig};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use uuid::Uuid;

fn temp_db_url(tag: &str) -> String {
    let path = std::env::temp_dir().join(format!("burrow-e2e-{tag}-{}.db", Uuid::new_v4()));
    format!("sqlite://{}?mode=rwc", path.display())
}

/// Grab a port the kernel considers free right now
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn start_broker(database_url: &str, pairing_timeout: Duration) -> Broker {
    let config = BrokerConfig {
        bind_addr: "127.0.0.1".parse().unwrap(),
        control_port: 0,
        database_url: database_url.to_string(),
        drain_timeout: Duration::from_secs(5),
        tunnel: TunnelConfig {
            pairing_timeout,
            bytes_flush_interval: Duration::from_millis(500),
        },
    };
    Broker::start(config).await.expect("broker failed to start")
}

async fn seed_token(store: &Store, secret: &str, port: u16) {
    let db = store.connection();
    let now = Utc::now();

    let team = team::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(format!("team-{secret}")),
        description: Set(None),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    let token = team_token::ActiveModel {
        id: Set(Uuid::new_v4()),
        team_id: Set(team.id),
        secret: Set(secret.to_string()),
        name: Set(format!("token-{secret}")),
        description: Set(None),
        expires_at: Set(None),
        last_used_at: Set(None),
        is_active: Set(true),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    port_assignment::ActiveModel {
        id: Set(Uuid::new_v4()),
        team_id: Set(team.id),
        token_id: Set(token.id),
        port: Set(i32::from(port)),
        protocol: Set("tcp".to_string()),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();
}

/// Authenticate an agent; returns the buffered control socket and the
/// broker's first reply line.
async fn connect_agent(control: SocketAddr, secret: &str) -> (BufReader<TcpStream>, String) {
    let mut stream = TcpStream::connect(control).await.unwrap();
    stream
        .write_all(format!("{secret}\n5432\n").as_bytes())
        .await
        .unwrap();

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    (reader, line)
}

fn parse_success(reply: &str) -> (String, u16) {
    let rest = reply
        .trim()
        .strip_prefix("SUCCESS:")
        .unwrap_or_else(|| panic!("expected SUCCESS reply, got {reply:?}"));
    let (tunnel_id, port) = rest.split_once(':').unwrap();
    (tunnel_id.to_string(), port.parse().unwrap())
}

/// Read the CONNECT + CONN_ID pair announcing a pending external connection
async fn expect_connect(agent: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    agent.read_line(&mut line).await.unwrap();
    assert_eq!(line.trim(), "CONNECT");

    line.clear();
    agent.read_line(&mut line).await.unwrap();
    line.trim()
        .strip_prefix("CONN_ID:")
        .expect("expected CONN_ID line")
        .to_string()
}

/// Open the data channel for `conn_id` and echo one 4-byte message
async fn serve_data_echo(control: SocketAddr, conn_id: &str) {
    let mut data = TcpStream::connect(control).await.unwrap();
    data.write_all(format!("DATA:{conn_id}\n").as_bytes())
        .await
        .unwrap();

    let mut buf = [0u8; 4];
    data.read_exact(&mut buf).await.unwrap();
    data.write_all(&buf).await.unwrap();
    data.flush().await.unwrap();
}

/// Poll the store until a connection record matches
async fn wait_for_record<F>(store: &Store, predicate: F) -> connection_record::Model
where
    F: Fn(&connection_record::Model) -> bool,
{
    for _ in 0..100 {
        let records = connection_record::Entity::find()
            .all(store.connection())
            .await
            .unwrap();
        if let Some(record) = records.into_iter().find(|r| predicate(r)) {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("expected connection record did not appear");
}

#[tokio::test]
async fn test_happy_path_bridges_and_records_bytes() {
    let url = temp_db_url("s1");
    let broker = start_broker(&url, Duration::from_secs(10)).await;
    let public_port = free_port();
    seed_token(broker.store(), "tok_ok", public_port).await;

    let (mut agent, reply) = connect_agent(broker.control_addr(), "tok_ok").await;
    let (tunnel_id, port) = parse_success(&reply);
    assert_eq!(port, public_port);

    let mut external = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    external.write_all(b"PING").await.unwrap();

    let conn_id = expect_connect(&mut agent).await;
    assert!(conn_id.starts_with(&format!("{tunnel_id}-")));

    let mut data = TcpStream::connect(broker.control_addr()).await.unwrap();
    data.write_all(format!("DATA:{conn_id}\n").as_bytes())
        .await
        .unwrap();
    let mut ping = [0u8; 4];
    data.read_exact(&mut ping).await.unwrap();
    assert_eq!(&ping, b"PING");
    data.write_all(b"PONG").await.unwrap();

    let mut pong = [0u8; 4];
    external.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"PONG");

    drop(external);
    drop(data);

    let record = wait_for_record(broker.store(), |r| {
        r.status == RecordStatus::Closed && r.client_port != 0
    })
    .await;
    assert_eq!(record.bytes_in, 4);
    assert_eq!(record.bytes_out, 4);
    assert!(record.ended_at.is_some());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_bad_token_rejected_without_state_changes() {
    let url = temp_db_url("s2");
    let broker = start_broker(&url, Duration::from_secs(10)).await;
    seed_token(broker.store(), "tok_ok", free_port()).await;

    let (mut agent, reply) = connect_agent(broker.control_addr(), "tok_bad").await;
    assert_eq!(reply.trim(), "ERROR:Invalid token or authentication failed");

    // Connection is closed after the error reply
    let mut buf = [0u8; 1];
    let read = agent.read(&mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)));

    // No session was started
    let sessions = connection_session::Entity::find()
        .all(broker.store().connection())
        .await
        .unwrap();
    assert!(sessions.is_empty());
    assert_eq!(broker.registry().count(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_pairing_timeout_records_and_keeps_agent() {
    let url = temp_db_url("s4");
    let broker = start_broker(&url, Duration::from_millis(300)).await;
    let public_port = free_port();
    seed_token(broker.store(), "tok_ok", public_port).await;

    let (mut agent, reply) = connect_agent(broker.control_addr(), "tok_ok").await;
    parse_success(&reply);

    let mut external = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    external.write_all(b"PING").await.unwrap();

    // The agent is told but never opens the data channel
    let _conn_id = expect_connect(&mut agent).await;

    // After the pairing timeout the external socket is closed
    let mut buf = [0u8; 16];
    let read = external.read(&mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)));

    let record =
        wait_for_record(broker.store(), |r| r.status == RecordStatus::Timeout).await;
    assert!(record.ended_at.is_some());

    // The tunnel stays attached: the next external connection is announced
    let _external2 = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    let conn_id2 = expect_connect(&mut agent).await;
    assert!(!conn_id2.is_empty());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_agent_loss_transitions_to_detached_and_503() {
    let url = temp_db_url("s3");
    let broker = start_broker(&url, Duration::from_millis(500)).await;
    let public_port = free_port();
    seed_token(broker.store(), "tok_ok", public_port).await;

    let (agent, reply) = connect_agent(broker.control_addr(), "tok_ok").await;
    parse_success(&reply);

    // Agent process dies; the broker's reader sees EOF and detaches
    drop(agent);

    let tunnel = broker.registry().list().pop().unwrap();
    for _ in 0..100 {
        if tunnel.state() == TunnelState::DetachedAgent {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(tunnel.state(), TunnelState::DetachedAgent);

    // The public port stays open and answers 503 immediately
    let mut external = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    let mut response = Vec::new();
    external.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 503"), "got: {text}");
    assert!(text.contains(&public_port.to_string()));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_restart_restores_listener_and_reattaches() {
    let url = temp_db_url("s5");
    let public_port = free_port();

    // First broker: agent authenticates, then the process "dies"
    let broker1 = start_broker(&url, Duration::from_secs(10)).await;
    seed_token(broker1.store(), "tok_ok", public_port).await;
    let (_agent1, reply1) = connect_agent(broker1.control_addr(), "tok_ok").await;
    parse_success(&reply1);
    broker1.abort().await;

    // Second broker restores the listener from the still-active session
    let broker2 = start_broker(&url, Duration::from_secs(10)).await;
    assert_eq!(broker2.registry().count(), 1);

    // Without an agent the restored port answers 503
    let mut probe = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    let mut response = Vec::new();
    probe.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 503"));

    // The agent reconnects into the restored tunnel
    let (mut agent, reply) = connect_agent(broker2.control_addr(), "tok_ok").await;
    let (_tunnel_id, port) = parse_success(&reply);
    assert_eq!(port, public_port);

    // And bridging works again
    let mut external = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    external.write_all(b"PING").await.unwrap();
    let conn_id = expect_connect(&mut agent).await;
    serve_data_echo(broker2.control_addr(), &conn_id).await;

    let mut echoed = [0u8; 4];
    external.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"PING");

    broker2.shutdown().await;
}

#[tokio::test]
async fn test_agent_replacement_keeps_listener() {
    let url = temp_db_url("s6");
    let broker = start_broker(&url, Duration::from_secs(10)).await;
    let public_port = free_port();
    seed_token(broker.store(), "tok_ok", public_port).await;

    let (mut agent1, reply1) = connect_agent(broker.control_addr(), "tok_ok").await;
    let (tunnel_id1, _) = parse_success(&reply1);

    let (mut agent2, reply2) = connect_agent(broker.control_addr(), "tok_ok").await;
    let (tunnel_id2, port2) = parse_success(&reply2);

    // Same tunnel, same port: the listener was not reopened
    assert_eq!(tunnel_id1, tunnel_id2);
    assert_eq!(port2, public_port);
    assert_eq!(broker.registry().count(), 1);

    // The first agent's control socket is closed by the replacement
    let mut buf = [0u8; 1];
    let read = agent1.read(&mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)));

    // New external connections route to the second agent
    let mut external = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    external.write_all(b"PING").await.unwrap();
    let conn_id = expect_connect(&mut agent2).await;
    serve_data_echo(broker.control_addr(), &conn_id).await;

    let mut echoed = [0u8; 4];
    external.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"PING");

    broker.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_externals_pair_out_of_order() {
    let url = temp_db_url("ooo");
    let broker = start_broker(&url, Duration::from_secs(10)).await;
    let public_port = free_port();
    seed_token(broker.store(), "tok_ok", public_port).await;

    let (mut agent, reply) = connect_agent(broker.control_addr(), "tok_ok").await;
    parse_success(&reply);

    let mut external_a = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    external_a.write_all(b"AAAA").await.unwrap();
    let conn_id_a = expect_connect(&mut agent).await;

    let mut external_b = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    external_b.write_all(b"BBBB").await.unwrap();
    let conn_id_b = expect_connect(&mut agent).await;
    assert_ne!(conn_id_a, conn_id_b);

    // Serve the second connection first; pairing is per-id, not ordered
    serve_data_echo(broker.control_addr(), &conn_id_b).await;
    serve_data_echo(broker.control_addr(), &conn_id_a).await;

    let mut echoed_b = [0u8; 4];
    external_b.read_exact(&mut echoed_b).await.unwrap();
    assert_eq!(&echoed_b, b"BBBB");

    let mut echoed_a = [0u8; 4];
    external_a.read_exact(&mut echoed_a).await.unwrap();
    assert_eq!(&echoed_a, b"AAAA");

    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_listeners_and_sessions() {
    let url = temp_db_url("shutdown");
    let broker = start_broker(&url, Duration::from_secs(10)).await;
    let public_port = free_port();
    seed_token(broker.store(), "tok_ok", public_port).await;

    let (mut agent, reply) = connect_agent(broker.control_addr(), "tok_ok").await;
    parse_success(&reply);
    let control_addr = broker.control_addr();

    broker.shutdown().await;

    // The agent control socket is gone
    let mut buf = [0u8; 1];
    let read = agent.read(&mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)));

    // Both the public port and the control port no longer accept
    assert!(TcpStream::connect(("127.0.0.1", public_port)).await.is_err());
    assert!(TcpStream::connect(control_addr).await.is_err());

    // The session was flipped to inactive
    let db = burrow_broker_db::connect(&url).await.unwrap();
    let store = Store::new(db);
    let sessions = connection_session::Entity::find()
        .all(store.connection())
        .await
        .unwrap();
    assert!(!sessions.is_empty());
    assert!(sessions
        .iter()
        .all(|s| s.status == SessionStatus::Inactive));
}
