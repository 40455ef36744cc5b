#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomcast_client::{ClientConfig, ClientCoreError, SessionControl, SessionEvents};
use roomcast_protocol::pb;
use tokio::time::timeout;

use crate::quic::config::QuicServerConfig;
use crate::server::access::RoomAccess;
use crate::server::auth::issue_hmac_token;
use crate::server::connection::{close_code, handle_connection};
use crate::server::history::HistoryService;
use crate::server::lifecycle::{SessionManager, SessionManagerConfig};
use crate::server::test_support::{SECRET, manager, room, test_config};

struct TestServer {
	addr: SocketAddr,
	manager: Arc<SessionManager>,
	endpoint: quinn::Endpoint,
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.endpoint.close(0u32.into(), b"test over");
	}
}

async fn start_server(cfg: SessionManagerConfig) -> TestServer {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let manager = manager(cfg, HistoryService::in_memory(), RoomAccess::open());
	let quic = QuicServerConfig::new("127.0.0.1:0".parse().expect("addr"), manager.config().heartbeat_timeout);
	let (endpoint, _cert) = quic.bind_dev_endpoint().expect("bind dev endpoint");
	let addr = endpoint.local_addr().expect("local addr");

	let accept_endpoint = endpoint.clone();
	let accept_manager = Arc::clone(&manager);
	tokio::spawn(async move {
		let mut conn_id = 0u64;
		while let Some(incoming) = accept_endpoint.accept().await {
			conn_id += 1;
			let manager = Arc::clone(&accept_manager);
			tokio::spawn(async move {
				if let Ok(connection) = incoming.await {
					let _ = handle_connection(conn_id, connection, manager).await;
				}
			});
		}
	});

	TestServer {
		addr,
		manager,
		endpoint,
	}
}

fn client_config(server: &TestServer, user: &str) -> ClientConfig {
	ClientConfig {
		server_host: "localhost".to_string(),
		server_port: server.addr.port(),
		server_addr: Some(server.addr),
		auth_token: Some(issue_hmac_token(user, 300, SECRET).expect("token")),
		connect_timeout: Duration::from_secs(5),
		..ClientConfig::default()
	}
}

async fn next_chat(events: &mut SessionEvents) -> pb::ChatMessage {
	let ev = timeout(Duration::from_secs(2), events.next_event())
		.await
		.expect("event within timeout")
		.expect("events stream ok")
		.expect("events stream open");
	match ev.event {
		Some(pb::event_envelope::Event::NewMessage(m)) => m,
		other => panic!("expected NewMessage, got: {other:?}"),
	}
}

async fn wait_for_parked(manager: &SessionManager, parked: usize) {
	for _ in 0..100 {
		if manager.stats().await.parked == parked {
			return;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	panic!("parked sessions never reached {parked}");
}

#[tokio::test]
async fn chat_round_trip_over_quic() {
	let server = start_server(test_config()).await;

	let (mut alice, welcome) = SessionControl::connect(client_config(&server, "alice")).await.expect("alice connect");
	assert_eq!(welcome.user_id, "alice");
	assert!(!welcome.resumed);
	assert_eq!(welcome.heartbeat_interval_ms, 10_000);

	let ack = alice.join_room("lobby", 0).await.expect("alice join");
	assert_eq!(ack.current_sequence, 0);
	let mut alice_events = alice.open_events_stream().await.expect("alice events");

	let (mut bob, _) = SessionControl::connect(client_config(&server, "bob")).await.expect("bob connect");
	bob.join_room("lobby", 0).await.expect("bob join");
	let mut bob_events = bob.open_events_stream().await.expect("bob events");

	let sent = alice.send_chat("lobby", "hi").await.expect("send");
	assert_eq!(sent.sequence_number, 1);
	assert!(sent.persisted);

	let echo = next_chat(&mut alice_events).await;
	assert_eq!((echo.sequence_number, echo.sender_id.as_str()), (1, "alice"));
	let seen = next_chat(&mut bob_events).await;
	assert_eq!((seen.sequence_number, seen.content.as_str()), (1, "hi"));
	assert!(!seen.replayed);

	let history = bob.get_history("lobby", 0, 0).await.expect("history");
	assert_eq!(history.status(), pb::Status::Ok);
	assert_eq!(history.messages.len(), 1);
	assert!(history.messages[0].replayed);

	let pong = bob.ping(42).await.expect("ping");
	assert_eq!(pong.client_time_unix_ms, 42);

	let (mut carol, _) = SessionControl::connect(client_config(&server, "carol")).await.expect("carol connect");
	match carol.send_chat("lobby", "not joined").await {
		Err(ClientCoreError::Rejected { status, .. }) => assert_eq!(status, pb::Status::NotMember),
		other => panic!("expected NotMember, got: {other:?}"),
	}

	alice.leave_room("lobby").await.expect("leave");
	assert_eq!(server.manager.rooms().members(&room("lobby")).await.len(), 1);
}

#[tokio::test]
async fn bad_token_gets_unauthorized_error() {
	let server = start_server(test_config()).await;

	let cfg = ClientConfig {
		auth_token: Some("garbage".to_string()),
		..client_config(&server, "mallory")
	};
	match SessionControl::connect(cfg).await {
		Err(ClientCoreError::Rejected { status, .. }) => assert_eq!(status, pb::Status::Unauthorized),
		Err(other) => panic!("expected Unauthorized, got: {other}"),
		Ok(_) => panic!("connect with a bad token must fail"),
	}
	assert_eq!(server.manager.stats().await.sessions, 0);
}

#[tokio::test]
async fn silent_client_is_timed_out_and_parked() {
	let cfg = SessionManagerConfig {
		heartbeat_timeout: Duration::from_millis(300),
		..test_config()
	};
	let server = start_server(cfg).await;

	let (mut alice, _) = SessionControl::connect(client_config(&server, "alice")).await.expect("connect");
	alice.join_room("lobby", 0).await.expect("join");

	let err = timeout(Duration::from_secs(3), alice.closed()).await.expect("server closes the connection");
	match err {
		quinn::ConnectionError::ApplicationClosed(close) => {
			assert_eq!(close.error_code, close_code::HEARTBEAT_TIMEOUT.into());
		}
		other => panic!("expected application close, got: {other:?}"),
	}

	wait_for_parked(&server.manager, 1).await;
	assert_eq!(server.manager.stats().await.sessions, 0);
}

#[tokio::test]
async fn reconnect_with_session_id_replays_what_was_missed() {
	let server = start_server(test_config()).await;

	let (mut alice, welcome) = SessionControl::connect(client_config(&server, "alice")).await.expect("alice connect");
	alice.join_room("lobby", 0).await.expect("alice join");
	let mut alice_events = alice.open_events_stream().await.expect("alice events");

	let (mut bob, _) = SessionControl::connect(client_config(&server, "bob")).await.expect("bob connect");
	bob.join_room("lobby", 0).await.expect("bob join");

	bob.send_chat("lobby", "first").await.expect("send");
	let first = next_chat(&mut alice_events).await;
	alice.ack("lobby", first.sequence_number).await.expect("ack");
	// Control frames are handled in order, so the ack lands before the pong.
	alice.ping(0).await.expect("ping");

	alice.close(close_code::NORMAL, "network blip");
	wait_for_parked(&server.manager, 1).await;

	bob.send_chat("lobby", "second").await.expect("send");
	bob.send_chat("lobby", "third").await.expect("send");

	let cfg = ClientConfig {
		resume_session_id: Some(welcome.session_id.clone()),
		..client_config(&server, "alice")
	};
	let (mut again, resumed) = SessionControl::connect(cfg).await.expect("reconnect");
	assert!(resumed.resumed);
	assert_eq!(resumed.resumed_room_id, "lobby");
	assert_eq!(resumed.resumed_from_sequence, 2);
	assert_ne!(resumed.session_id, welcome.session_id);

	let mut events = again.open_events_stream().await.expect("events");
	for (seq, content) in [(2, "second"), (3, "third")] {
		let m = next_chat(&mut events).await;
		assert_eq!((m.sequence_number, m.content.as_str()), (seq, content));
		assert!(m.replayed);
	}

	bob.send_chat("lobby", "live").await.expect("send");
	let live = next_chat(&mut events).await;
	assert_eq!(live.sequence_number, 4);
	assert!(!live.replayed);
}
