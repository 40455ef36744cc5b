#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

use crate::server::access::RoomAccess;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::history::HistoryService;
use crate::server::test_support::{manager, room, test_config, user};

fn free_local_addr() -> SocketAddr {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
	listener.local_addr().expect("probe addr")
}

async fn get(addr: SocketAddr, path: &str) -> String {
	let mut last_err = None;
	for _ in 0..50 {
		match TcpStream::connect(addr).await {
			Ok(mut stream) => {
				let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
				stream.write_all(req.as_bytes()).await.expect("write request");
				let mut resp = String::new();
				stream.read_to_string(&mut resp).await.expect("read response");
				return resp;
			}
			Err(e) => {
				last_err = Some(e);
				tokio::time::sleep(Duration::from_millis(20)).await;
			}
		}
	}
	panic!("health server never came up: {last_err:?}");
}

#[tokio::test]
async fn health_routes_report_liveness_readiness_and_stats() {
	let mgr = manager(test_config(), HistoryService::in_memory(), RoomAccess::open());
	let s = mgr.open_session(user("alice"), None).await;
	mgr.join_room(s.session_id, room("r1"), None).await.expect("join");

	let state = HealthState::new(mgr.clone());
	let addr = free_local_addr();
	spawn_health_server(addr, state.clone());

	assert!(get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
	assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));

	state.mark_ready();
	assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 200"));

	let stats = get(addr, "/stats").await;
	assert!(stats.starts_with("HTTP/1.1 200"), "{stats}");
	assert!(stats.contains("application/json"));
	assert!(stats.contains(r#"{"sessions":1,"rooms":1,"parked":0}"#), "{stats}");

	assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));
}
