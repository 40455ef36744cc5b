#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use roomcast_domain::{ChatMessage, RoomId, SecretString, UserId};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::access::RoomAccess;
use crate::server::history::{HistoryService, HistoryStore, InMemoryHistoryStore};
use crate::server::lifecycle::{SessionManager, SessionManagerConfig};
use crate::server::registry::Outbound;

pub const SECRET: &str = "test-secret";

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("ROOMCAST_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

pub fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

pub fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

/// In-memory store whose appends can be switched to fail, and whose reads fail for one room.
#[derive(Default)]
pub struct FlakyHistoryStore {
	inner: InMemoryHistoryStore,
	fail_appends: AtomicBool,
	unreadable: Mutex<Option<RoomId>>,
}

impl FlakyHistoryStore {
	pub fn set_failing(&self, failing: bool) {
		self.fail_appends.store(failing, Ordering::SeqCst);
	}

	pub fn set_unreadable(&self, room: RoomId) {
		*self.unreadable.lock().expect("unreadable lock") = Some(room);
	}

	fn check_readable(&self, room: &RoomId) -> anyhow::Result<()> {
		if self.unreadable.lock().expect("unreadable lock").as_ref() == Some(room) {
			return Err(anyhow!("db down"));
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl HistoryStore for FlakyHistoryStore {
	async fn append(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		if self.fail_appends.load(Ordering::SeqCst) {
			return Err(anyhow!("disk full"));
		}
		self.inner.append(msg).await
	}

	async fn read(&self, room: &RoomId, after: u64, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		self.check_readable(room)?;
		self.inner.read(room, after, limit).await
	}

	async fn last_sequence(&self, room: &RoomId) -> anyhow::Result<u64> {
		self.check_readable(room)?;
		self.inner.last_sequence(room).await
	}
}

pub fn test_config() -> SessionManagerConfig {
	SessionManagerConfig {
		auth_hmac_secret: Some(SecretString::new(SECRET)),
		..SessionManagerConfig::default()
	}
}

pub fn manager(cfg: SessionManagerConfig, history: HistoryService, access: RoomAccess) -> Arc<SessionManager> {
	init_test_logging();
	Arc::new(SessionManager::new(cfg, history, access))
}

pub async fn next_message(rx: &mut mpsc::Receiver<Outbound>) -> (Arc<ChatMessage>, bool) {
	let item = timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected an outbound item within timeout")
		.expect("outbound channel open");
	match item {
		Outbound::Message { msg, replayed } => (msg, replayed),
		other => panic!("expected Message, got: {other:?}"),
	}
}

pub async fn assert_quiet(rx: &mut mpsc::Receiver<Outbound>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "unexpected outbound item: {got:?}");
}
