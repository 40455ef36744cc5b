#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use roomcast_domain::{ChatMessage, DeliveryState, RoomId, UserId};
use tokio::sync::Mutex;
use tracing::warn;

/// Durable message log, one ordered sequence per room.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
	/// Append one sequenced message. Must fail if `(room, sequence)` already exists.
	async fn append(&self, msg: &ChatMessage) -> anyhow::Result<()>;

	/// Messages with `sequence_number > after`, ascending, at most `limit`.
	async fn read(&self, room: &RoomId, after: u64, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;

	/// Highest stored sequence for `room`, 0 when empty.
	async fn last_sequence(&self, room: &RoomId) -> anyhow::Result<u64>;
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
	rooms: Mutex<HashMap<RoomId, BTreeMap<u64, ChatMessage>>>,
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
	async fn append(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		let mut rooms = self.rooms.lock().await;
		let log = rooms.entry(msg.room_id.clone()).or_default();
		if log.contains_key(&msg.sequence_number) {
			return Err(anyhow!(
				"duplicate sequence {} in room {}",
				msg.sequence_number,
				msg.room_id
			));
		}

		let mut stored = msg.clone();
		stored.delivery = DeliveryState::Persisted;
		log.insert(msg.sequence_number, stored);
		Ok(())
	}

	async fn read(&self, room: &RoomId, after: u64, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		let rooms = self.rooms.lock().await;
		let Some(log) = rooms.get(room) else {
			return Ok(Vec::new());
		};
		Ok(log
			.range(after.saturating_add(1)..)
			.take(limit)
			.map(|(_, m)| m.clone())
			.collect())
	}

	async fn last_sequence(&self, room: &RoomId) -> anyhow::Result<u64> {
		let rooms = self.rooms.lock().await;
		Ok(rooms
			.get(room)
			.and_then(|log| log.keys().next_back().copied())
			.unwrap_or(0))
	}
}

#[derive(Clone)]
pub struct SqliteHistoryStore {
	pool: sqlx::SqlitePool,
}

impl SqliteHistoryStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (use sqlite:)"));
		}
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		Self::from_pool(pool).await
	}

	/// Wrap an existing pool, running embedded migrations first.
	pub async fn from_pool(pool: sqlx::SqlitePool) -> anyhow::Result<Self> {
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;
		Ok(Self { pool })
	}
}

type MessageRow = (String, i64, String, String, i64);

fn row_to_message(row: MessageRow) -> anyhow::Result<ChatMessage> {
	let (room_id, seq, sender_id, content, created_at_ms) = row;
	Ok(ChatMessage {
		room_id: RoomId::new(room_id).context("stored room id")?,
		sender_id: UserId::new(sender_id).context("stored sender id")?,
		sequence_number: u64::try_from(seq).context("stored sequence")?,
		content,
		created_at_unix_ms: created_at_ms,
		delivery: DeliveryState::Persisted,
	})
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistoryStore {
	async fn append(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO messages (room_id, seq, sender_id, content, created_at_ms) VALUES (?, ?, ?, ?, ?)")
			.bind(msg.room_id.as_str())
			.bind(msg.sequence_number as i64)
			.bind(msg.sender_id.as_str())
			.bind(&msg.content)
			.bind(msg.created_at_unix_ms)
			.execute(&self.pool)
			.await
			.context("insert message (sqlite)")?;
		Ok(())
	}

	async fn read(&self, room: &RoomId, after: u64, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		let rows = sqlx::query_as::<_, MessageRow>(
			"SELECT room_id, seq, sender_id, content, created_at_ms FROM messages \
			WHERE room_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
		)
		.bind(room.as_str())
		.bind(after as i64)
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.context("select messages (sqlite)")?;

		rows.into_iter().map(row_to_message).collect()
	}

	async fn last_sequence(&self, room: &RoomId) -> anyhow::Result<u64> {
		let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM messages WHERE room_id = ?")
			.bind(room.as_str())
			.fetch_one(&self.pool)
			.await
			.context("select last sequence (sqlite)")?;
		Ok(row.0.map(|s| s.max(0) as u64).unwrap_or(0))
	}
}

/// One page of history plus whether it skips a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
	pub room_id: RoomId,
	pub messages: Vec<ChatMessage>,
	pub has_gap: bool,
}

/// True if `messages` continue `after` without skipping a number.
pub fn is_contiguous(after: u64, messages: &[ChatMessage]) -> bool {
	let mut expected = after.saturating_add(1);
	for m in messages {
		if m.sequence_number != expected {
			return false;
		}
		expected = expected.saturating_add(1);
	}
	true
}

/// History access shared by room actors and the lifecycle manager.
#[derive(Clone)]
pub struct HistoryService {
	backend: Arc<dyn HistoryStore>,
}

impl HistoryService {
	pub fn new(backend: Arc<dyn HistoryStore>) -> Self {
		Self { backend }
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(InMemoryHistoryStore::default()))
	}

	pub async fn append(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		self.backend.append(msg).await
	}

	pub async fn last_sequence(&self, room: &RoomId) -> anyhow::Result<u64> {
		self.backend.last_sequence(room).await
	}

	/// Read a page after `after`, flagging and counting any gap.
	pub async fn page(&self, room: &RoomId, after: u64, limit: usize) -> anyhow::Result<HistoryPage> {
		let messages = self.backend.read(room, after, limit).await?;
		let has_gap = !is_contiguous(after, &messages);
		if has_gap {
			metrics::counter!("roomcast_server_history_gaps_total").increment(1);
			warn!(
				room_id = %room,
				after,
				first = messages.first().map(|m| m.sequence_number).unwrap_or(0),
				"history gap detected"
			);
		}

		Ok(HistoryPage {
			room_id: room.clone(),
			messages,
			has_gap,
		})
	}
}
