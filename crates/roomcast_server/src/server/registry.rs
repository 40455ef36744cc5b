#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use roomcast_domain::{ChatMessage, RoomId, SessionId, UserId};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::debug;

use crate::server::error::{ChatError, ChatResult};
use crate::util::time::unix_ms_now;

/// Items pushed to a session's events stream.
#[derive(Debug, Clone)]
pub enum Outbound {
	Message { msg: Arc<ChatMessage>, replayed: bool },
	/// The session's queue overflowed and `dropped` pushes for `room_id` were lost.
	Lagged { room_id: RoomId, dropped: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	Authenticated,
	Joined,
	Disconnected,
}

#[derive(Debug, Clone)]
pub struct Session {
	pub id: SessionId,
	pub user_id: UserId,
	pub room_id: Option<RoomId>,
	pub connected_at_unix_ms: i64,
	pub state: SessionState,
	/// Highest sequence the client acknowledged in `room_id`.
	pub last_acked: u64,
}

impl Session {
	pub fn new(user_id: UserId) -> Self {
		Self {
			id: SessionId::new_v4(),
			user_id,
			room_id: None,
			connected_at_unix_ms: unix_ms_now(),
			state: SessionState::Connecting,
			last_acked: 0,
		}
	}
}

struct Entry {
	session: Session,
	outbound: mpsc::Sender<Outbound>,
}

/// Live sessions by id. Created at service start, torn down with [`ConnectionRegistry::shutdown`].
pub struct ConnectionRegistry {
	sessions: RwLock<HashMap<SessionId, Entry>>,
	shutdown: watch::Sender<bool>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		let (shutdown, _) = watch::channel(false);
		Self {
			sessions: RwLock::new(HashMap::new()),
			shutdown,
		}
	}

	pub async fn register(&self, mut session: Session, outbound: mpsc::Sender<Outbound>) -> SessionId {
		let id = session.id;
		if session.state == SessionState::Connecting {
			session.state = SessionState::Authenticated;
		}

		let mut sessions = self.sessions.write().await;
		sessions.insert(id, Entry { session, outbound });
		metrics::gauge!("roomcast_server_sessions_active").set(sessions.len() as f64);
		debug!(session_id = %id, "session registered");
		id
	}

	/// Remove a session and return its final state. The caller owns the room-leave cascade.
	pub async fn unregister(&self, id: SessionId) -> ChatResult<Session> {
		let mut sessions = self.sessions.write().await;
		let entry = sessions.remove(&id).ok_or(ChatError::SessionNotFound(id))?;
		metrics::gauge!("roomcast_server_sessions_active").set(sessions.len() as f64);

		let mut session = entry.session;
		session.state = SessionState::Disconnected;
		Ok(session)
	}

	pub async fn lookup(&self, id: SessionId) -> ChatResult<Session> {
		let sessions = self.sessions.read().await;
		sessions
			.get(&id)
			.map(|e| e.session.clone())
			.ok_or(ChatError::SessionNotFound(id))
	}

	pub async fn outbound(&self, id: SessionId) -> ChatResult<mpsc::Sender<Outbound>> {
		let sessions = self.sessions.read().await;
		sessions
			.get(&id)
			.map(|e| e.outbound.clone())
			.ok_or(ChatError::SessionNotFound(id))
	}

	/// Bind the session to `room` (or unbind with `None`) and reset its ack cursor.
	pub async fn set_room(&self, id: SessionId, room: Option<RoomId>, last_acked: u64) -> ChatResult<()> {
		let mut sessions = self.sessions.write().await;
		let entry = sessions.get_mut(&id).ok_or(ChatError::SessionNotFound(id))?;
		entry.session.state = if room.is_some() {
			SessionState::Joined
		} else {
			SessionState::Authenticated
		};
		entry.session.room_id = room;
		entry.session.last_acked = last_acked;
		Ok(())
	}

	/// Advance the ack cursor. Acks for another room or older sequences are ignored.
	pub async fn ack(&self, id: SessionId, room: &RoomId, sequence: u64) -> ChatResult<u64> {
		let mut sessions = self.sessions.write().await;
		let entry = sessions.get_mut(&id).ok_or(ChatError::SessionNotFound(id))?;
		if entry.session.room_id.as_ref() == Some(room) && sequence > entry.session.last_acked {
			entry.session.last_acked = sequence;
		}
		Ok(entry.session.last_acked)
	}

	pub async fn len(&self) -> usize {
		self.sessions.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.sessions.read().await.is_empty()
	}

	/// Receiver that flips to `true` once [`ConnectionRegistry::shutdown`] runs.
	pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
		self.shutdown.subscribe()
	}

	pub fn is_shutting_down(&self) -> bool {
		*self.shutdown.borrow()
	}

	/// Signal every connection to close and drain all sessions.
	pub async fn shutdown(&self) -> Vec<Session> {
		self.shutdown.send_replace(true);

		let mut sessions = self.sessions.write().await;
		let drained = sessions
			.drain()
			.map(|(_, e)| {
				let mut s = e.session;
				s.state = SessionState::Disconnected;
				s
			})
			.collect::<Vec<_>>();
		metrics::gauge!("roomcast_server_sessions_active").set(0.0);
		drained
	}
}

impl Default for ConnectionRegistry {
	fn default() -> Self {
		Self::new()
	}
}
