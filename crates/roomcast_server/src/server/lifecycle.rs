#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use roomcast_domain::{ChatMessage, RoomId, SecretString, SessionId, UserId};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::server::access::RoomAccess;
use crate::server::auth::verify_hmac_token;
use crate::server::error::{ChatError, ChatResult};
use crate::server::history::{HistoryPage, HistoryService};
use crate::server::membership::{JoinOutcome, RoomTable, RoomTableConfig};
use crate::server::registry::{ConnectionRegistry, Outbound, Session, SessionState};

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
	pub server_name: String,
	pub auth_hmac_secret: Option<SecretString>,
	pub heartbeat_timeout: Duration,
	pub resume_grace: Duration,
	pub room_idle_grace: Duration,
	pub outbound_queue_capacity: usize,
	pub max_message_bytes: usize,
	pub history_page_limit: usize,
	pub send_rate_limit_burst: u32,
	pub send_rate_limit_per_minute: u32,
}

impl Default for SessionManagerConfig {
	fn default() -> Self {
		Self {
			server_name: "roomcast".to_string(),
			auth_hmac_secret: None,
			heartbeat_timeout: Duration::from_secs(30),
			resume_grace: Duration::from_secs(120),
			room_idle_grace: Duration::from_secs(60),
			outbound_queue_capacity: 1024,
			max_message_bytes: 4096,
			history_page_limit: 500,
			send_rate_limit_burst: 20,
			send_rate_limit_per_minute: 120,
		}
	}
}

impl From<&ServerConfig> for SessionManagerConfig {
	fn from(cfg: &ServerConfig) -> Self {
		let s = &cfg.server;
		Self {
			server_name: cfg.server_name.clone(),
			auth_hmac_secret: s.auth_hmac_secret.clone(),
			heartbeat_timeout: s.heartbeat_timeout,
			resume_grace: s.resume_grace,
			room_idle_grace: s.room_idle_grace,
			outbound_queue_capacity: s.outbound_queue_capacity,
			max_message_bytes: s.max_message_bytes,
			history_page_limit: s.history_page_limit,
			send_rate_limit_burst: s.send_rate_limit_burst,
			send_rate_limit_per_minute: s.send_rate_limit_per_minute,
		}
	}
}

#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	pub(crate) fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	pub(crate) fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
	/// Peer closed the transport.
	Closed,
	/// No inbound frame within the heartbeat timeout.
	Timeout,
	/// The server is stopping.
	Shutdown,
}

impl DisconnectReason {
	fn as_str(self) -> &'static str {
		match self {
			DisconnectReason::Closed => "closed",
			DisconnectReason::Timeout => "timeout",
			DisconnectReason::Shutdown => "shutdown",
		}
	}
}

/// A joined session that dropped and may come back.
#[derive(Debug, Clone)]
struct ParkedSession {
	user_id: UserId,
	room_id: RoomId,
	last_acked: u64,
	deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
	pub room_id: RoomId,
	/// First sequence replayed, i.e. the parked ack cursor plus one.
	pub from_sequence: u64,
	pub join: JoinOutcome,
}

pub struct OpenedSession {
	pub session_id: SessionId,
	pub user_id: UserId,
	pub outbound: mpsc::Receiver<Outbound>,
	pub resumed: Option<ResumeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
	pub sessions: usize,
	pub rooms: usize,
	pub parked: usize,
}

/// Drives sessions through authenticate, join, send, leave, disconnect and resume.
pub struct SessionManager {
	cfg: SessionManagerConfig,
	registry: Arc<ConnectionRegistry>,
	rooms: RoomTable,
	history: HistoryService,
	access: RoomAccess,
	parked: Mutex<HashMap<SessionId, ParkedSession>>,
	limiters: Mutex<HashMap<SessionId, TokenBucket>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
	m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
	pub fn new(cfg: SessionManagerConfig, history: HistoryService, access: RoomAccess) -> Self {
		let rooms = RoomTable::new(
			history.clone(),
			RoomTableConfig {
				idle_grace: cfg.room_idle_grace,
				replay_page_limit: cfg.history_page_limit,
			},
		);
		Self {
			cfg,
			registry: Arc::new(ConnectionRegistry::new()),
			rooms,
			history,
			access,
			parked: Mutex::new(HashMap::new()),
			limiters: Mutex::new(HashMap::new()),
		}
	}

	pub fn config(&self) -> &SessionManagerConfig {
		&self.cfg
	}

	pub fn is_shutting_down(&self) -> bool {
		self.registry.is_shutting_down()
	}

	pub fn rooms(&self) -> &RoomTable {
		&self.rooms
	}

	/// Validate a bearer token presented at channel open.
	pub fn authenticate(&self, token: &str) -> ChatResult<UserId> {
		let fail = |reason: String| {
			metrics::counter!("roomcast_server_auth_failures_total").increment(1);
			ChatError::Unauthorized(reason)
		};

		let Some(secret) = self.cfg.auth_hmac_secret.as_ref() else {
			return Err(fail("server has no auth secret configured".to_string()));
		};
		let token = token.trim();
		if token.is_empty() {
			return Err(fail("missing bearer token".to_string()));
		}

		let claims = verify_hmac_token(token, secret.expose()).map_err(|e| fail(e.to_string()))?;
		claims.user_id().map_err(|e| fail(e.to_string()))
	}

	/// Register an authenticated user. If `resume` names a parked session of the same
	/// user that is still within its grace window, the new session rejoins that room and
	/// gets everything after the parked ack cursor replayed.
	pub async fn open_session(&self, user_id: UserId, resume: Option<SessionId>) -> OpenedSession {
		let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_capacity);
		let session = Session::new(user_id.clone());
		let session_id = self.registry.register(session, tx).await;
		info!(session_id = %session_id, user = %user_id, "session opened");

		let parked = resume.and_then(|old| self.take_parked(old, &user_id));
		let resumed = match parked {
			Some(p) => match self.join_room(session_id, p.room_id.clone(), Some(p.last_acked)).await {
				Ok(join) => {
					metrics::counter!("roomcast_server_resumes_total").increment(1);
					info!(
						session_id = %session_id,
						room_id = %p.room_id,
						from = p.last_acked + 1,
						replayed = join.replayed,
						"session resumed"
					);
					Some(ResumeInfo {
						room_id: p.room_id,
						from_sequence: p.last_acked + 1,
						join,
					})
				}
				Err(e) => {
					warn!(session_id = %session_id, room_id = %p.room_id, error = %e, "resume rejoin failed; starting fresh");
					None
				}
			},
			None => None,
		};

		OpenedSession {
			session_id,
			user_id,
			outbound: rx,
			resumed,
		}
	}

	fn take_parked(&self, old: SessionId, user_id: &UserId) -> Option<ParkedSession> {
		let mut parked = locked(&self.parked);
		let entry = parked.get(&old)?;
		if &entry.user_id != user_id {
			warn!(session_id = %old, user = %user_id, "resume refused: session belongs to another user");
			return None;
		}
		let entry = parked.remove(&old)?;
		if entry.deadline <= Instant::now() {
			debug!(session_id = %old, "resume refused: grace window elapsed");
			return None;
		}
		Some(entry)
	}

	/// Join `room`. `last_acked` requests replay of everything after that sequence.
	pub async fn join_room(&self, session_id: SessionId, room: RoomId, last_acked: Option<u64>) -> ChatResult<JoinOutcome> {
		let session = self.registry.lookup(session_id).await?;
		if !self.access.can_join(&session.user_id, &room) {
			metrics::counter!("roomcast_server_join_forbidden_total").increment(1);
			return Err(ChatError::Forbidden(room));
		}

		let outbound = self.registry.outbound(session_id).await?;
		let outcome = match self.rooms.join(session_id, &session.user_id, &outbound, &room, last_acked).await {
			Ok(outcome) => outcome,
			Err(e) => {
				if session.room_id.is_some() && self.rooms.room_of(session_id).is_none() {
					self.registry.set_room(session_id, None, 0).await?;
				}
				return Err(e);
			}
		};

		if !outcome.already_member {
			let cursor = last_acked.unwrap_or(outcome.current_sequence);
			self.registry.set_room(session_id, Some(room.clone()), cursor).await?;
			metrics::counter!("roomcast_server_joins_total").increment(1);
		}
		Ok(outcome)
	}

	/// Explicit leave: the channel stays open and the session returns to `Authenticated`.
	pub async fn leave_room(&self, session_id: SessionId, room: &RoomId) -> ChatResult<()> {
		let session = self.registry.lookup(session_id).await?;
		if session.room_id.as_ref() != Some(room) {
			return Err(ChatError::NotMember(room.clone()));
		}

		self.rooms.leave(session_id).await;
		self.registry.set_room(session_id, None, 0).await?;
		debug!(session_id = %session_id, room_id = %room, "left room");
		Ok(())
	}

	pub async fn send_chat(&self, session_id: SessionId, room: &RoomId, content: String) -> ChatResult<ChatMessage> {
		let session = self.registry.lookup(session_id).await?;
		if session.room_id.as_ref() != Some(room) {
			return Err(ChatError::NotMember(room.clone()));
		}

		if content.trim().is_empty() {
			return Err(ChatError::InvalidMessage("content is empty".to_string()));
		}
		if content.len() > self.cfg.max_message_bytes {
			return Err(ChatError::InvalidMessage(format!(
				"content is {} bytes, limit is {}",
				content.len(),
				self.cfg.max_message_bytes
			)));
		}

		if !self.allow_send(session_id) {
			metrics::counter!("roomcast_server_rate_limited_total").increment(1);
			return Err(ChatError::RateLimited);
		}

		self.rooms.accept(room, session_id, content).await
	}

	fn allow_send(&self, session_id: SessionId) -> bool {
		let mut limiters = locked(&self.limiters);
		if let Some(bucket) = limiters.get_mut(&session_id) {
			return bucket.allow();
		}
		match TokenBucket::new(self.cfg.send_rate_limit_burst, self.cfg.send_rate_limit_per_minute) {
			Some(mut bucket) => {
				let allowed = bucket.allow();
				limiters.insert(session_id, bucket);
				allowed
			}
			None => true,
		}
	}

	/// Advance the session's ack cursor, never past the room's last sequenced message.
	pub async fn ack(&self, session_id: SessionId, room: &RoomId, sequence: u64) -> ChatResult<u64> {
		let upto = self.rooms.current_sequence(room).await.unwrap_or(0);
		if sequence > upto {
			debug!(session_id = %session_id, room_id = %room, sequence, upto, "ack beyond room head clamped");
		}
		self.registry.ack(session_id, room, sequence.min(upto)).await
	}

	/// Ascending messages after `since`, at most `limit` (0 or above the page limit means the page limit).
	pub async fn get_history(
		&self,
		session_id: SessionId,
		room: &RoomId,
		since: u64,
		limit: usize,
	) -> ChatResult<HistoryPage> {
		let session = self.registry.lookup(session_id).await?;
		if !self.access.can_join(&session.user_id, room) {
			return Err(ChatError::Forbidden(room.clone()));
		}

		let limit = if limit == 0 {
			self.cfg.history_page_limit
		} else {
			limit.min(self.cfg.history_page_limit)
		};
		self.history
			.page(room, since, limit)
			.await
			.map_err(|e| ChatError::Internal(format!("history read failed: {e}")))
	}

	/// Tear the session down. A joined session is parked for the resume grace window.
	/// An unknown id is treated as already disconnected.
	pub async fn disconnect(&self, session_id: SessionId, reason: DisconnectReason) -> Option<Session> {
		let session = match self.registry.unregister(session_id).await {
			Ok(s) => s,
			Err(e) => {
				debug!(session_id = %session_id, error = %e, "disconnect for unknown session");
				return None;
			}
		};

		self.rooms.leave(session_id).await;
		locked(&self.limiters).remove(&session_id);

		if reason != DisconnectReason::Shutdown
			&& let Some(room_id) = session.room_id.clone()
			&& !self.cfg.resume_grace.is_zero()
		{
			locked(&self.parked).insert(
				session_id,
				ParkedSession {
					user_id: session.user_id.clone(),
					room_id,
					last_acked: session.last_acked,
					deadline: Instant::now() + self.cfg.resume_grace,
				},
			);
		}

		if reason == DisconnectReason::Timeout {
			metrics::counter!("roomcast_server_heartbeat_timeouts_total").increment(1);
		}
		info!(
			session_id = %session_id,
			user = %session.user_id,
			reason = reason.as_str(),
			"session disconnected"
		);
		Some(session)
	}

	/// Drop parked sessions whose grace window has passed.
	pub fn sweep_parked(&self, now: Instant) -> usize {
		let mut parked = locked(&self.parked);
		let before = parked.len();
		parked.retain(|_, p| p.deadline > now);
		before - parked.len()
	}

	pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
		let manager = Arc::clone(self);
		let mut shutdown = self.registry.subscribe_shutdown();
		let period = (self.cfg.resume_grace / 4).max(Duration::from_secs(1));

		tokio::spawn(async move {
			let mut tick = tokio::time::interval(period);
			loop {
				tokio::select! {
					_ = tick.tick() => {
						let swept = manager.sweep_parked(Instant::now());
						if swept > 0 {
							debug!(swept, "expired parked sessions");
						}
					}
					_ = shutdown.changed() => break,
				}
			}
		})
	}

	pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
		self.registry.subscribe_shutdown()
	}

	/// Force-disconnect every session. Nothing is parked.
	pub async fn shutdown(&self) {
		let sessions = self.registry.shutdown().await;
		for s in &sessions {
			self.rooms.leave(s.id).await;
		}
		locked(&self.parked).clear();
		locked(&self.limiters).clear();
		info!(sessions = sessions.len(), "session manager stopped");
	}

	pub async fn stats(&self) -> SessionStats {
		SessionStats {
			sessions: self.registry.len().await,
			rooms: self.rooms.room_count(),
			parked: locked(&self.parked).len(),
		}
	}

	pub async fn session_state(&self, session_id: SessionId) -> ChatResult<SessionState> {
		Ok(self.registry.lookup(session_id).await?.state)
	}
}
