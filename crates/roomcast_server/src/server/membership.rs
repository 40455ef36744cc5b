#![forbid(unsafe_code)]

//! Room membership as an arena of per-room actors.
//!
//! Each room is one task owning its member set and [`Sequencer`]; every mutation of
//! a room goes through its command channel, so rooms run in parallel while each
//! room stays serialized. The arena lock only guards lookup and spawn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use roomcast_domain::{ChatMessage, DeliveryState, RoomId, SessionId, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::server::error::{ChatError, ChatResult};
use crate::server::history::HistoryService;
use crate::server::registry::Outbound;
use crate::server::sequencer::{Sequencer, fan_out};

const ROOM_COMMAND_CAPACITY: usize = 256;
const ROOM_CALL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct RoomTableConfig {
	/// How long an empty room lingers before its actor retires.
	pub idle_grace: Duration,
	/// Page size used when replaying history into a joining session.
	pub replay_page_limit: usize,
}

impl Default for RoomTableConfig {
	fn default() -> Self {
		Self {
			idle_grace: Duration::from_secs(60),
			replay_page_limit: 500,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
	pub room_id: RoomId,
	/// Last sequence in the room at the moment the session became a member.
	pub current_sequence: u64,
	/// Messages pushed from history before live delivery started.
	pub replayed: usize,
	/// Replay stopped early because the session's queue filled. A `Lagged` marker is queued
	/// behind the replayed messages (or rides the next live push if even that did not fit).
	pub replay_truncated: bool,
	pub already_member: bool,
}

#[derive(Debug)]
pub(crate) struct Member {
	pub(crate) user_id: UserId,
	pub(crate) outbound: mpsc::Sender<Outbound>,
	pub(crate) pending_lag: u64,
}

enum RoomCommand {
	Join {
		session: SessionId,
		user_id: UserId,
		outbound: mpsc::Sender<Outbound>,
		replay_after: Option<u64>,
		reply: oneshot::Sender<ChatResult<JoinOutcome>>,
	},
	Leave {
		session: SessionId,
		/// Last sequence at removal, `None` if the session was not a member.
		reply: oneshot::Sender<Option<u64>>,
	},
	Current {
		reply: oneshot::Sender<ChatResult<u64>>,
	},
	Members {
		reply: oneshot::Sender<Vec<SessionId>>,
	},
	Accept {
		session: SessionId,
		content: String,
		reply: oneshot::Sender<ChatResult<ChatMessage>>,
	},
}

#[derive(Clone)]
struct RoomHandle {
	actor_id: u64,
	tx: mpsc::Sender<RoomCommand>,
}

#[derive(Default)]
struct Arena {
	rooms: HashMap<RoomId, RoomHandle>,
	session_rooms: HashMap<SessionId, RoomId>,
	next_actor_id: u64,
}

/// Room identifier to member sessions.
#[derive(Clone)]
pub struct RoomTable {
	arena: Arc<Mutex<Arena>>,
	history: HistoryService,
	cfg: RoomTableConfig,
}

impl RoomTable {
	pub fn new(history: HistoryService, cfg: RoomTableConfig) -> Self {
		Self {
			arena: Arc::new(Mutex::new(Arena::default())),
			history,
			cfg,
		}
	}

	fn lock(&self) -> MutexGuard<'_, Arena> {
		self.arena.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn handle(&self, room: &RoomId, spawn: bool) -> Option<RoomHandle> {
		let mut arena = self.lock();
		if let Some(h) = arena.rooms.get(room)
			&& !h.tx.is_closed()
		{
			return Some(h.clone());
		}
		if !spawn {
			return None;
		}

		arena.next_actor_id += 1;
		let (tx, rx) = mpsc::channel(ROOM_COMMAND_CAPACITY);
		let handle = RoomHandle {
			actor_id: arena.next_actor_id,
			tx,
		};

		let actor = RoomActor {
			actor_id: handle.actor_id,
			room_id: room.clone(),
			rx,
			members: HashMap::new(),
			sequencer: Sequencer::new(room.clone(), self.history.clone()),
			arena: Arc::downgrade(&self.arena),
			cfg: self.cfg.clone(),
			idle_deadline: None,
		};
		tokio::spawn(actor.run());

		arena.rooms.insert(room.clone(), handle.clone());
		metrics::gauge!("roomcast_server_rooms_active").set(arena.rooms.len() as f64);
		Some(handle)
	}

	/// Send a command to the room's actor, retrying if the actor retires under us.
	/// `None` means the room has no live actor and `spawn` was false.
	async fn call<T>(&self, room: &RoomId, spawn: bool, make: impl Fn(oneshot::Sender<T>) -> RoomCommand) -> Option<T> {
		for _ in 0..ROOM_CALL_ATTEMPTS {
			let handle = self.handle(room, spawn)?;
			let (reply, rx) = oneshot::channel();
			if handle.tx.send(make(reply)).await.is_err() {
				continue;
			}
			if let Ok(v) = rx.await {
				return Some(v);
			}
		}
		None
	}

	/// Make `session` a member of `room`, leaving any other room first. Re-joining the
	/// current room changes nothing.
	///
	/// With `replay_after`, history after that sequence is pushed to `outbound` before the
	/// session starts receiving live messages.
	///
	/// A failed switch leaves the session in its previous room, with anything sequenced
	/// there in the meantime replayed.
	pub async fn join(
		&self,
		session: SessionId,
		user_id: &UserId,
		outbound: &mpsc::Sender<Outbound>,
		room: &RoomId,
		replay_after: Option<u64>,
	) -> ChatResult<JoinOutcome> {
		let prev = self.lock().session_rooms.get(&session).cloned();
		let mut left = None;
		if let Some(prev) = prev
			&& &prev != room
		{
			self.current_or_spawn(room).await?;
			left = self.leave_at(session).await;
		}

		let res = self.enter(session, user_id, outbound, room, replay_after).await;
		if let Err(e) = &res
			&& let Some((prev, cursor)) = left
		{
			warn!(session_id = %session, room_id = %room, prev = %prev, error = %e, "room switch failed; restoring previous room");
			if let Err(e) = self.enter(session, user_id, outbound, &prev, cursor).await {
				warn!(session_id = %session, room_id = %prev, error = %e, "could not restore previous room");
			}
		}
		res
	}

	async fn enter(
		&self,
		session: SessionId,
		user_id: &UserId,
		outbound: &mpsc::Sender<Outbound>,
		room: &RoomId,
		replay_after: Option<u64>,
	) -> ChatResult<JoinOutcome> {
		let outcome = self
			.call(room, true, |reply| RoomCommand::Join {
				session,
				user_id: user_id.clone(),
				outbound: outbound.clone(),
				replay_after,
				reply,
			})
			.await
			.ok_or_else(|| ChatError::Internal(format!("room {room} unavailable")))??;

		self.lock().session_rooms.insert(session, room.clone());
		Ok(outcome)
	}

	/// Remove `session` from its room. Returns the room it left, if any.
	pub async fn leave(&self, session: SessionId) -> Option<RoomId> {
		self.leave_at(session).await.map(|(room, _)| room)
	}

	async fn leave_at(&self, session: SessionId) -> Option<(RoomId, Option<u64>)> {
		let room = self.lock().session_rooms.remove(&session)?;
		let at = self
			.call(&room, false, |reply| RoomCommand::Leave { session, reply })
			.await
			.flatten();
		Some((room, at))
	}

	async fn current_or_spawn(&self, room: &RoomId) -> ChatResult<u64> {
		self.call(room, true, |reply| RoomCommand::Current { reply })
			.await
			.ok_or_else(|| ChatError::Internal(format!("room {room} unavailable")))?
	}

	/// Last sequence in `room`, or `None` if the room has no live actor or its history is unreadable.
	pub async fn current_sequence(&self, room: &RoomId) -> Option<u64> {
		self.call(room, false, |reply| RoomCommand::Current { reply })
			.await
			.and_then(Result::ok)
	}

	pub async fn members(&self, room: &RoomId) -> Vec<SessionId> {
		self.call(room, false, |reply| RoomCommand::Members { reply })
			.await
			.unwrap_or_default()
	}

	pub fn room_of(&self, session: SessionId) -> Option<RoomId> {
		self.lock().session_rooms.get(&session).cloned()
	}

	/// Sequence `content` from `session` into `room` and fan it out.
	pub async fn accept(&self, room: &RoomId, session: SessionId, content: String) -> ChatResult<ChatMessage> {
		self.call(room, false, |reply| RoomCommand::Accept {
			session,
			content: content.clone(),
			reply,
		})
		.await
		.unwrap_or_else(|| Err(ChatError::NotMember(room.clone())))
	}

	pub fn room_count(&self) -> usize {
		self.lock().rooms.len()
	}
}

struct RoomActor {
	actor_id: u64,
	room_id: RoomId,
	rx: mpsc::Receiver<RoomCommand>,
	members: HashMap<SessionId, Member>,
	sequencer: Sequencer,
	arena: Weak<Mutex<Arena>>,
	cfg: RoomTableConfig,
	idle_deadline: Option<Instant>,
}

impl RoomActor {
	async fn run(mut self) {
		debug!(room_id = %self.room_id, actor_id = self.actor_id, "room actor started");
		self.rearm_idle();

		loop {
			let cmd = match self.idle_deadline {
				Some(deadline) => tokio::select! {
					cmd = self.rx.recv() => cmd,
					_ = tokio::time::sleep_until(deadline) => {
						if self.try_retire() {
							break;
						}
						continue;
					}
				},
				None => self.rx.recv().await,
			};

			let Some(cmd) = cmd else {
				break;
			};
			self.handle(cmd).await;
			self.members.retain(|_, m| !m.outbound.is_closed());
			self.rearm_idle();
		}

		// Commands that raced retirement are dropped; their callers retry on a fresh actor.
		while self.rx.try_recv().is_ok() {}
		debug!(room_id = %self.room_id, actor_id = self.actor_id, "room actor stopped");
	}

	fn rearm_idle(&mut self) {
		if !self.members.is_empty() {
			self.idle_deadline = None;
		} else if self.idle_deadline.is_none() {
			self.idle_deadline = Some(Instant::now() + self.cfg.idle_grace);
		}
	}

	fn try_retire(&mut self) -> bool {
		let Some(arena) = self.arena.upgrade() else {
			return true;
		};
		let mut arena = arena.lock().unwrap_or_else(PoisonError::into_inner);

		self.members.retain(|_, m| !m.outbound.is_closed());
		if !self.members.is_empty() || !self.rx.is_empty() {
			self.idle_deadline = None;
			self.rearm_idle();
			return false;
		}

		if arena.rooms.get(&self.room_id).is_some_and(|h| h.actor_id == self.actor_id) {
			arena.rooms.remove(&self.room_id);
		}
		metrics::gauge!("roomcast_server_rooms_active").set(arena.rooms.len() as f64);
		self.rx.close();
		info!(room_id = %self.room_id, "room retired after idle grace");
		true
	}

	async fn handle(&mut self, cmd: RoomCommand) {
		match cmd {
			RoomCommand::Join {
				session,
				user_id,
				outbound,
				replay_after,
				reply,
			} => {
				let res = self.join(session, user_id, outbound, replay_after).await;
				let _ = reply.send(res);
			}
			RoomCommand::Leave { session, reply } => {
				let at = match self.members.remove(&session) {
					Some(_) => {
						debug!(room_id = %self.room_id, session_id = %session, members = self.members.len(), "left room");
						self.sequencer.current().await.ok()
					}
					None => None,
				};
				let _ = reply.send(at);
			}
			RoomCommand::Current { reply } => {
				let res = self
					.sequencer
					.current()
					.await
					.map_err(|e| ChatError::Internal(format!("history unavailable: {e}")));
				let _ = reply.send(res);
			}
			RoomCommand::Members { reply } => {
				let _ = reply.send(self.members.keys().copied().collect());
			}
			RoomCommand::Accept { session, content, reply } => {
				let res = self.accept(session, content).await;
				let _ = reply.send(res);
			}
		}
	}

	async fn join(
		&mut self,
		session: SessionId,
		user_id: UserId,
		outbound: mpsc::Sender<Outbound>,
		replay_after: Option<u64>,
	) -> ChatResult<JoinOutcome> {
		let current = self
			.sequencer
			.current()
			.await
			.map_err(|e| ChatError::Internal(format!("history unavailable: {e}")))?;

		if let Some(existing) = self.members.get(&session)
			&& !existing.outbound.is_closed()
		{
			return Ok(JoinOutcome {
				room_id: self.room_id.clone(),
				current_sequence: current,
				replayed: 0,
				replay_truncated: false,
				already_member: true,
			});
		}

		let mut member = Member {
			user_id,
			outbound,
			pending_lag: 0,
		};

		let (replayed, replay_truncated) = match replay_after {
			Some(after) if after < current => self.replay(&mut member, after, current).await?,
			_ => (0, false),
		};

		self.members.insert(session, member);
		debug!(
			room_id = %self.room_id,
			session_id = %session,
			members = self.members.len(),
			current,
			replayed,
			"joined room"
		);

		Ok(JoinOutcome {
			room_id: self.room_id.clone(),
			current_sequence: current,
			replayed,
			replay_truncated,
			already_member: false,
		})
	}

	/// Push stored messages in `(after, upto]` to a joining member. Runs before the member
	/// is inserted, so no live message can interleave.
	///
	/// The last free queue slot is kept for the `Lagged` marker, so a truncated replay is
	/// always followed by one.
	async fn replay(&self, member: &mut Member, after: u64, upto: u64) -> ChatResult<(usize, bool)> {
		let mut cursor = after;
		let mut sent = 0usize;

		while cursor < upto {
			let page = self
				.sequencer
				.history()
				.page(&self.room_id, cursor, self.cfg.replay_page_limit)
				.await
				.map_err(|e| ChatError::Internal(format!("history read failed: {e}")))?;

			let Some(last) = page.messages.last().map(|m| m.sequence_number) else {
				break;
			};

			for msg in page.messages {
				let seq = msg.sequence_number;
				if seq > upto {
					return Ok((sent, false));
				}
				if seq < upto && member.outbound.capacity() <= 1 {
					self.mark_lagged(member, upto - seq + 1);
					return Ok((sent, true));
				}
				let item = Outbound::Message {
					msg: Arc::new(msg),
					replayed: true,
				};
				match member.outbound.try_send(item) {
					Ok(()) => sent += 1,
					Err(mpsc::error::TrySendError::Full(_)) => {
						self.mark_lagged(member, upto - seq + 1);
						return Ok((sent, true));
					}
					Err(mpsc::error::TrySendError::Closed(_)) => return Ok((sent, false)),
				}
			}
			cursor = last;
		}

		Ok((sent, false))
	}

	fn mark_lagged(&self, member: &mut Member, dropped: u64) {
		metrics::counter!("roomcast_server_replay_truncated_total").increment(1);
		debug!(room_id = %self.room_id, dropped, "replay truncated by a full session queue");
		let marker = Outbound::Lagged {
			room_id: self.room_id.clone(),
			dropped,
		};
		member.pending_lag = match member.outbound.try_send(marker) {
			Ok(()) => 0,
			Err(_) => dropped,
		};
	}

	async fn accept(&mut self, session: SessionId, content: String) -> ChatResult<ChatMessage> {
		let Some(sender) = self.members.get(&session).map(|m| m.user_id.clone()) else {
			return Err(ChatError::NotMember(self.room_id.clone()));
		};

		let mut msg = self.sequencer.sequence(&sender, content).await?;
		let shared = Arc::new(msg.clone());
		let stats = fan_out(&self.room_id, &mut self.members, &shared);
		msg.delivery = DeliveryState::Delivered;

		debug!(
			room_id = %self.room_id,
			seq = msg.sequence_number,
			delivered = stats.delivered,
			dropped = stats.dropped,
			"message fanned out"
		);
		Ok(msg)
	}
}
