#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use roomcast_domain::{ChatMessage, DeliveryState, RoomId, SessionId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::error::{ChatError, ChatResult};
use crate::server::history::HistoryService;
use crate::server::membership::Member;
use crate::server::registry::Outbound;
use crate::util::time::unix_ms_now;

/// Per-room sequence authority. Owned by exactly one room actor.
pub struct Sequencer {
	room_id: RoomId,
	history: HistoryService,
	/// Last persisted sequence; `None` until read back from the store.
	last: Option<u64>,
}

impl Sequencer {
	pub fn new(room_id: RoomId, history: HistoryService) -> Self {
		Self {
			room_id,
			history,
			last: None,
		}
	}

	pub fn history(&self) -> &HistoryService {
		&self.history
	}

	/// Last persisted sequence, seeding from the store on first use.
	pub async fn current(&mut self) -> anyhow::Result<u64> {
		if let Some(last) = self.last {
			return Ok(last);
		}
		let last = self.history.last_sequence(&self.room_id).await?;
		debug!(room_id = %self.room_id, last, "sequencer seeded from history");
		self.last = Some(last);
		Ok(last)
	}

	/// Number, persist and return the next message. The counter only moves once the
	/// store confirms the append.
	pub async fn sequence(&mut self, sender: &UserId, content: String) -> ChatResult<ChatMessage> {
		let last = self.current().await.map_err(|e| ChatError::PersistFailed {
			room: self.room_id.clone(),
			reason: format!("history unavailable: {e}"),
		})?;

		let mut msg = ChatMessage::pending(self.room_id.clone(), sender.clone(), last + 1, content, unix_ms_now());

		match self.history.append(&msg).await {
			Ok(()) => {
				msg.delivery = DeliveryState::Persisted;
				self.last = Some(msg.sequence_number);
				metrics::counter!("roomcast_server_messages_accepted_total").increment(1);
				Ok(msg)
			}
			Err(e) => {
				msg.delivery = DeliveryState::Failed;
				// The store may have written the row before failing; re-read before the next number.
				self.last = None;
				metrics::counter!("roomcast_server_persist_failures_total").increment(1);
				warn!(
					room_id = %self.room_id,
					seq = msg.sequence_number,
					sender = %sender,
					error = %e,
					"history append failed; message not delivered"
				);
				Err(ChatError::PersistFailed {
					room: self.room_id.clone(),
					reason: e.to_string(),
				})
			}
		}
	}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
	pub delivered: usize,
	pub dropped: usize,
}

/// Push `msg` to every member without waiting on any of them.
///
/// A full queue drops the push and remembers the loss; the member gets a `Lagged`
/// marker right after its next successful push. Members whose queue is closed are pruned.
pub(crate) fn fan_out(room_id: &RoomId, members: &mut HashMap<SessionId, Member>, msg: &Arc<ChatMessage>) -> FanOut {
	let mut stats = FanOut::default();

	for member in members.values_mut() {
		let item = Outbound::Message {
			msg: Arc::clone(msg),
			replayed: false,
		};
		match member.outbound.try_send(item) {
			Ok(()) => {
				stats.delivered += 1;
				if member.pending_lag > 0
					&& member
						.outbound
						.try_send(Outbound::Lagged {
							room_id: room_id.clone(),
							dropped: member.pending_lag,
						})
						.is_ok()
				{
					member.pending_lag = 0;
				}
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				stats.dropped += 1;
				member.pending_lag = member.pending_lag.saturating_add(1);
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	members.retain(|_, m| !m.outbound.is_closed());

	if stats.dropped > 0 {
		metrics::counter!("roomcast_server_fanout_dropped_total").increment(stats.dropped as u64);
		debug!(
			room_id = %room_id,
			seq = msg.sequence_number,
			dropped = stats.dropped,
			"fan-out dropped for full member queues"
		);
	}

	stats
}
