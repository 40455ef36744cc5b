#![forbid(unsafe_code)]

use roomcast_domain::{ChatMessage, DeliveryState, ParseIdError, RoomId, UserId};

use crate::pb;

/// Build the wire form of a sequenced message.
pub fn message_to_pb(msg: &ChatMessage, replayed: bool) -> pb::ChatMessage {
	pb::ChatMessage {
		room_id: msg.room_id.as_str().to_string(),
		sender_id: msg.sender_id.as_str().to_string(),
		sequence_number: msg.sequence_number,
		content: msg.content.clone(),
		created_at_unix_ms: msg.created_at_unix_ms,
		persisted: msg.is_persisted(),
		replayed,
	}
}

/// Parse a wire message back into the domain type.
///
/// The wire form only carries the persisted flag, so the delivery state comes
/// back as `Persisted` or `Pending`.
pub fn message_from_pb(msg: &pb::ChatMessage) -> Result<ChatMessage, ParseIdError> {
	Ok(ChatMessage {
		room_id: RoomId::new(msg.room_id.clone())?,
		sender_id: UserId::new(msg.sender_id.clone())?,
		sequence_number: msg.sequence_number,
		content: msg.content.clone(),
		created_at_unix_ms: msg.created_at_unix_ms,
		delivery: if msg.persisted {
			DeliveryState::Persisted
		} else {
			DeliveryState::Pending
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delivered_message_is_sent_as_persisted() {
		let mut msg = ChatMessage::pending(
			RoomId::new("r1").unwrap(),
			UserId::new("alice").unwrap(),
			3,
			"hi",
			1_700_000_000_000,
		);
		msg.delivery = DeliveryState::Delivered;

		let wire = message_to_pb(&msg, true);
		assert!(wire.persisted);
		assert!(wire.replayed);

		let back = message_from_pb(&wire).unwrap();
		assert_eq!(back.delivery, DeliveryState::Persisted);
		assert_eq!(back.sequence_number, 3);
	}

	#[test]
	fn rejects_empty_room() {
		let wire = pb::ChatMessage {
			sender_id: "alice".into(),
			..Default::default()
		};
		assert_eq!(message_from_pb(&wire).unwrap_err(), ParseIdError::Empty);
	}
}
