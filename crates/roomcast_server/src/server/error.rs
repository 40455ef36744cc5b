#![forbid(unsafe_code)]

use roomcast_domain::{RoomId, SessionId};
use roomcast_protocol::pb;
use thiserror::Error;

/// Failures a client can be told about.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("user may not access room {0}")]
	Forbidden(RoomId),

	#[error("not a member of room {0}")]
	NotMember(RoomId),

	#[error("history append failed for room {room}: {reason}")]
	PersistFailed { room: RoomId, reason: String },

	#[error("session {0} not found")]
	SessionNotFound(SessionId),

	#[error("invalid message: {0}")]
	InvalidMessage(String),

	#[error("send rate limit exceeded")]
	RateLimited,

	#[error("internal error: {0}")]
	Internal(String),
}

impl ChatError {
	pub fn code(&self) -> pb::Status {
		match self {
			ChatError::Unauthorized(_) => pb::Status::Unauthorized,
			ChatError::Forbidden(_) => pb::Status::Forbidden,
			ChatError::NotMember(_) => pb::Status::NotMember,
			ChatError::PersistFailed { .. } => pb::Status::PersistFailed,
			ChatError::SessionNotFound(_) => pb::Status::NotFound,
			ChatError::InvalidMessage(_) => pb::Status::InvalidMessage,
			ChatError::RateLimited => pb::Status::RateLimited,
			ChatError::Internal(_) => pb::Status::Internal,
		}
	}
}

pub type ChatResult<T> = Result<T, ChatError>;
