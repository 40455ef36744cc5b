#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted length of a room identifier, in bytes.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long: {len} > {max}")]
	TooLong { len: usize, max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Chat room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId` without control characters.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() > MAX_ROOM_ID_LEN {
			return Err(ParseIdError::TooLong {
				len: trimmed.len(),
				max: MAX_ROOM_ID_LEN,
			});
		}
		if trimmed.chars().any(char::is_control) {
			return Err(ParseIdError::InvalidFormat("room id contains control characters".into()));
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Authenticated user identifier (the token subject).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Opaque per-connection session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	/// Create a new random session id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Where a message is in its delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
	/// Sequenced, waiting on the history store.
	Pending,
	/// The history store confirmed the append.
	Persisted,
	/// Persisted and handed to every member's outbound queue.
	Delivered,
	/// The append failed; never fanned out.
	Failed,
}

impl DeliveryState {
	pub const fn as_str(self) -> &'static str {
		match self {
			DeliveryState::Pending => "pending",
			DeliveryState::Persisted => "persisted",
			DeliveryState::Delivered => "delivered",
			DeliveryState::Failed => "failed",
		}
	}

	/// True once the history store has confirmed durability.
	pub const fn is_persisted(self) -> bool {
		matches!(self, DeliveryState::Persisted | DeliveryState::Delivered)
	}
}

impl fmt::Display for DeliveryState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A chat message sequenced within one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub room_id: RoomId,
	pub sender_id: UserId,
	/// Unique and strictly increasing within `room_id`, starting at 1.
	pub sequence_number: u64,
	pub content: String,
	pub created_at_unix_ms: i64,
	pub delivery: DeliveryState,
}

impl ChatMessage {
	/// A freshly sequenced message, not yet persisted.
	pub fn pending(
		room_id: RoomId,
		sender_id: UserId,
		sequence_number: u64,
		content: impl Into<String>,
		created_at_unix_ms: i64,
	) -> Self {
		Self {
			room_id,
			sender_id,
			sequence_number,
			content: content.into(),
			created_at_unix_ms,
			delivery: DeliveryState::Pending,
		}
	}

	pub fn is_persisted(&self) -> bool {
		self.delivery.is_persisted()
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
