//! Wire messages for `roomcast.v1`.
//!
//! Every frame on the control stream carries one [`Envelope`]; every frame on the
//! events stream carries one [`EventEnvelope`].

#![forbid(unsafe_code)]
#![allow(clippy::large_enum_variant)]

/// Outcome code shared by acks, results and `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
	Unspecified = 0,
	Ok = 1,
	Unauthorized = 2,
	Forbidden = 3,
	NotMember = 4,
	PersistFailed = 5,
	NotFound = 6,
	InvalidMessage = 7,
	RateLimited = 8,
	Internal = 9,
	HistoryGap = 10,
}

impl Status {
	pub fn as_str_name(&self) -> &'static str {
		match self {
			Status::Unspecified => "STATUS_UNSPECIFIED",
			Status::Ok => "OK",
			Status::Unauthorized => "UNAUTHORIZED",
			Status::Forbidden => "FORBIDDEN",
			Status::NotMember => "NOT_MEMBER",
			Status::PersistFailed => "PERSIST_FAILED",
			Status::NotFound => "NOT_FOUND",
			Status::InvalidMessage => "INVALID_MESSAGE",
			Status::RateLimited => "RATE_LIMITED",
			Status::Internal => "INTERNAL",
			Status::HistoryGap => "HISTORY_GAP",
		}
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Echoed by the server on the matching response.
	#[prost(string, tag = "2")]
	pub request_id: ::prost::alloc::string::String,
	#[prost(oneof = "envelope::Msg", tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23")]
	pub msg: ::core::option::Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Error(super::Error),
		#[prost(message, tag = "13")]
		Ping(super::Ping),
		#[prost(message, tag = "14")]
		Pong(super::Pong),
		#[prost(message, tag = "15")]
		JoinRoom(super::JoinRoom),
		#[prost(message, tag = "16")]
		JoinAck(super::JoinAck),
		#[prost(message, tag = "17")]
		LeaveRoom(super::LeaveRoom),
		#[prost(message, tag = "18")]
		LeaveAck(super::LeaveAck),
		#[prost(message, tag = "19")]
		SendChat(super::SendChat),
		#[prost(message, tag = "20")]
		SendChatResult(super::SendChatResult),
		#[prost(message, tag = "21")]
		GetHistory(super::GetHistory),
		#[prost(message, tag = "22")]
		History(super::History),
		#[prost(message, tag = "23")]
		Ack(super::Ack),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub auth_token: ::prost::alloc::string::String,
	/// Session id from a previous connection; empty for a fresh session.
	#[prost(string, tag = "3")]
	pub resume_session_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub session_id: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub user_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "4")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "5")]
	pub max_frame_bytes: u32,
	#[prost(uint64, tag = "6")]
	pub heartbeat_interval_ms: u64,
	#[prost(bool, tag = "7")]
	pub resumed: bool,
	#[prost(string, tag = "8")]
	pub resumed_room_id: ::prost::alloc::string::String,
	/// First sequence number replayed on the events stream after a resume.
	#[prost(uint64, tag = "9")]
	pub resumed_from_sequence: u64,
	/// Replay stopped early and a `Lagged` event follows it; backfill with `GetHistory`.
	#[prost(bool, tag = "10")]
	pub resumed_replay_truncated: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(enumeration = "Status", tag = "1")]
	pub code: i32,
	#[prost(string, tag = "2")]
	pub message: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub room_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinRoom {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	/// Replay messages after this sequence before live delivery. Zero skips replay.
	#[prost(uint64, tag = "2")]
	pub last_acked_sequence: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinAck {
	#[prost(enumeration = "Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "3")]
	pub current_sequence: u64,
	#[prost(uint32, tag = "4")]
	pub replayed: u32,
	#[prost(string, tag = "5")]
	pub detail: ::prost::alloc::string::String,
	#[prost(bool, tag = "6")]
	pub replay_truncated: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaveRoom {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaveAck {
	#[prost(enumeration = "Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub room_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendChat {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub content: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendChatResult {
	#[prost(enumeration = "Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "3")]
	pub sequence_number: u64,
	#[prost(bool, tag = "4")]
	pub persisted: bool,
	#[prost(string, tag = "5")]
	pub detail: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHistory {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	/// Return messages with a sequence number strictly greater than this.
	#[prost(uint64, tag = "2")]
	pub since_sequence: u64,
	/// Zero means the server's page limit.
	#[prost(uint32, tag = "3")]
	pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct History {
	#[prost(enumeration = "Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(message, repeated, tag = "3")]
	pub messages: ::prost::alloc::vec::Vec<ChatMessage>,
	#[prost(bool, tag = "4")]
	pub has_gap: bool,
	#[prost(string, tag = "5")]
	pub detail: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "2")]
	pub sequence_number: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub sender_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "3")]
	pub sequence_number: u64,
	#[prost(string, tag = "4")]
	pub content: ::prost::alloc::string::String,
	#[prost(int64, tag = "5")]
	pub created_at_unix_ms: i64,
	#[prost(bool, tag = "6")]
	pub persisted: bool,
	/// Delivered from history rather than live fan-out.
	#[prost(bool, tag = "7")]
	pub replayed: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Lagged {
	#[prost(uint64, tag = "1")]
	pub dropped: u64,
	#[prost(string, tag = "2")]
	pub detail: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventEnvelope {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
	#[prost(oneof = "event_envelope::Event", tags = "10, 11")]
	pub event: ::core::option::Option<event_envelope::Event>,
}

pub mod event_envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "10")]
		NewMessage(super::ChatMessage),
		#[prost(message, tag = "11")]
		Lagged(super::Lagged),
	}
}
