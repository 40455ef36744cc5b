#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;
pub mod pb;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, decode_frame, encode_frame};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1), written into `pb::Envelope.version`.
	pub const PROTOCOL_VERSION: u32 = 1;

	/// ALPN identifier negotiated by server and client.
	pub const ALPN: &[u8] = b"roomcast-v1";
}
