#![forbid(unsafe_code)]

use bytes::{Buf, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData { need: usize, have: usize },

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(LEN_PREFIX + payload_len);
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

/// Decode a single frame from the start of `src`, returning the bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let Some(len) = peek_len(src, max_frame_size)? else {
		return Err(FramingError::InsufficientData {
			need: LEN_PREFIX,
			have: src.len(),
		});
	};

	let need = LEN_PREFIX + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[LEN_PREFIX..need])?;
	Ok((msg, need))
}

fn peek_len(src: &[u8], max_frame_size: usize) -> Result<Option<usize>, FramingError> {
	if src.len() < LEN_PREFIX {
		return Ok(None);
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(Some(len))
}

/// Incremental decoder for a byte stream carrying back-to-back frames.
///
/// Feed whatever the transport hands over with [`FrameDecoder::extend`], then
/// drain complete messages with [`FrameDecoder::next_frame`] until it yields `None`.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_size,
		}
	}

	pub fn extend(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Number of buffered bytes not yet consumed by a complete frame.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		let Some(len) = peek_len(&self.buf, self.max_frame_size)? else {
			return Ok(None);
		};

		if self.buf.len() < LEN_PREFIX + len {
			return Ok(None);
		}

		self.buf.advance(LEN_PREFIX);
		let payload = self.buf.split_to(len);
		let msg = M::decode(payload.freeze())?;
		Ok(Some(msg))
	}
}

impl Default for FrameDecoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_FRAME_SIZE)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct TestMsg {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint64, tag = "2")]
		n: u64,
	}

	#[test]
	fn decode_requires_full_frame() {
		let msg = TestMsg { s: "x".repeat(10), n: 7 };
		let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let err = decode_frame::<TestMsg>(&frame[..4], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => assert!(need > have),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decoder_yields_frames_split_across_reads() {
		let a = TestMsg { s: "hi".into(), n: 1 };
		let b = TestMsg { s: "there".into(), n: 2 };
		let mut bytes = encode_frame(&a, DEFAULT_MAX_FRAME_SIZE).expect("encode a");
		bytes.extend(encode_frame(&b, DEFAULT_MAX_FRAME_SIZE).expect("encode b"));

		let mut dec = FrameDecoder::default();
		dec.extend(&bytes[..3]);
		assert!(dec.next_frame::<TestMsg>().expect("ok").is_none());

		dec.extend(&bytes[3..]);
		assert_eq!(dec.next_frame::<TestMsg>().expect("ok"), Some(a));
		assert_eq!(dec.next_frame::<TestMsg>().expect("ok"), Some(b));
		assert!(dec.next_frame::<TestMsg>().expect("ok").is_none());
		assert_eq!(dec.buffered(), 0);
	}

	#[test]
	fn decoder_rejects_oversized_prefix() {
		let mut dec = FrameDecoder::new(16);
		dec.extend(&17u32.to_be_bytes());
		assert!(matches!(
			dec.next_frame::<TestMsg>(),
			Err(FramingError::FrameTooLarge { len: 17, max: 16 })
		));
	}
}
