#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use roomcast_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, encode_frame};
use roomcast_protocol::pb;
use roomcast_protocol::version::{ALPN, PROTOCOL_VERSION};
use roomcast_util::endpoint::{DEFAULT_ENDPOINT, QuicEndpoint};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal). Also used as the TLS server name.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	pub client_name: String,

	/// Bearer token presented in `Hello`.
	pub auth_token: Option<String>,

	/// Session id from a previous connection to resume within the server's grace window.
	pub resume_session_id: Option<String>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint).map_err(|e| ClientCoreError::Protocol(format!("invalid endpoint: {e}")))?;
		Ok(Self {
			server_addr: e.socket_addr().ok(),
			server_host: e.server_name().to_string(),
			server_port: e.port,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		let local = QuicEndpoint::parse(DEFAULT_ENDPOINT).ok();
		Self {
			server_host: local
				.as_ref()
				.map(|e| e.server_name().to_string())
				.unwrap_or_else(|| "127.0.0.1".to_string()),
			server_port: local.as_ref().map(|e| e.port).unwrap_or(18303),
			server_addr: local.and_then(|e| e.socket_addr().ok()),
			client_name: format!("roomcast-client/{}", env!("CARGO_PKG_VERSION")),
			auth_token: None,
			resume_session_id: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered with a non-OK status.
	#[error("server rejected request: {} ({detail})", .status.as_str_name())]
	Rejected { status: pb::Status, detail: String },

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

fn check_status(status: pb::Status, detail: &str) -> Result<(), ClientCoreError> {
	if status == pb::Status::Ok {
		return Ok(());
	}
	Err(ClientCoreError::Rejected {
		status,
		detail: detail.to_string(),
	})
}

/// Control half of a session: join, leave, send, history, ack, ping, close.
pub struct SessionControl {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	control_recv: quinn::RecvStream,
	decoder: FrameDecoder,
	max_frame_bytes: usize,
	next_request_id: u64,
	events_opened: bool,
}

/// Events reader half of a session.
pub struct SessionEvents {
	events_recv: quinn::RecvStream,
	// Keep the send half alive so the peer doesn't see an immediate FIN.
	_events_send_keepalive: quinn::SendStream,
	decoder: FrameDecoder,
}

impl SessionControl {
	/// Connect, send `Hello` and wait for `Welcome`.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, pb::Welcome), ClientCoreError> {
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let endpoint =
				make_client_endpoint(server_addr).map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (control_send, control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let mut control = Self {
			conn,
			control_send,
			control_recv,
			decoder: FrameDecoder::new(cfg.max_frame_bytes),
			max_frame_bytes: cfg.max_frame_bytes,
			next_request_id: 0,
			events_opened: false,
		};

		let hello = pb::Hello {
			client_name: cfg.client_name,
			auth_token: cfg.auth_token.unwrap_or_default(),
			resume_session_id: cfg.resume_session_id.unwrap_or_default(),
		};
		control
			.write(String::new(), pb::envelope::Msg::Hello(hello))
			.await
			.map_err(|e| ClientCoreError::Io(format!("send Hello failed: {e}")))?;

		let welcome_env = tokio::time::timeout(connect_timeout, control.read_envelope())
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match welcome_env.msg {
			Some(pb::envelope::Msg::Welcome(w)) => w,
			Some(pb::envelope::Msg::Error(e)) => {
				return Err(ClientCoreError::Rejected {
					status: e.code(),
					detail: e.message,
				});
			}
			other => {
				return Err(ClientCoreError::Protocol(format!("expected Welcome, got {other:?}")));
			}
		};

		debug!(
			server_name = %welcome.server_name,
			session_id = %welcome.session_id,
			user_id = %welcome.user_id,
			resumed = welcome.resumed,
			heartbeat_interval_ms = welcome.heartbeat_interval_ms,
			"received Welcome"
		);

		if welcome.max_frame_bytes > 0 {
			control.max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes);
		}

		Ok((control, welcome))
	}

	/// Join a room. A non-zero `last_acked_sequence` asks for replay of everything after it.
	pub async fn join_room(&mut self, room_id: &str, last_acked_sequence: u64) -> Result<pb::JoinAck, ClientCoreError> {
		let msg = pb::envelope::Msg::JoinRoom(pb::JoinRoom {
			room_id: room_id.to_string(),
			last_acked_sequence,
		});
		match self.request(msg).await? {
			pb::envelope::Msg::JoinAck(ack) => {
				check_status(ack.status(), &ack.detail)?;
				debug!(room_id = %ack.room_id, current = ack.current_sequence, replayed = ack.replayed, "joined");
				Ok(ack)
			}
			other => Err(ClientCoreError::Protocol(format!("expected JoinAck, got {other:?}"))),
		}
	}

	pub async fn leave_room(&mut self, room_id: &str) -> Result<pb::LeaveAck, ClientCoreError> {
		let msg = pb::envelope::Msg::LeaveRoom(pb::LeaveRoom {
			room_id: room_id.to_string(),
		});
		match self.request(msg).await? {
			pb::envelope::Msg::LeaveAck(ack) => {
				check_status(ack.status(), "")?;
				Ok(ack)
			}
			other => Err(ClientCoreError::Protocol(format!("expected LeaveAck, got {other:?}"))),
		}
	}

	/// Submit a message. The sender sees its own copy on the events stream as well.
	pub async fn send_chat(&mut self, room_id: &str, content: &str) -> Result<pb::SendChatResult, ClientCoreError> {
		let msg = pb::envelope::Msg::SendChat(pb::SendChat {
			room_id: room_id.to_string(),
			content: content.to_string(),
		});
		match self.request(msg).await? {
			pb::envelope::Msg::SendChatResult(res) => {
				check_status(res.status(), &res.detail)?;
				Ok(res)
			}
			other => Err(ClientCoreError::Protocol(format!("expected SendChatResult, got {other:?}"))),
		}
	}

	/// Read stored messages after `since_sequence`. A page that skips numbers comes back
	/// with `has_gap` set rather than as an error.
	pub async fn get_history(
		&mut self,
		room_id: &str,
		since_sequence: u64,
		limit: u32,
	) -> Result<pb::History, ClientCoreError> {
		let msg = pb::envelope::Msg::GetHistory(pb::GetHistory {
			room_id: room_id.to_string(),
			since_sequence,
			limit,
		});
		match self.request(msg).await? {
			pb::envelope::Msg::History(h) => {
				if h.status() != pb::Status::HistoryGap {
					check_status(h.status(), &h.detail)?;
				}
				Ok(h)
			}
			other => Err(ClientCoreError::Protocol(format!("expected History, got {other:?}"))),
		}
	}

	/// Advance the server-side ack cursor. The server sends no reply.
	pub async fn ack(&mut self, room_id: &str, sequence_number: u64) -> Result<(), ClientCoreError> {
		let msg = pb::envelope::Msg::Ack(pb::Ack {
			room_id: room_id.to_string(),
			sequence_number,
		});
		let request_id = self.next_request_id();
		self.write(request_id, msg).await
	}

	/// Send a keepalive ping and await the pong response.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientCoreError> {
		match self.request(pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms })).await? {
			pb::envelope::Msg::Pong(p) => Ok(p),
			other => Err(ClientCoreError::Protocol(format!("expected Pong, got {other:?}"))),
		}
	}

	/// Open the events stream. Room messages and lag markers arrive only here.
	pub async fn open_events_stream(&mut self) -> Result<SessionEvents, ClientCoreError> {
		if self.events_opened {
			return Err(ClientCoreError::Protocol(
				"events stream already opened; reuse the existing SessionEvents".to_string(),
			));
		}

		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientCoreError::Io(format!("open_bi(events) failed: {e}")))?;

		// Force a STREAM frame so the server observes the stream promptly.
		send.write_all(&[0u8])
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to write events stream activation byte: {e}")))?;
		send.flush()
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to flush events stream activation byte: {e}")))?;
		debug!("events stream opened");

		self.events_opened = true;

		Ok(SessionEvents {
			events_recv: recv,
			_events_send_keepalive: send,
			decoder: FrameDecoder::new(self.max_frame_bytes),
		})
	}

	pub fn close(&mut self, code: u32, reason: &str) {
		let _ = self.control_send.finish();
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	/// Resolves once the connection is closed, by either side.
	pub async fn closed(&self) -> quinn::ConnectionError {
		self.conn.closed().await
	}

	fn next_request_id(&mut self) -> String {
		self.next_request_id += 1;
		format!("c{}", self.next_request_id)
	}

	async fn request(&mut self, msg: pb::envelope::Msg) -> Result<pb::envelope::Msg, ClientCoreError> {
		let request_id = self.next_request_id();
		self.write(request_id.clone(), msg).await?;

		loop {
			let env = self.read_envelope().await?;
			let Some(msg) = env.msg else { continue };

			if env.request_id == request_id {
				if let pb::envelope::Msg::Error(e) = msg {
					return Err(ClientCoreError::Rejected {
						status: e.code(),
						detail: e.message,
					});
				}
				return Ok(msg);
			}

			match msg {
				pb::envelope::Msg::Error(e) => {
					return Err(ClientCoreError::Rejected {
						status: e.code(),
						detail: e.message,
					});
				}
				other => warn!(request_id = %env.request_id, "skipping unmatched control reply: {:?}", other),
			}
		}
	}

	async fn write(&mut self, request_id: String, msg: pb::envelope::Msg) -> Result<(), ClientCoreError> {
		let env = pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id,
			msg: Some(msg),
		};
		let frame = encode_frame(&env, self.max_frame_bytes)?;
		self.control_send
			.write_all(&frame)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		self.control_send
			.flush()
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	async fn read_envelope(&mut self) -> Result<pb::Envelope, ClientCoreError> {
		let mut tmp = [0u8; 8192];
		loop {
			if let Some(env) = self.decoder.next_frame::<pb::Envelope>()? {
				return Ok(env);
			}

			match self.control_recv.read(&mut tmp).await {
				Ok(Some(n)) => self.decoder.extend(&tmp[..n]),
				Ok(None) => {
					return Err(ClientCoreError::Protocol(
						"stream closed before receiving full message".to_string(),
					));
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			}
		}
	}
}

impl SessionEvents {
	/// Run the events loop until EOF or error.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(pb::EventEnvelope),
	{
		loop {
			if let Some(ev) = self.next_event().await? {
				on_event(ev);
			} else {
				info!("events stream closed");
				return Ok(());
			}
		}
	}

	/// Next event, or `None` once the server finishes the stream.
	pub async fn next_event(&mut self) -> Result<Option<pb::EventEnvelope>, ClientCoreError> {
		let mut tmp = [0u8; 8192];
		loop {
			if let Some(ev) = self.decoder.next_frame::<pb::EventEnvelope>()? {
				debug!(room_id = %ev.room_id, event_kind = %event_kind(&ev), "events stream decoded");
				return Ok(Some(ev));
			}

			match self.events_recv.read(&mut tmp).await {
				Ok(Some(n)) => self.decoder.extend(&tmp[..n]),
				Ok(None) => return Ok(None),
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			}
		}
	}
}

fn event_kind(ev: &pb::EventEnvelope) -> &'static str {
	match ev.event.as_ref() {
		Some(pb::event_envelope::Event::NewMessage(_)) => "new_message",
		Some(pb::event_envelope::Event::Lagged(_)) => "lagged",
		None => "empty",
	}
}

fn make_client_endpoint(server_addr: SocketAddr) -> anyhow::Result<Endpoint> {
	let bind: SocketAddr = if server_addr.is_ipv6() {
		(std::net::Ipv6Addr::UNSPECIFIED, 0).into()
	} else {
		(std::net::Ipv4Addr::UNSPECIFIED, 0).into()
	};
	Endpoint::client(bind).context("create client endpoint")
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	// Control + events.
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(4));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}
