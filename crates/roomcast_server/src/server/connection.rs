#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use roomcast_domain::{RoomId, SessionId};
use roomcast_protocol::convert::message_to_pb;
use roomcast_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, encode_frame};
use roomcast_protocol::pb;
use roomcast_protocol::version::PROTOCOL_VERSION;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::error::ChatError;
use crate::server::lifecycle::{DisconnectReason, SessionManager};
use crate::server::registry::Outbound;
use crate::util::time::unix_ms_now;

/// Application close codes sent with `CONNECTION_CLOSE`.
pub mod close_code {
	pub const NORMAL: u32 = 0;
	pub const UNAUTHORIZED: u32 = 1;
	pub const HEARTBEAT_TIMEOUT: u32 = 2;
	pub const SHUTDOWN: u32 = 3;
}

fn envelope(request_id: String, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id,
		msg: Some(msg),
	}
}

fn error_envelope(request_id: String, err: &ChatError, room_id: &str) -> pb::Envelope {
	envelope(
		request_id,
		pb::envelope::Msg::Error(pb::Error {
			code: err.code() as i32,
			message: err.to_string(),
			room_id: room_id.to_string(),
		}),
	)
}

fn parse_room(raw: &str) -> Result<RoomId, ChatError> {
	RoomId::new(raw).map_err(|e| ChatError::InvalidMessage(format!("room id: {e}")))
}

pub async fn handle_connection(conn_id: u64, connection: quinn::Connection, manager: Arc<SessionManager>) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("roomcast_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("roomcast_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	if manager.is_shutting_down() {
		connection.close(close_code::SHUTDOWN.into(), b"server shutting down");
		return Ok(());
	}

	let heartbeat_timeout = manager.config().heartbeat_timeout;
	let mut shutdown = manager.subscribe_shutdown();

	let (mut control_send, mut control_recv) = tokio::time::timeout(heartbeat_timeout, connection.accept_bi())
		.await
		.map_err(|_| anyhow!("no control stream within {heartbeat_timeout:?}"))?
		.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("roomcast_server_control_bytes_in_total").increment(n as u64);
			decoder.extend(&tmp[..n]);

			loop {
				match decoder.next_frame::<pb::Envelope>() {
					Ok(Some(env)) => {
						metrics::counter!("roomcast_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("roomcast_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	debug!(conn_id, state = "connecting", "awaiting Hello");
	let hello = match tokio::time::timeout(heartbeat_timeout, wait_for_hello(&mut ctrl_rx)).await {
		Ok(res) => res?,
		Err(_) => {
			warn!(conn_id, "no Hello within heartbeat timeout");
			connection.close(close_code::HEARTBEAT_TIMEOUT.into(), b"hello timeout");
			reader_task.abort();
			return Ok(());
		}
	};
	metrics::counter!("roomcast_server_hello_total").increment(1);
	info!(conn_id, client_name = %hello.client_name, "received Hello");

	let user_id = match manager.authenticate(&hello.auth_token) {
		Ok(u) => u,
		Err(e) => {
			warn!(conn_id, error = %e, "unauthorized: missing/invalid auth token");
			send_envelope(&mut control_send, error_envelope(String::new(), &e, ""))
				.await
				.ok();
			let _ = control_send.finish();
			// CONNECTION_CLOSE discards unacknowledged stream data.
			let _ = tokio::time::timeout(Duration::from_secs(1), control_send.stopped()).await;
			connection.close(close_code::UNAUTHORIZED.into(), b"unauthorized");
			reader_task.abort();
			return Ok(());
		}
	};

	let resume = match hello.resume_session_id.trim() {
		"" => None,
		raw => match SessionId::from_str(raw) {
			Ok(id) => Some(id),
			Err(e) => {
				debug!(conn_id, error = %e, "ignoring malformed resume session id");
				None
			}
		},
	};

	let opened = manager.open_session(user_id.clone(), resume).await;
	let session_id = opened.session_id;

	let (resumed_room_id, resumed_from_sequence, resumed_replay_truncated) = match opened.resumed.as_ref() {
		Some(r) => (r.room_id.as_str().to_string(), r.from_sequence, r.join.replay_truncated),
		None => (String::new(), 0, false),
	};
	let welcome = pb::Welcome {
		server_name: format!("{}/{}", manager.config().server_name, env!("CARGO_PKG_VERSION")),
		session_id: session_id.to_string(),
		user_id: user_id.as_str().to_string(),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
		heartbeat_interval_ms: (heartbeat_timeout / 3).as_millis() as u64,
		resumed: opened.resumed.is_some(),
		resumed_room_id,
		resumed_from_sequence,
		resumed_replay_truncated,
	};

	if let Err(e) = send_envelope(&mut control_send, envelope(String::new(), pb::envelope::Msg::Welcome(welcome))).await {
		manager.disconnect(session_id, DisconnectReason::Closed).await;
		reader_task.abort();
		return Err(e.context("send Welcome"));
	}

	let events_task = tokio::spawn(run_events_writer(
		conn_id,
		connection.clone(),
		opened.outbound,
		manager.subscribe_shutdown(),
	));

	let reason = loop {
		let env = tokio::select! {
			res = tokio::time::timeout(heartbeat_timeout, ctrl_rx.recv()) => match res {
				Ok(Some(env)) => env,
				Ok(None) => break DisconnectReason::Closed,
				Err(_) => break DisconnectReason::Timeout,
			},
			_ = shutdown.changed() => break DisconnectReason::Shutdown,
		};

		let request_id = env.request_id;
		let Some(msg) = env.msg else { continue };

		let reply = match msg {
			pb::envelope::Msg::Ping(ping) => Some(envelope(
				request_id,
				pb::envelope::Msg::Pong(pb::Pong {
					client_time_unix_ms: ping.client_time_unix_ms,
					server_time_unix_ms: unix_ms_now(),
				}),
			)),
			pb::envelope::Msg::JoinRoom(join) => Some(handle_join(&manager, session_id, request_id, join).await),
			pb::envelope::Msg::LeaveRoom(leave) => Some(handle_leave(&manager, session_id, request_id, leave).await),
			pb::envelope::Msg::SendChat(send) => Some(handle_send(&manager, session_id, request_id, send).await),
			pb::envelope::Msg::GetHistory(req) => Some(handle_history(&manager, session_id, request_id, req).await),
			pb::envelope::Msg::Ack(ack) => {
				match parse_room(&ack.room_id) {
					Ok(room) => {
						if let Err(e) = manager.ack(session_id, &room, ack.sequence_number).await {
							debug!(conn_id, error = %e, "ack ignored");
						}
					}
					Err(e) => debug!(conn_id, error = %e, "ack ignored"),
				}
				None
			}
			pb::envelope::Msg::Hello(_) => {
				debug!(conn_id, "ignoring duplicate Hello");
				None
			}
			other => {
				warn!(conn_id, "unhandled control message: {:?}", other);
				Some(error_envelope(
					request_id,
					&ChatError::InvalidMessage("unexpected message type".to_string()),
					"",
				))
			}
		};

		if let Some(reply) = reply
			&& let Err(e) = send_envelope(&mut control_send, reply).await
		{
			debug!(conn_id, error = %e, "control stream write failed");
			break DisconnectReason::Closed;
		}
	};

	manager.disconnect(session_id, reason).await;

	match reason {
		DisconnectReason::Closed => connection.close(close_code::NORMAL.into(), b"bye"),
		DisconnectReason::Timeout => {
			info!(conn_id, session_id = %session_id, "heartbeat timeout");
			connection.close(close_code::HEARTBEAT_TIMEOUT.into(), b"heartbeat timeout");
		}
		DisconnectReason::Shutdown => connection.close(close_code::SHUTDOWN.into(), b"server shutting down"),
	}

	reader_task.abort();
	events_task.abort();
	let _ = reader_task.await;
	let _ = events_task.await;
	Ok(())
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Hello(h) = msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

/// Accept the client-opened events stream, then drain the session's outbound queue into it.
/// Pushes queued before the stream opens (resume replay included) are delivered first.
async fn run_events_writer(
	conn_id: u64,
	connection: quinn::Connection,
	mut outbound: mpsc::Receiver<Outbound>,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let (mut events_send, _events_recv) = tokio::select! {
		res = connection.accept_bi() => res.context("accept events bidirectional stream")?,
		_ = shutdown.changed() => return Ok(()),
	};
	info!(conn_id, "accepted events bidirectional stream (server will only write)");

	while let Some(item) = outbound.recv().await {
		let ev = match item {
			Outbound::Message { msg, replayed } => pb::EventEnvelope {
				room_id: msg.room_id.as_str().to_string(),
				server_time_unix_ms: unix_ms_now(),
				event: Some(pb::event_envelope::Event::NewMessage(message_to_pb(&msg, replayed))),
			},
			Outbound::Lagged { room_id, dropped } => pb::EventEnvelope {
				room_id: room_id.as_str().to_string(),
				server_time_unix_ms: unix_ms_now(),
				event: Some(pb::event_envelope::Event::Lagged(pb::Lagged {
					dropped,
					detail: "session queue full; backfill with GetHistory".to_string(),
				})),
			},
		};

		let frame = encode_frame(&ev, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
		events_send
			.write_all(&frame)
			.await
			.map_err(|e| anyhow!(e).context("events stream write failed"))?;
		metrics::counter!("roomcast_server_events_out_total").increment(1);
	}

	let _ = events_send.finish();
	Ok(())
}

async fn handle_join(manager: &SessionManager, session_id: SessionId, request_id: String, join: pb::JoinRoom) -> pb::Envelope {
	let mut ack = pb::JoinAck {
		room_id: join.room_id.clone(),
		..Default::default()
	};

	let res = match parse_room(&join.room_id) {
		Ok(room) => {
			let replay_after = (join.last_acked_sequence > 0).then_some(join.last_acked_sequence);
			manager.join_room(session_id, room, replay_after).await
		}
		Err(e) => Err(e),
	};

	match res {
		Ok(outcome) => {
			ack.set_status(pb::Status::Ok);
			ack.current_sequence = outcome.current_sequence;
			ack.replayed = outcome.replayed as u32;
			ack.replay_truncated = outcome.replay_truncated;
			if outcome.replay_truncated {
				ack.detail = "replay truncated; backfill with GetHistory".to_string();
			} else if outcome.already_member {
				ack.detail = "already a member".to_string();
			}
		}
		Err(e) => {
			ack.set_status(e.code());
			ack.detail = e.to_string();
		}
	}

	envelope(request_id, pb::envelope::Msg::JoinAck(ack))
}

async fn handle_leave(
	manager: &SessionManager,
	session_id: SessionId,
	request_id: String,
	leave: pb::LeaveRoom,
) -> pb::Envelope {
	let res = match parse_room(&leave.room_id) {
		Ok(room) => manager.leave_room(session_id, &room).await,
		Err(e) => Err(e),
	};

	let mut ack = pb::LeaveAck {
		room_id: leave.room_id,
		..Default::default()
	};
	ack.set_status(match res {
		Ok(()) => pb::Status::Ok,
		Err(e) => e.code(),
	});
	envelope(request_id, pb::envelope::Msg::LeaveAck(ack))
}

async fn handle_send(manager: &SessionManager, session_id: SessionId, request_id: String, send: pb::SendChat) -> pb::Envelope {
	metrics::counter!("roomcast_server_send_requests_total").increment(1);

	let res = match parse_room(&send.room_id) {
		Ok(room) => manager.send_chat(session_id, &room, send.content).await,
		Err(e) => Err(e),
	};

	let mut result = pb::SendChatResult {
		room_id: send.room_id,
		..Default::default()
	};
	match res {
		Ok(msg) => {
			result.set_status(pb::Status::Ok);
			result.sequence_number = msg.sequence_number;
			result.persisted = msg.is_persisted();
		}
		Err(e) => {
			result.set_status(e.code());
			result.detail = e.to_string();
		}
	}
	envelope(request_id, pb::envelope::Msg::SendChatResult(result))
}

async fn handle_history(
	manager: &SessionManager,
	session_id: SessionId,
	request_id: String,
	req: pb::GetHistory,
) -> pb::Envelope {
	let res = match parse_room(&req.room_id) {
		Ok(room) => {
			manager
				.get_history(session_id, &room, req.since_sequence, req.limit as usize)
				.await
		}
		Err(e) => Err(e),
	};

	let mut history = pb::History {
		room_id: req.room_id,
		..Default::default()
	};
	match res {
		Ok(page) => {
			history.set_status(if page.has_gap {
				pb::Status::HistoryGap
			} else {
				pb::Status::Ok
			});
			history.has_gap = page.has_gap;
			history.messages = page.messages.iter().map(|m| message_to_pb(m, true)).collect();
		}
		Err(e) => {
			history.set_status(e.code());
			history.detail = e.to_string();
		}
	}
	envelope(request_id, pb::envelope::Msg::History(history))
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("roomcast_server_envelopes_out_total").increment(1);
	metrics::counter!("roomcast_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
