#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use roomcast_client::{ClientConfig, SessionControl};
use roomcast_domain::{ChatMessage, RoomId};
use roomcast_protocol::convert::message_from_pb;
use roomcast_protocol::pb;
use roomcast_util::endpoint::DEFAULT_ENDPOINT;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

const BACKLOG: u64 = 20;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomcast_client [--connect quic://host:port] --room ROOM [--token TOKEN] [--resume SESSION_ID]\n\
\n\
Options:\n\
	--connect   Server endpoint (alias: --endpoint) (default: {DEFAULT_ENDPOINT})\n\
	--room      Room to join\n\
	--token     Bearer token (default: $ROOMCAST_CLIENT_AUTH_TOKEN)\n\
	--resume    Session id printed by a previous run, to resume within the grace window\n\
	--help      Show this help\n\
\n\
Lines typed on stdin are sent to the room. Ctrl-C or EOF leaves.\n\
\n\
Examples:\n\
	roomcast_server --mint-token alice > alice.token\n\
	ROOMCAST_CLIENT_AUTH_TOKEN=$(cat alice.token) roomcast_client --room lobby\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomcast_client=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

struct Args {
	endpoint: String,
	room: RoomId,
	token: Option<String>,
	resume: Option<String>,
}

fn non_empty(v: String) -> Option<String> {
	let v = v.trim().to_string();
	(!v.is_empty()).then_some(v)
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_ENDPOINT.to_string();
	let mut room: Option<RoomId> = None;
	let mut token = std::env::var("ROOMCAST_CLIENT_AUTH_TOKEN").ok().and_then(non_empty);
	let mut resume = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				endpoint = it.next().and_then(non_empty).unwrap_or_else(|| {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit()
				});
			}
			"--room" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				room = Some(RoomId::new(v).unwrap_or_else(|e| {
					eprintln!("Invalid --room value: {e}");
					usage_and_exit()
				}));
			}
			"--token" => token = it.next().and_then(non_empty),
			"--resume" => resume = it.next().and_then(non_empty),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(room) = room else {
		eprintln!("--room is required");
		usage_and_exit();
	};

	Args {
		endpoint,
		room,
		token,
		resume,
	}
}

fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

fn print_message(msg: &ChatMessage, replayed: bool) {
	let marker = if replayed { " (replay)" } else { "" };
	println!("[{} #{}]{} {}: {}", msg.room_id, msg.sequence_number, marker, msg.sender_id, msg.content);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfig {
		client_name: format!("roomcast-client-cli/{}", env!("CARGO_PKG_VERSION")),
		auth_token: args.token,
		resume_session_id: args.resume,
		..ClientConfig::from_quic_endpoint(&args.endpoint)?
	};
	info!(endpoint = %args.endpoint, room = %args.room, "connecting");

	let (mut control, welcome) = SessionControl::connect(cfg).await?;
	eprintln!("session {} as {} (use --resume to pick it up again)", welcome.session_id, welcome.user_id);

	let room = args.room.as_str().to_string();
	let mut last_seen: u64;

	// A resumed session is already back in its room with the missed messages queued.
	let resumed_here = welcome.resumed && welcome.resumed_room_id == room;
	if resumed_here {
		last_seen = welcome.resumed_from_sequence.saturating_sub(1);
		if welcome.resumed_replay_truncated {
			warn!(room = %room, "resume replay truncated; backfilling on the lag marker");
		}
	} else {
		let ack = control.join_room(&room, 0).await?;
		let since = ack.current_sequence.saturating_sub(BACKLOG);
		let history = control.get_history(&room, since, BACKLOG as u32).await?;
		if history.has_gap {
			warn!(room = %room, "history has a gap");
		}
		for m in &history.messages {
			if let Ok(msg) = message_from_pb(m) {
				print_message(&msg, true);
			}
		}
		last_seen = ack.current_sequence;
	}

	let mut events = control.open_events_stream().await?;
	let (ev_tx, mut ev_rx) = mpsc::channel::<pb::EventEnvelope>(256);
	let events_task = tokio::spawn(async move {
		while let Ok(Some(ev)) = events.next_event().await {
			if ev_tx.send(ev).await.is_err() {
				break;
			}
		}
	});

	let heartbeat = Duration::from_millis(welcome.heartbeat_interval_ms.max(1000));
	let mut tick = tokio::time::interval(heartbeat);
	tick.tick().await;

	let mut lines = BufReader::new(tokio::io::stdin()).lines();

	loop {
		tokio::select! {
			ev = ev_rx.recv() => {
				let Some(ev) = ev else {
					info!("events stream ended");
					break;
				};
				match ev.event {
					Some(pb::event_envelope::Event::NewMessage(m)) => {
						match message_from_pb(&m) {
							Ok(msg) => print_message(&msg, m.replayed),
							Err(e) => warn!(error = %e, "malformed message on events stream"),
						}
						if m.sequence_number > last_seen {
							last_seen = m.sequence_number;
							control.ack(&room, last_seen).await?;
						}
					}
					Some(pb::event_envelope::Event::Lagged(l)) => {
						warn!(room = %ev.room_id, dropped = l.dropped, "lagged; backfilling");
						let history = control.get_history(&room, last_seen, 0).await?;
						for m in &history.messages {
							if let Ok(msg) = message_from_pb(m) {
								print_message(&msg, true);
							}
							last_seen = last_seen.max(m.sequence_number);
						}
						control.ack(&room, last_seen).await?;
					}
					None => {}
				}
			}
			line = lines.next_line() => {
				match line? {
					Some(text) if text.trim().is_empty() => {}
					Some(text) => {
						if let Err(e) = control.send_chat(&room, &text).await {
							eprintln!("send failed: {e}");
						}
					}
					None => break,
				}
			}
			_ = tick.tick() => {
				let pong = control.ping(now_ms()).await?;
				tracing::debug!(rtt_ms = now_ms() - pong.client_time_unix_ms, "pong");
			}
			_ = tokio::signal::ctrl_c() => break,
		}
	}

	if let Err(e) = control.leave_room(&room).await {
		warn!(error = %e, "leave failed");
	}
	control.close(0, "bye");
	events_task.abort();
	Ok(())
}
