#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use roomcast_domain::DeliveryState;

use crate::server::access::RoomAccess;
use crate::server::auth::issue_hmac_token;
use crate::server::error::ChatError;
use crate::server::history::HistoryService;
use crate::server::lifecycle::{DisconnectReason, SessionManagerConfig};
use crate::server::registry::{Outbound, SessionState};
use crate::server::test_support::{
	FlakyHistoryStore, SECRET, assert_quiet, manager, next_message, room, test_config, user,
};

fn flaky() -> (Arc<FlakyHistoryStore>, HistoryService) {
	let store = Arc::new(FlakyHistoryStore::default());
	(store.clone(), HistoryService::new(store))
}

#[tokio::test]
async fn authenticate_accepts_valid_token_and_rejects_the_rest() {
	let mgr = manager(test_config(), HistoryService::in_memory(), RoomAccess::open());

	let token = issue_hmac_token("alice", 60, SECRET).expect("issue");
	assert_eq!(mgr.authenticate(&token).expect("valid token"), user("alice"));

	assert!(matches!(mgr.authenticate(""), Err(ChatError::Unauthorized(_))));
	assert!(matches!(mgr.authenticate("not-a-token"), Err(ChatError::Unauthorized(_))));

	let foreign = issue_hmac_token("alice", 60, "other-secret").expect("issue");
	assert!(matches!(mgr.authenticate(&foreign), Err(ChatError::Unauthorized(_))));

	let no_secret = manager(SessionManagerConfig::default(), HistoryService::in_memory(), RoomAccess::open());
	assert!(matches!(no_secret.authenticate(&token), Err(ChatError::Unauthorized(_))));
	assert_eq!(no_secret.stats().await.sessions, 0);
}

#[tokio::test]
async fn send_is_sequenced_persisted_and_echoed() {
	let (_store, history) = flaky();
	let mgr = manager(test_config(), history.clone(), RoomAccess::open());

	let mut a = mgr.open_session(user("alice"), None).await;
	let mut c = mgr.open_session(user("carol"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join a");
	mgr.join_room(c.session_id, room("r1"), None).await.expect("join c");
	assert_eq!(mgr.session_state(a.session_id).await.expect("state"), SessionState::Joined);

	let msg = mgr.send_chat(a.session_id, &room("r1"), "hi".into()).await.expect("send");
	assert_eq!(msg.sequence_number, 1);
	assert_eq!(msg.delivery, DeliveryState::Delivered);

	let page = history.page(&room("r1"), 0, 10).await.expect("page");
	assert_eq!(page.messages.len(), 1);
	assert_eq!(page.messages[0].content, "hi");

	let (echo, _) = next_message(&mut a.outbound).await;
	assert_eq!(echo.sequence_number, 1);
	assert_eq!(echo.sender_id, user("alice"));
	let (seen, _) = next_message(&mut c.outbound).await;
	assert_eq!(seen.content, "hi");
}

#[tokio::test]
async fn non_member_send_is_rejected_without_broadcast() {
	let mgr = manager(test_config(), HistoryService::in_memory(), RoomAccess::open());

	let mut a = mgr.open_session(user("alice"), None).await;
	let b = mgr.open_session(user("bob"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join a");

	let err = mgr.send_chat(b.session_id, &room("r1"), "sneaky".into()).await.unwrap_err();
	assert_eq!(err, ChatError::NotMember(room("r1")));
	assert_quiet(&mut a.outbound).await;
}

#[tokio::test]
async fn persist_failure_is_reported_and_never_broadcast() {
	let (store, history) = flaky();
	let mgr = manager(test_config(), history, RoomAccess::open());

	let mut a = mgr.open_session(user("alice"), None).await;
	let mut c = mgr.open_session(user("carol"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join a");
	mgr.join_room(c.session_id, room("r1"), None).await.expect("join c");

	store.set_failing(true);
	let err = mgr.send_chat(a.session_id, &room("r1"), "lost".into()).await.unwrap_err();
	assert!(matches!(err, ChatError::PersistFailed { .. }), "got {err:?}");
	assert_quiet(&mut a.outbound).await;
	assert_quiet(&mut c.outbound).await;

	store.set_failing(false);
	let msg = mgr.send_chat(a.session_id, &room("r1"), "kept".into()).await.expect("send");
	assert_eq!(msg.sequence_number, 1, "a failed append must not consume a sequence number");
	assert_eq!(next_message(&mut c.outbound).await.0.content, "kept");
}

#[tokio::test]
async fn resume_within_grace_replays_missed_messages_once() {
	let mgr = manager(test_config(), HistoryService::in_memory(), RoomAccess::open());

	let mut a = mgr.open_session(user("alice"), None).await;
	let c = mgr.open_session(user("carol"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join a");
	mgr.join_room(c.session_id, room("r1"), None).await.expect("join c");

	mgr.send_chat(a.session_id, &room("r1"), "before".into()).await.expect("send");
	let (first, _) = next_message(&mut a.outbound).await;
	mgr.ack(a.session_id, &room("r1"), first.sequence_number).await.expect("ack");

	let gone = mgr.disconnect(a.session_id, DisconnectReason::Closed).await.expect("was registered");
	assert_eq!(gone.last_acked, 1);
	assert_eq!(mgr.stats().await.parked, 1);

	mgr.send_chat(c.session_id, &room("r1"), "missed 1".into()).await.expect("send");
	mgr.send_chat(c.session_id, &room("r1"), "missed 2".into()).await.expect("send");

	let mut back = mgr.open_session(user("alice"), Some(a.session_id)).await;
	let resumed = back.resumed.clone().expect("resumed");
	assert_eq!(resumed.room_id, room("r1"));
	assert_eq!(resumed.from_sequence, 2);
	assert_eq!(resumed.join.replayed, 2);
	assert_ne!(back.session_id, a.session_id);

	for expected in [2, 3] {
		let (msg, replayed) = next_message(&mut back.outbound).await;
		assert_eq!(msg.sequence_number, expected);
		assert!(replayed);
	}
	assert_quiet(&mut back.outbound).await;
	assert_eq!(mgr.stats().await.parked, 0);

	let again = mgr.open_session(user("alice"), Some(a.session_id)).await;
	assert!(again.resumed.is_none(), "a parked session resumes at most once");
}

#[tokio::test]
async fn resume_is_refused_for_another_user_or_after_grace() {
	let cfg = SessionManagerConfig {
		resume_grace: Duration::from_millis(50),
		..test_config()
	};
	let mgr = manager(cfg, HistoryService::in_memory(), RoomAccess::open());

	let a = mgr.open_session(user("alice"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join");
	mgr.disconnect(a.session_id, DisconnectReason::Timeout).await;

	let thief = mgr.open_session(user("mallory"), Some(a.session_id)).await;
	assert!(thief.resumed.is_none());

	tokio::time::sleep(Duration::from_millis(100)).await;
	let late = mgr.open_session(user("alice"), Some(a.session_id)).await;
	assert!(late.resumed.is_none());
	assert_eq!(mgr.session_state(late.session_id).await.expect("state"), SessionState::Authenticated);
}

#[tokio::test]
async fn resume_into_a_small_queue_ends_replay_with_a_lag_marker() {
	let cfg = SessionManagerConfig {
		outbound_queue_capacity: 2,
		..test_config()
	};
	let mgr = manager(cfg, HistoryService::in_memory(), RoomAccess::open());

	let a = mgr.open_session(user("alice"), None).await;
	let c = mgr.open_session(user("carol"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join a");
	mgr.join_room(c.session_id, room("r1"), None).await.expect("join c");
	mgr.disconnect(a.session_id, DisconnectReason::Closed).await.expect("was registered");

	for i in 1..=5 {
		mgr.send_chat(c.session_id, &room("r1"), format!("msg{i}")).await.expect("send");
	}

	let mut back = mgr.open_session(user("alice"), Some(a.session_id)).await;
	let resumed = back.resumed.clone().expect("resumed");
	assert_eq!(resumed.from_sequence, 1);
	assert_eq!(resumed.join.replayed, 1);
	assert!(resumed.join.replay_truncated);

	let (first, replayed) = next_message(&mut back.outbound).await;
	assert_eq!((first.sequence_number, replayed), (1, true));
	match tokio::time::timeout(Duration::from_millis(500), back.outbound.recv()).await {
		Ok(Some(Outbound::Lagged { room_id, dropped })) => {
			assert_eq!(room_id, room("r1"));
			assert_eq!(dropped, 4);
		}
		other => panic!("expected Lagged marker after truncated replay, got: {other:?}"),
	}

	let page = mgr
		.get_history(back.session_id, &room("r1"), first.sequence_number, 0)
		.await
		.expect("backfill");
	let seqs: Vec<u64> = page.messages.iter().map(|m| m.sequence_number).collect();
	assert_eq!(seqs, vec![2, 3, 4, 5]);
	assert!(!page.has_gap);
}

#[tokio::test]
async fn failed_room_switch_keeps_the_previous_room() {
	let (store, history) = flaky();
	let mgr = manager(test_config(), history, RoomAccess::open());

	let mut a = mgr.open_session(user("alice"), None).await;
	let mut c = mgr.open_session(user("carol"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join a");
	mgr.join_room(c.session_id, room("r1"), None).await.expect("join c");

	store.set_unreadable(room("bad"));
	let err = mgr.join_room(a.session_id, room("bad"), None).await.unwrap_err();
	assert!(matches!(err, ChatError::Internal(_)), "got: {err:?}");

	assert_eq!(mgr.rooms().room_of(a.session_id), Some(room("r1")));
	assert_eq!(mgr.rooms().members(&room("r1")).await.len(), 2);
	assert_eq!(mgr.session_state(a.session_id).await.expect("state"), SessionState::Joined);

	let sent = mgr
		.send_chat(a.session_id, &room("r1"), "still here".into())
		.await
		.expect("send after failed switch");
	assert_eq!(sent.sequence_number, 1);
	assert_eq!(next_message(&mut c.outbound).await.0.sequence_number, 1);
	assert_eq!(next_message(&mut a.outbound).await.0.sequence_number, 1);
	assert_quiet(&mut a.outbound).await;
}

#[tokio::test]
async fn ack_past_the_room_head_is_clamped() {
	let mgr = manager(test_config(), HistoryService::in_memory(), RoomAccess::open());

	let a = mgr.open_session(user("alice"), None).await;
	let c = mgr.open_session(user("carol"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join a");
	mgr.join_room(c.session_id, room("r1"), None).await.expect("join c");
	mgr.send_chat(c.session_id, &room("r1"), "one".into()).await.expect("send");

	assert_eq!(mgr.ack(a.session_id, &room("r1"), 1000).await.expect("ack"), 1);
	assert_eq!(mgr.ack(a.session_id, &room("elsewhere"), 7).await.expect("foreign ack"), 1);

	let gone = mgr.disconnect(a.session_id, DisconnectReason::Closed).await.expect("was registered");
	assert_eq!(gone.last_acked, 1);

	mgr.send_chat(c.session_id, &room("r1"), "two".into()).await.expect("send");
	mgr.send_chat(c.session_id, &room("r1"), "three".into()).await.expect("send");

	let mut back = mgr.open_session(user("alice"), Some(a.session_id)).await;
	assert_eq!(back.resumed.as_ref().expect("resumed").from_sequence, 2);
	for expected in [2, 3] {
		assert_eq!(next_message(&mut back.outbound).await.0.sequence_number, expected);
	}
}

#[tokio::test]
async fn sweep_drops_expired_parked_sessions() {
	let mgr = manager(test_config(), HistoryService::in_memory(), RoomAccess::open());

	let a = mgr.open_session(user("alice"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join");
	mgr.disconnect(a.session_id, DisconnectReason::Closed).await;

	let idle = mgr.open_session(user("bob"), None).await;
	mgr.disconnect(idle.session_id, DisconnectReason::Closed).await;

	assert_eq!(mgr.stats().await.parked, 1, "only joined sessions are parked");
	assert_eq!(mgr.sweep_parked(Instant::now()), 0);
	assert_eq!(mgr.sweep_parked(Instant::now() + Duration::from_secs(600)), 1);
	assert_eq!(mgr.stats().await.parked, 0);

	assert!(mgr.disconnect(a.session_id, DisconnectReason::Closed).await.is_none());
}

#[tokio::test]
async fn join_forbidden_room() {
	let access = RoomAccess::open().restrict(room("staff"), [user("alice")]);
	let mgr = manager(test_config(), HistoryService::in_memory(), access);

	let b = mgr.open_session(user("bob"), None).await;
	let err = mgr.join_room(b.session_id, room("staff"), None).await.unwrap_err();
	assert_eq!(err, ChatError::Forbidden(room("staff")));
	assert!(matches!(
		mgr.get_history(b.session_id, &room("staff"), 0, 10).await,
		Err(ChatError::Forbidden(_))
	));
	assert_eq!(mgr.session_state(b.session_id).await.expect("state"), SessionState::Authenticated);

	let a = mgr.open_session(user("alice"), None).await;
	mgr.join_room(a.session_id, room("staff"), None).await.expect("allowed");
}

#[tokio::test]
async fn invalid_and_rate_limited_sends() {
	let cfg = SessionManagerConfig {
		max_message_bytes: 8,
		send_rate_limit_burst: 2,
		send_rate_limit_per_minute: 1,
		..test_config()
	};
	let mgr = manager(cfg, HistoryService::in_memory(), RoomAccess::open());
	let a = mgr.open_session(user("alice"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join");

	assert!(matches!(
		mgr.send_chat(a.session_id, &room("r1"), "   ".into()).await,
		Err(ChatError::InvalidMessage(_))
	));
	assert!(matches!(
		mgr.send_chat(a.session_id, &room("r1"), "way too long".into()).await,
		Err(ChatError::InvalidMessage(_))
	));

	mgr.send_chat(a.session_id, &room("r1"), "one".into()).await.expect("first");
	mgr.send_chat(a.session_id, &room("r1"), "two".into()).await.expect("second");
	assert_eq!(
		mgr.send_chat(a.session_id, &room("r1"), "three".into()).await.unwrap_err(),
		ChatError::RateLimited
	);
}

#[tokio::test]
async fn leave_returns_to_authenticated() {
	let mgr = manager(test_config(), HistoryService::in_memory(), RoomAccess::open());
	let a = mgr.open_session(user("alice"), None).await;

	assert_eq!(
		mgr.leave_room(a.session_id, &room("r1")).await.unwrap_err(),
		ChatError::NotMember(room("r1"))
	);

	mgr.join_room(a.session_id, room("r1"), None).await.expect("join");
	mgr.leave_room(a.session_id, &room("r1")).await.expect("leave");
	assert_eq!(mgr.session_state(a.session_id).await.expect("state"), SessionState::Authenticated);
	assert!(mgr.rooms().members(&room("r1")).await.is_empty());
	assert!(matches!(
		mgr.send_chat(a.session_id, &room("r1"), "hi".into()).await,
		Err(ChatError::NotMember(_))
	));
}

#[tokio::test]
async fn history_limit_is_clamped_to_page_limit() {
	let cfg = SessionManagerConfig {
		history_page_limit: 3,
		send_rate_limit_burst: 0,
		..test_config()
	};
	let mgr = manager(cfg, HistoryService::in_memory(), RoomAccess::open());
	let a = mgr.open_session(user("alice"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join");
	for i in 0..5 {
		mgr.send_chat(a.session_id, &room("r1"), format!("m{i}")).await.expect("send");
	}

	assert_eq!(mgr.get_history(a.session_id, &room("r1"), 0, 0).await.expect("page").messages.len(), 3);
	assert_eq!(mgr.get_history(a.session_id, &room("r1"), 0, 100).await.expect("page").messages.len(), 3);
	let tail = mgr.get_history(a.session_id, &room("r1"), 3, 2).await.expect("page");
	assert_eq!(tail.messages.iter().map(|m| m.sequence_number).collect::<Vec<_>>(), vec![4, 5]);
	assert!(!tail.has_gap);
}

#[tokio::test]
async fn shutdown_disconnects_everyone_without_parking() {
	let mgr = manager(test_config(), HistoryService::in_memory(), RoomAccess::open());
	let mut stop = mgr.subscribe_shutdown();

	let a = mgr.open_session(user("alice"), None).await;
	let b = mgr.open_session(user("bob"), None).await;
	mgr.join_room(a.session_id, room("r1"), None).await.expect("join");
	mgr.join_room(b.session_id, room("r2"), None).await.expect("join");
	assert_eq!(mgr.stats().await.sessions, 2);
	assert_eq!(mgr.stats().await.rooms, 2);

	mgr.shutdown().await;
	stop.changed().await.expect("shutdown signal");

	let stats = mgr.stats().await;
	assert_eq!(stats.sessions, 0);
	assert_eq!(stats.parked, 0);
	assert!(mgr.rooms().members(&room("r1")).await.is_empty());
	assert!(matches!(
		mgr.session_state(a.session_id).await,
		Err(ChatError::SessionNotFound(_))
	));
}
