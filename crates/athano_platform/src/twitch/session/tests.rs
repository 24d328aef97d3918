use std::sync::Arc;
use std::time::Duration;

use athano_domain::{ChatEvent, SubscriptionType, UserId};
use athano_util::backoff::BackoffPolicy;
use serde_json::json;
use url::Url;

use super::*;
use crate::Store;
use crate::twitch::dispatcher::Dispatcher;
use crate::twitch::dispatcher::tests::FakeProfiles;

const BASE: &str = "wss://eventsub.wss.twitch.tv/ws";
const HANDOVER: &str = "wss://eventsub.wss.twitch.tv/ws?id=handover";

fn session() -> EventSubSession {
	let mut s = EventSubSession::new(Url::parse(BASE).unwrap());
	let effects = s.connect(UserId::new("100").unwrap(), UserId::new("200").unwrap());
	assert_eq!(effects, vec![SessionEffect::Connect(Url::parse(BASE).unwrap())]);
	s.on_open(SessionRole::Primary);
	s
}

fn welcome(id: &str, session_id: &str, keepalive: serde_json::Value) -> String {
	json!({
		"metadata": {"message_id": id, "message_type": "session_welcome", "message_timestamp": "2024-01-01T00:00:00Z"},
		"payload": {"session": {"id": session_id, "status": "connected", "keepalive_timeout_seconds": keepalive}}
	})
	.to_string()
}

fn keepalive(id: &str) -> String {
	json!({
		"metadata": {"message_id": id, "message_type": "session_keepalive", "message_timestamp": "2024-01-01T00:00:00Z"},
		"payload": {}
	})
	.to_string()
}

fn reconnect(id: &str, url: Option<&str>) -> String {
	json!({
		"metadata": {"message_id": id, "message_type": "session_reconnect", "message_timestamp": "2024-01-01T00:00:00Z"},
		"payload": {"session": {"id": "s1", "status": "reconnecting", "reconnect_url": url}}
	})
	.to_string()
}

fn chat_message(frame_id: &str, message_id: &str) -> String {
	json!({
		"metadata": {"message_id": frame_id, "message_type": "notification", "message_timestamp": "2024-01-01T00:00:00Z"},
		"payload": {
			"subscription": {"id": "sub", "type": "channel.chat.message", "version": "1"},
			"event": {
				"broadcaster_user_id": "100",
				"broadcaster_user_login": "streamer",
				"broadcaster_user_name": "Streamer",
				"chatter_user_id": "300",
				"chatter_user_login": "viewer",
				"chatter_user_name": "Viewer",
				"message_id": message_id,
				"message": {"text": "hello", "fragments": [{"type": "text", "text": "hello"}]},
				"badges": [],
				"color": "#00FF00"
			}
		}
	})
	.to_string()
}

fn subscribes(effects: &[SessionEffect]) -> Vec<SubscriptionType> {
	effects
		.iter()
		.filter_map(|e| match e {
			SessionEffect::Subscribe(req) => Some(req.kind),
			_ => None,
		})
		.collect()
}

fn dispatches(effects: &[SessionEffect]) -> usize {
	effects.iter().filter(|e| matches!(e, SessionEffect::Dispatch(_))).count()
}

#[test]
fn fresh_welcome_subscribes_once_per_type() {
	let mut s = session();
	let effects = s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));

	assert_eq!(
		subscribes(&effects),
		vec![SubscriptionType::ChatMessage, SubscriptionType::ChatMessageDelete]
	);
	let SessionEffect::Subscribe(req) = &effects[0] else {
		panic!("expected subscribe first");
	};
	assert_eq!(req.session_id, "s1");
	assert_eq!(req.broadcaster_user_id.as_str(), "100");
	assert_eq!(req.user_id.as_str(), "200");
	assert_eq!(s.phase(), SessionPhase::Subscribed);
	assert_eq!(s.session_id(), Some("s1"));
}

#[test]
fn duplicate_frames_are_discarded() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));

	let first = s.on_text(SessionRole::Primary, &chat_message("n1", "m1"));
	assert_eq!(dispatches(&first), 1);

	let again = s.on_text(SessionRole::Primary, &chat_message("n1", "m1"));
	assert!(again.is_empty(), "duplicate must not even re-arm the watchdog: {again:?}");
	assert_eq!(s.ledger().len(), 2);
}

#[test]
fn frames_without_message_id_are_discarded() {
	let mut s = session();
	let text = json!({"metadata": {"message_type": "session_keepalive"}, "payload": {}}).to_string();
	assert!(s.on_text(SessionRole::Primary, &text).is_empty());
	assert!(s.on_text(SessionRole::Primary, "garbage").is_empty());
	assert!(s.ledger().is_empty());
}

#[test]
fn processed_frames_rearm_watchdog() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));
	let effects = s.on_text(SessionRole::Primary, &keepalive("k1"));
	assert_eq!(effects, vec![SessionEffect::ArmWatchdog(Duration::from_secs(12))]);
}

#[test]
fn keepalive_floor_and_null_keep_previous_value() {
	let mut s = session();
	assert_eq!(s.keepalive_secs(), DEFAULT_KEEPALIVE_SECS);

	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(9)));
	assert_eq!(s.keepalive_secs(), 10);

	s.on_text(SessionRole::Primary, &welcome("w2", "s2", json!(null)));
	assert_eq!(s.keepalive_secs(), 10);

	let effects = s.on_text(SessionRole::Primary, &welcome("w3", "s3", json!(15)));
	assert_eq!(s.keepalive_secs(), 15);
	assert_eq!(effects.last(), Some(&SessionEffect::ArmWatchdog(Duration::from_secs(17))));
}

#[test]
fn oversized_keepalive_is_clamped() {
	let mut s = session();
	let effects = s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(u64::MAX)));
	assert_eq!(s.keepalive_secs(), MAX_KEEPALIVE_SECS);
	assert_eq!(effects.last(), Some(&SessionEffect::ArmWatchdog(Duration::from_secs(602))));

	let effects = s.on_text(SessionRole::Primary, &keepalive("k1"));
	assert_eq!(effects, vec![SessionEffect::ArmWatchdog(Duration::from_secs(602))]);
}

#[test]
fn malformed_frames_are_neither_recorded_nor_rearm_the_watchdog() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));

	let no_event = json!({
		"metadata": {"message_id": "n1", "message_type": "notification", "message_timestamp": "2024-01-01T00:00:00Z"},
		"payload": {"subscription": {"id": "sub", "type": "channel.chat.message", "version": "1"}}
	})
	.to_string();
	assert!(s.on_text(SessionRole::Primary, &no_event).is_empty());
	assert!(s.on_text(SessionRole::Primary, &welcome("w2", "", json!(10))).is_empty());
	assert_eq!(s.ledger().len(), 1);

	// a valid frame reusing the id is still processed
	let effects = s.on_text(SessionRole::Primary, &chat_message("n1", "m1"));
	assert_eq!(dispatches(&effects), 1);
	assert_eq!(effects.last(), Some(&SessionEffect::ArmWatchdog(Duration::from_secs(12))));
	assert_eq!(s.ledger().len(), 2);
}

#[test]
fn directed_reconnect_hands_over_without_resubscribing() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));
	s.on_text(SessionRole::Primary, &chat_message("n1", "m1"));

	let effects = s.on_text(SessionRole::Primary, &reconnect("r1", Some(HANDOVER)));
	assert!(effects.contains(&SessionEffect::OpenTemporary(Url::parse(HANDOVER).unwrap())));
	assert!(s.temporary_open());

	s.on_open(SessionRole::Temporary);
	let effects = s.on_text(SessionRole::Temporary, &welcome("w2", "s2", json!(10)));
	assert_eq!(effects, vec![SessionEffect::ClosePrimary, SessionEffect::CloseTemporary]);
	assert!(s.is_following_reconnect());
	assert!(!s.temporary_open());

	// the driver closes the primary, which reopens at the reconnect url with the ledger intact
	let effects = s.on_primary_closed();
	assert_eq!(effects, vec![SessionEffect::Connect(Url::parse(HANDOVER).unwrap())]);
	assert_eq!(s.ledger().len(), 4);

	s.on_open(SessionRole::Primary);
	let effects = s.on_text(SessionRole::Primary, &welcome("w3", "s2", json!(10)));
	assert!(subscribes(&effects).is_empty());
	assert!(!s.is_following_reconnect());
	assert_eq!(s.phase(), SessionPhase::Subscribed);

	// overlapping notification replayed on the new primary is still dropped
	let effects = s.on_text(SessionRole::Primary, &chat_message("n1", "m1"));
	assert!(effects.is_empty());
}

#[test]
fn temporary_and_primary_share_one_ledger() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));
	s.on_text(SessionRole::Primary, &reconnect("r1", Some(HANDOVER)));

	let on_temp = s.on_text(SessionRole::Temporary, &chat_message("n9", "m9"));
	assert_eq!(dispatches(&on_temp), 1);
	let on_primary = s.on_text(SessionRole::Primary, &chat_message("n9", "m9"));
	assert_eq!(dispatches(&on_primary), 0);
}

#[test]
fn reconnect_without_url_bounces_primary() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));
	let effects = s.on_text(SessionRole::Primary, &reconnect("r1", None));
	assert_eq!(effects[0], SessionEffect::ClosePrimary);
	assert!(!s.temporary_open());
}

#[test]
fn second_reconnect_replaces_pending_handover_socket() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &reconnect("r1", Some(HANDOVER)));
	let effects = s.on_text(SessionRole::Primary, &reconnect("r2", Some("wss://other/ws")));
	assert_eq!(effects[0], SessionEffect::CloseTemporary);
	assert_eq!(effects[1], SessionEffect::OpenTemporary(Url::parse("wss://other/ws").unwrap()));
}

#[test]
fn unclean_close_after_handover_falls_back_to_base_url() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));
	s.on_text(SessionRole::Primary, &reconnect("r1", Some(HANDOVER)));
	s.on_text(SessionRole::Temporary, &welcome("w2", "s2", json!(10)));
	s.on_primary_closed();
	assert_eq!(s.current_url().as_str(), HANDOVER);
	s.on_open(SessionRole::Primary);

	let effects = s.on_primary_closed();
	assert!(matches!(effects.as_slice(), [SessionEffect::ScheduleReconnect(_)]));
	assert_eq!(s.current_url().as_str(), BASE);
	assert!(s.ledger().is_empty());
	assert!(!s.is_following_reconnect());

	let effects = s.on_reconnect_timer();
	assert_eq!(effects, vec![SessionEffect::Connect(Url::parse(BASE).unwrap())]);
}

#[test]
fn welcome_after_unclean_close_resubscribes() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));
	s.on_primary_closed();
	s.on_reconnect_timer();
	s.on_open(SessionRole::Primary);
	let effects = s.on_text(SessionRole::Primary, &welcome("w2", "s2", json!(10)));
	assert_eq!(subscribes(&effects).len(), 2);
}

#[test]
fn backoff_doubles_and_caps_then_gives_up() {
	let mut s = session();
	let mut delays = Vec::new();
	loop {
		let effects = s.on_connect_failed();
		match effects.as_slice() {
			[SessionEffect::ScheduleReconnect(d)] => {
				delays.push(*d);
				assert_eq!(s.on_reconnect_timer().len(), 1);
			}
			[SessionEffect::GiveUp] => break,
			other => panic!("unexpected effects {other:?}"),
		}
	}

	assert_eq!(delays.len(), BackoffPolicy::eventsub().max_retries as usize);
	assert_eq!(&delays[..5], &[1, 2, 4, 8, 10].map(Duration::from_secs));
	assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
	assert_eq!(s.phase(), SessionPhase::GaveUp);
	assert!(s.on_reconnect_timer().is_empty());
	assert!(s.on_primary_closed().is_empty());
}

#[test]
fn successful_open_resets_attempts() {
	let mut s = session();
	s.on_connect_failed();
	s.on_connect_failed();
	assert_eq!(s.attempts(), 2);
	s.on_open(SessionRole::Primary);
	assert_eq!(s.attempts(), 0);
}

#[test]
fn watchdog_expiry_forces_unclean_reconnect() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));
	assert_eq!(s.on_watchdog_expired(), vec![SessionEffect::ClosePrimary]);

	let effects = s.on_primary_closed();
	assert!(matches!(effects.as_slice(), [SessionEffect::ScheduleReconnect(_)]));
	assert!(s.ledger().is_empty());
}

#[test]
fn temporary_failure_bounces_primary() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &reconnect("r1", Some(HANDOVER)));
	assert_eq!(s.on_temporary_failed(), vec![SessionEffect::ClosePrimary]);
	assert!(!s.temporary_open());
}

#[test]
fn revocation_and_unknown_notifications_do_nothing_but_rearm() {
	let mut s = session();
	let revoked = json!({
		"metadata": {"message_id": "v1", "message_type": "revocation"},
		"payload": {"subscription": {"type": "channel.chat.message", "status": "authorization_revoked"}}
	})
	.to_string();
	assert_eq!(
		s.on_text(SessionRole::Primary, &revoked),
		vec![SessionEffect::ArmWatchdog(Duration::from_secs(12))]
	);

	let raid = json!({
		"metadata": {"message_id": "x1", "message_type": "notification"},
		"payload": {"subscription": {"type": "channel.raid"}, "event": {}}
	})
	.to_string();
	assert_eq!(dispatches(&s.on_text(SessionRole::Primary, &raid)), 0);
}

#[test]
fn dispose_is_idempotent_and_final() {
	let mut s = session();
	s.on_text(SessionRole::Primary, &reconnect("r1", Some(HANDOVER)));

	assert_eq!(s.dispose(), vec![SessionEffect::CloseTemporary, SessionEffect::ClosePrimary]);
	assert!(s.dispose().is_empty());
	assert!(s.on_primary_closed().is_empty());
	assert!(s.on_reconnect_timer().is_empty());
	assert!(s.on_text(SessionRole::Primary, &keepalive("k9")).is_empty());
	assert!(
		s.connect(UserId::new("1").unwrap(), UserId::new("2").unwrap())
			.is_empty()
	);
}

#[tokio::test]
async fn welcome_then_duplicate_notification_yields_one_stored_message() {
	let store = Arc::new(Store::default());
	let dispatcher = Dispatcher::new(store.clone(), Arc::new(FakeProfiles::with([("viewer", "300")])));
	let mut s = session();

	let effects = s.on_text(SessionRole::Primary, &welcome("w1", "s1", json!(10)));
	assert_eq!(subscribes(&effects).len(), 2);

	for _ in 0..2 {
		for effect in s.on_text(SessionRole::Primary, &chat_message("n1", "m1")) {
			if let SessionEffect::Dispatch(event) = effect {
				assert!(matches!(event, ChatEvent::Message(_)));
				dispatcher.dispatch(event).await;
			}
		}
	}

	let ids: Vec<_> = store.messages().into_iter().map(|m| m.message_id).collect();
	assert_eq!(ids, vec!["m1"]);
	assert!(store.has_profile("300"));
}
