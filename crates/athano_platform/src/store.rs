#![forbid(unsafe_code)]

//! Process-wide overlay state: message log, chatter profiles and the emote/badge/cheer tables.

use std::collections::{HashMap, VecDeque};

use athano_domain::filters::MessageFilter;
use athano_domain::{BroadcasterContext, ChatBadge, ChatCheer, ChatMessage, EmoteOrigin, EmoteRecord, UserProfile};
use parking_lot::Mutex;

use crate::render::RenderTables;

/// Messages kept by default before the oldest are dropped.
pub const DEFAULT_MESSAGES_TO_RETAIN: usize = 20;

#[derive(Debug, Default)]
struct StoreInner {
	context: BroadcasterContext,
	messages: VecDeque<ChatMessage>,
	profiles: HashMap<String, UserProfile>,
	emotes: HashMap<String, EmoteRecord>,
	badges: HashMap<String, ChatBadge>,
	cheers: HashMap<String, ChatCheer>,
}

/// Every mutation replaces whole values under the lock; readers get clones.
#[derive(Debug)]
pub struct Store {
	inner: Mutex<StoreInner>,
	retain: usize,
}

impl Default for Store {
	fn default() -> Self {
		Self::new(DEFAULT_MESSAGES_TO_RETAIN)
	}
}

impl Store {
	/// `retain == 0` keeps every message.
	pub fn new(retain: usize) -> Self {
		Self {
			inner: Mutex::new(StoreInner::default()),
			retain,
		}
	}

	pub fn broadcaster_context(&self) -> BroadcasterContext {
		self.inner.lock().context.clone()
	}

	pub fn set_broadcaster_context(&self, ctx: BroadcasterContext) {
		self.inner.lock().context = ctx;
	}

	pub fn append_message(&self, msg: ChatMessage) {
		let mut inner = self.inner.lock();
		inner.messages.push_back(msg);
		if self.retain > 0 {
			while inner.messages.len() > self.retain {
				inner.messages.pop_front();
			}
		}
	}

	/// Returns whether a message was removed.
	pub fn remove_message(&self, message_id: &str) -> bool {
		let mut inner = self.inner.lock();
		let before = inner.messages.len();
		inner.messages.retain(|m| m.message_id != message_id);
		inner.messages.len() != before
	}

	pub fn messages(&self) -> Vec<ChatMessage> {
		self.inner.lock().messages.iter().cloned().collect()
	}

	pub fn visible_messages(&self, filter: &MessageFilter) -> Vec<ChatMessage> {
		self.inner
			.lock()
			.messages
			.iter()
			.filter(|m| filter.admits(m))
			.cloned()
			.collect()
	}

	pub fn message_count(&self) -> usize {
		self.inner.lock().messages.len()
	}

	pub fn has_profile(&self, user_id: &str) -> bool {
		self.inner.lock().profiles.contains_key(user_id)
	}

	pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
		self.inner.lock().profiles.get(user_id).cloned()
	}

	pub fn upsert_profile(&self, profile: UserProfile) {
		self.inner.lock().profiles.insert(profile.id.clone(), profile);
	}

	/// Keyed by name; a later insert under the same name replaces the earlier one whatever its origin.
	pub fn insert_emote(&self, emote: EmoteRecord) {
		metrics::counter!("athano_emotes_added_total", "origin" => emote.origin.as_str()).increment(1);
		self.inner.lock().emotes.insert(emote.name.clone(), emote);
	}

	pub fn merge_emotes(&self, emotes: impl IntoIterator<Item = EmoteRecord>) -> usize {
		let mut inner = self.inner.lock();
		let mut n = 0;
		for emote in emotes {
			metrics::counter!("athano_emotes_added_total", "origin" => emote.origin.as_str()).increment(1);
			inner.emotes.insert(emote.name.clone(), emote);
			n += 1;
		}
		n
	}

	/// Drop every entry of `origin` carrying `id`. Unknown ids are a no-op.
	pub fn remove_emote(&self, origin: EmoteOrigin, id: &str) -> usize {
		let mut inner = self.inner.lock();
		let before = inner.emotes.len();
		inner.emotes.retain(|_, e| !(e.origin == origin && e.id == id));
		let removed = before - inner.emotes.len();
		if removed > 0 {
			metrics::counter!("athano_emotes_removed_total", "origin" => origin.as_str()).increment(removed as u64);
		}
		removed
	}

	pub fn emote(&self, name: &str) -> Option<EmoteRecord> {
		self.inner.lock().emotes.get(name).cloned()
	}

	pub fn emote_count(&self) -> usize {
		self.inner.lock().emotes.len()
	}

	/// Later entries override earlier ones with the same name (channel after global).
	pub fn merge_badges(&self, badges: impl IntoIterator<Item = ChatBadge>) {
		let mut inner = self.inner.lock();
		for badge in badges {
			inner.badges.insert(badge.name.clone(), badge);
		}
	}

	pub fn merge_cheers(&self, cheers: impl IntoIterator<Item = ChatCheer>) {
		let mut inner = self.inner.lock();
		for cheer in cheers {
			inner.cheers.insert(cheer.name.clone(), cheer);
		}
	}

	pub fn badge(&self, key: &str) -> Option<ChatBadge> {
		self.inner.lock().badges.get(key).cloned()
	}

	/// Consistent snapshot of the lookup tables for one render pass.
	pub fn render_tables(&self) -> RenderTables {
		let inner = self.inner.lock();
		RenderTables {
			emotes: inner.emotes.clone(),
			badges: inner.badges.clone(),
			cheers: inner.cheers.values().cloned().collect(),
		}
	}
}

#[cfg(test)]
mod tests {
	use athano_domain::filters::{FilterConfig, FilterRule, MatchType};
	use athano_domain::{MessageBody, UserId};

	use super::*;

	fn message(id: &str, user: &str, text: &str) -> ChatMessage {
		ChatMessage {
			broadcaster_user_id: "1".to_string(),
			broadcaster_user_login: "streamer".to_string(),
			broadcaster_user_name: "Streamer".to_string(),
			chatter_user_id: format!("id-{user}"),
			chatter_user_login: user.to_lowercase(),
			chatter_user_name: user.to_string(),
			message_id: id.to_string(),
			message: MessageBody {
				text: text.to_string(),
				fragments: Vec::new(),
			},
			message_type: "text".to_string(),
			badges: Vec::new(),
			cheer: None,
			color: String::new(),
			reply: None,
			channel_points_custom_reward_id: None,
		}
	}

	fn emote(origin: EmoteOrigin, id: &str, name: &str, src: &str) -> EmoteRecord {
		EmoteRecord {
			origin,
			id: id.to_string(),
			name: name.to_string(),
			src: src.to_string(),
			width: None,
			height: None,
			modifier: false,
			hidden: false,
			modifier_flags: 0,
		}
	}

	#[test]
	fn emote_table_is_last_write_wins_by_name() {
		let store = Store::default();
		store.insert_emote(emote(EmoteOrigin::SevenTv, "a1", "Kappa", "https://a/kappa"));
		store.insert_emote(emote(EmoteOrigin::BetterTtv, "b1", "Kappa", "https://b/kappa"));

		assert_eq!(store.emote_count(), 1);
		let kappa = store.emote("Kappa").unwrap();
		assert_eq!(kappa.origin, EmoteOrigin::BetterTtv);
		assert_eq!(kappa.src, "https://b/kappa");
	}

	#[test]
	fn remove_emote_is_scoped_to_origin_and_idempotent() {
		let store = Store::default();
		store.insert_emote(emote(EmoteOrigin::SevenTv, "x", "A", "a"));
		store.insert_emote(emote(EmoteOrigin::SevenTv, "x", "A2", "a"));
		store.insert_emote(emote(EmoteOrigin::FrankerFaceZ, "x", "B", "b"));

		assert_eq!(store.remove_emote(EmoteOrigin::SevenTv, "x"), 2);
		assert_eq!(store.remove_emote(EmoteOrigin::SevenTv, "x"), 0);
		assert!(store.emote("B").is_some());
		assert_eq!(store.remove_emote(EmoteOrigin::BetterTtv, "nope"), 0);
	}

	#[test]
	fn retention_drops_oldest_messages() {
		let store = Store::new(3);
		for i in 0..5 {
			store.append_message(message(&format!("m{i}"), "alice", "hi"));
		}
		let ids: Vec<_> = store.messages().into_iter().map(|m| m.message_id).collect();
		assert_eq!(ids, vec!["m2", "m3", "m4"]);
	}

	#[test]
	fn zero_retention_keeps_everything() {
		let store = Store::new(0);
		for i in 0..50 {
			store.append_message(message(&format!("m{i}"), "alice", "hi"));
		}
		assert_eq!(store.message_count(), 50);
	}

	#[test]
	fn remove_message_by_id_keeps_order() {
		let store = Store::default();
		for id in ["a", "b", "c"] {
			store.append_message(message(id, "alice", "hi"));
		}
		assert!(store.remove_message("b"));
		assert!(!store.remove_message("b"));
		let ids: Vec<_> = store.messages().into_iter().map(|m| m.message_id).collect();
		assert_eq!(ids, vec!["a", "c"]);
	}

	#[test]
	fn visible_messages_apply_filters() {
		let store = Store::default();
		store.append_message(message("1", "NightBot", "!commands"));
		store.append_message(message("2", "alice", "hello"));
		store.append_message(message("3", "bob", "buy followers"));

		let filter = MessageFilter::from_configs(
			&FilterConfig {
				rules: vec![FilterRule::new(MatchType::Contains, "bot", false)],
			},
			&FilterConfig {
				rules: vec![FilterRule::new(MatchType::Contains, "followers", false)],
			},
		)
		.unwrap();

		let ids: Vec<_> = store
			.visible_messages(&filter)
			.into_iter()
			.map(|m| m.message_id)
			.collect();
		assert_eq!(ids, vec!["2"]);
		assert_eq!(store.visible_messages(&MessageFilter::default()).len(), 3);
	}

	#[test]
	fn channel_badges_override_global() {
		let store = Store::default();
		store.merge_badges([ChatBadge {
			name: "subscriber_0".to_string(),
			url: "global".to_string(),
		}]);
		store.merge_badges([ChatBadge {
			name: "subscriber_0".to_string(),
			url: "channel".to_string(),
		}]);
		assert_eq!(store.badge("subscriber_0").unwrap().url, "channel");
		assert_eq!(store.render_tables().badges.len(), 1);
	}

	#[test]
	fn context_roundtrips() {
		let store = Store::default();
		let ctx = BroadcasterContext {
			broadcaster_id: Some(UserId::new("1").unwrap()),
			user_id: Some(UserId::new("2").unwrap()),
			login: Some("me".to_string()),
		};
		store.set_broadcaster_context(ctx.clone());
		assert_eq!(store.broadcaster_context(), ctx);
	}
}
