#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use athano_domain::{ChatEvent, UserProfile};
use tracing::{debug, info, warn};

use super::client::EventSink;
use crate::Store;

/// Resolves a chatter profile by login.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
	async fn profile_by_login(&self, login: &str) -> anyhow::Result<Option<UserProfile>>;
}

/// Routes decoded chat events into store mutations.
pub struct Dispatcher {
	store: Arc<Store>,
	profiles: Arc<dyn ProfileLookup>,
}

impl Dispatcher {
	pub fn new(store: Arc<Store>, profiles: Arc<dyn ProfileLookup>) -> Self {
		Self { store, profiles }
	}

	pub async fn dispatch(&self, event: ChatEvent) {
		match event {
			ChatEvent::Message(msg) => {
				if !self.store.has_profile(&msg.chatter_user_id) {
					match self.profiles.profile_by_login(&msg.chatter_user_login).await {
						Ok(Some(profile)) => self.store.upsert_profile(profile),
						Ok(None) => debug!(login = %msg.chatter_user_login, "no helix user for chatter"),
						Err(e) => warn!(login = %msg.chatter_user_login, error = ?e, "chatter profile lookup failed"),
					}
				}
				debug!(message_id = %msg.message_id, chatter = %msg.chatter_user_login, "chat message");
				self.store.append_message(*msg);
			}
			ChatEvent::MessageDelete(del) => {
				let removed = self.store.remove_message(&del.message_id);
				debug!(message_id = %del.message_id, removed, "chat message deleted");
			}
			ChatEvent::Notification(n) => {
				info!(notice_type = %n.notice_type, chatter = %n.chatter_user_login, system_message = %n.system_message, "chat notification");
			}
		}
	}
}

#[async_trait]
impl EventSink for Dispatcher {
	async fn handle(&self, event: ChatEvent) {
		self.dispatch(event).await;
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::collections::HashMap;

	use athano_domain::{ChatMessageDelete, ChatNotification, SubscriptionType};
	use parking_lot::Mutex;
	use serde_json::json;

	use super::*;

	#[derive(Default)]
	pub(crate) struct FakeProfiles {
		by_login: HashMap<String, UserProfile>,
		pub(crate) calls: Mutex<Vec<String>>,
		fail: bool,
	}

	impl FakeProfiles {
		pub(crate) fn with<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
			let by_login = entries
				.into_iter()
				.map(|(login, id)| {
					(
						login.to_string(),
						UserProfile {
							id: id.to_string(),
							login: login.to_string(),
							display_name: login.to_string(),
							kind: String::new(),
							broadcaster_type: String::new(),
							description: String::new(),
							profile_image_url: format!("https://img/{login}.png"),
							offline_image_url: String::new(),
							created_at: None,
						},
					)
				})
				.collect();
			Self {
				by_login,
				..Self::default()
			}
		}

		fn failing() -> Self {
			Self {
				fail: true,
				..Self::default()
			}
		}
	}

	#[async_trait]
	impl ProfileLookup for FakeProfiles {
		async fn profile_by_login(&self, login: &str) -> anyhow::Result<Option<UserProfile>> {
			self.calls.lock().push(login.to_string());
			if self.fail {
				anyhow::bail!("helix auth failed (status=401 Unauthorized)");
			}
			Ok(self.by_login.get(login).cloned())
		}
	}

	fn message_event(message_id: &str, chatter_id: &str, login: &str) -> ChatEvent {
		ChatEvent::from_event(
			SubscriptionType::ChatMessage,
			json!({
				"broadcaster_user_id": "1",
				"chatter_user_id": chatter_id,
				"chatter_user_login": login,
				"chatter_user_name": login,
				"message_id": message_id,
				"message": {"text": "hi", "fragments": []}
			}),
		)
		.unwrap()
	}

	#[tokio::test]
	async fn profile_is_fetched_once_per_chatter() {
		let store = Arc::new(Store::default());
		let profiles = Arc::new(FakeProfiles::with([("alice", "10")]));
		let dispatcher = Dispatcher::new(store.clone(), profiles.clone());

		dispatcher.dispatch(message_event("m1", "10", "alice")).await;
		dispatcher.dispatch(message_event("m2", "10", "alice")).await;

		assert_eq!(store.message_count(), 2);
		assert_eq!(store.profile("10").unwrap().login, "alice");
		assert_eq!(*profiles.calls.lock(), vec!["alice".to_string()]);
	}

	#[tokio::test]
	async fn lookup_failure_still_appends_message() {
		let store = Arc::new(Store::default());
		let dispatcher = Dispatcher::new(store.clone(), Arc::new(FakeProfiles::failing()));

		dispatcher.dispatch(message_event("m1", "10", "alice")).await;
		assert_eq!(store.message_count(), 1);
		assert!(!store.has_profile("10"));
	}

	#[tokio::test]
	async fn delete_removes_only_that_message() {
		let store = Arc::new(Store::default());
		let dispatcher = Dispatcher::new(store.clone(), Arc::new(FakeProfiles::default()));
		dispatcher.dispatch(message_event("m1", "10", "alice")).await;
		dispatcher.dispatch(message_event("m2", "11", "bob")).await;

		dispatcher
			.dispatch(ChatEvent::MessageDelete(ChatMessageDelete {
				broadcaster_user_id: "1".to_string(),
				broadcaster_user_login: String::new(),
				broadcaster_user_name: String::new(),
				target_user_id: "10".to_string(),
				target_user_login: "alice".to_string(),
				target_user_name: "alice".to_string(),
				message_id: "m1".to_string(),
			}))
			.await;

		let ids: Vec<_> = store.messages().into_iter().map(|m| m.message_id).collect();
		assert_eq!(ids, vec!["m2"]);
	}

	#[tokio::test]
	async fn notifications_do_not_touch_the_store() {
		let store = Arc::new(Store::default());
		let dispatcher = Dispatcher::new(store.clone(), Arc::new(FakeProfiles::default()));
		let notification: ChatNotification = serde_json::from_value(json!({
			"broadcaster_user_id": "1",
			"message_id": "n1",
			"notice_type": "raid",
			"system_message": "10 raiders from x have joined!"
		}))
		.unwrap();

		dispatcher.dispatch(ChatEvent::Notification(Box::new(notification))).await;
		assert_eq!(store.message_count(), 0);
	}
}
