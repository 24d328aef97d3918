#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use athano_domain::{EmoteOrigin, EmoteRecord, UserId};
use serde::Deserialize;
use tracing::{info, warn};

use super::http_client;
use crate::Store;

const BTTV_BASE_URL: &str = "https://api.betterttv.net/3";
const BTTV_CDN_URL: &str = "https://cdn.betterttv.net/emote";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BttvEmote {
	pub id: String,
	pub code: String,
	#[serde(default = "default_image_type")]
	pub image_type: String,
}

fn default_image_type() -> String {
	"webp".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BttvUserResponse {
	#[serde(default)]
	channel_emotes: Vec<BttvEmote>,
	#[serde(default)]
	shared_emotes: Vec<BttvEmote>,
}

/// BTTV never reports dimensions; the image is the 2x CDN variant.
pub fn bttv_record(emote: &BttvEmote) -> EmoteRecord {
	EmoteRecord {
		origin: EmoteOrigin::BetterTtv,
		id: emote.id.clone(),
		name: emote.code.clone(),
		src: format!("{BTTV_CDN_URL}/{}/2x.{}", emote.id, emote.image_type),
		width: None,
		height: None,
		modifier: false,
		hidden: false,
		modifier_flags: 0,
	}
}

#[derive(Clone)]
pub struct BttvRegistry {
	http: reqwest::Client,
	store: Arc<Store>,
}

impl BttvRegistry {
	pub fn new(store: Arc<Store>) -> anyhow::Result<Self> {
		Ok(Self {
			http: http_client()?,
			store,
		})
	}

	async fn fetch_user_emotes(&self, broadcaster_id: &UserId) -> anyhow::Result<Vec<BttvEmote>> {
		let url = format!("{BTTV_BASE_URL}/cached/users/twitch/{broadcaster_id}");
		let body: BttvUserResponse = self
			.http
			.get(url)
			.send()
			.await
			.context("bttv user request")?
			.error_for_status()
			.context("bttv user status")?
			.json()
			.await
			.context("bttv user json")?;

		Ok(body.channel_emotes.into_iter().chain(body.shared_emotes).collect())
	}

	async fn fetch_global_emotes(&self) -> anyhow::Result<Vec<BttvEmote>> {
		let url = format!("{BTTV_BASE_URL}/cached/emotes/global");
		self.http
			.get(url)
			.send()
			.await
			.context("bttv global emotes request")?
			.error_for_status()
			.context("bttv global emotes status")?
			.json()
			.await
			.context("bttv global emotes json")
	}

	/// Channel (own + shared) emotes, then global ones.
	pub async fn load_snapshot(&self, broadcaster_id: &UserId) -> usize {
		let mut loaded = 0;

		match self.fetch_user_emotes(broadcaster_id).await {
			Ok(emotes) => {
				info!(broadcaster_id = %broadcaster_id, emote_count = emotes.len(), "bttv channel emotes fetched");
				loaded += self.store.merge_emotes(emotes.iter().map(bttv_record));
			}
			Err(e) => warn!(broadcaster_id = %broadcaster_id, error = ?e, "bttv channel emotes fetch failed"),
		}

		match self.fetch_global_emotes().await {
			Ok(emotes) => {
				if emotes.is_empty() {
					warn!("bttv global emotes empty");
				} else {
					info!(emote_count = emotes.len(), "bttv global emotes fetched");
				}
				loaded += self.store.merge_emotes(emotes.iter().map(bttv_record));
			}
			Err(e) => warn!(error = ?e, "bttv global emotes fetch failed"),
		}

		loaded
	}

	pub fn add(&self, emote: &BttvEmote) {
		self.store.insert_emote(bttv_record(emote));
	}

	pub fn remove(&self, emote_id: &str) -> usize {
		self.store.remove_emote(EmoteOrigin::BetterTtv, emote_id)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn record_uses_cdn_template() {
		let emote: BttvEmote =
			serde_json::from_value(json!({"id": "5e76d338d6581c3724c0f0b2", "code": "catJAM", "imageType": "gif"})).unwrap();
		let record = bttv_record(&emote);
		assert_eq!(record.src, "https://cdn.betterttv.net/emote/5e76d338d6581c3724c0f0b2/2x.gif");
		assert_eq!(record.name, "catJAM");
		assert_eq!((record.width, record.height), (None, None));
		assert_eq!(record.modifier_flags, 0);
	}

	#[test]
	fn user_payload_merges_channel_and_shared() {
		let body: BttvUserResponse = serde_json::from_value(json!({
			"id": "u",
			"channelEmotes": [{"id": "a", "code": "A", "imageType": "png"}],
			"sharedEmotes": [{"id": "b", "code": "B", "imageType": "webp", "user": {"name": "x"}}]
		}))
		.unwrap();
		let codes: Vec<_> = body
			.channel_emotes
			.iter()
			.chain(body.shared_emotes.iter())
			.map(|e| e.code.as_str())
			.collect();
		assert_eq!(codes, vec!["A", "B"]);
	}

	#[test]
	fn add_and_remove_touch_only_bttv_entries() {
		let store = Arc::new(Store::default());
		let registry = BttvRegistry::new(store.clone()).unwrap();
		registry.add(&BttvEmote {
			id: "a".to_string(),
			code: "A".to_string(),
			image_type: "png".to_string(),
		});
		assert!(store.emote("A").is_some());
		assert_eq!(registry.remove("a"), 1);
		assert_eq!(registry.remove("a"), 0);
	}
}
