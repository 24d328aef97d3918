#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use athano_domain::{EmoteOrigin, EmoteRecord, UserId};
use serde::Deserialize;
use tracing::{info, warn};

use super::{http_client, normalize_url};
use crate::Store;

const FFZ_BASE_URL: &str = "https://api.frankerfacez.com";

#[derive(Debug, Deserialize)]
struct FfzRoomResponse {
	#[serde(default)]
	sets: HashMap<String, FfzEmoteSet>,
}

#[derive(Debug, Deserialize)]
struct FfzGlobalResponse {
	#[serde(default)]
	default_sets: Vec<u64>,
	#[serde(default)]
	sets: HashMap<String, FfzEmoteSet>,
}

#[derive(Debug, Deserialize)]
struct FfzEmoteSet {
	#[serde(default)]
	emoticons: Vec<FfzEmote>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfzEmote {
	pub id: u64,
	pub name: String,
	#[serde(default)]
	pub width: Option<f64>,
	#[serde(default)]
	pub height: Option<f64>,
	#[serde(default)]
	pub urls: HashMap<String, String>,
	#[serde(default)]
	pub modifier: bool,
	#[serde(default)]
	pub hidden: bool,
	#[serde(default)]
	pub modifier_flags: u32,
}

fn ffz_record(emote: &FfzEmote) -> Option<EmoteRecord> {
	let url = emote.urls.get("1")?;
	Some(EmoteRecord {
		origin: EmoteOrigin::FrankerFaceZ,
		id: emote.id.to_string(),
		name: emote.name.clone(),
		src: normalize_url(url),
		width: emote.width.map(|w| w.round() as u32),
		height: emote.height.map(|h| h.round() as u32),
		modifier: emote.modifier,
		hidden: emote.hidden,
		modifier_flags: emote.modifier_flags,
	})
}

fn room_records(body: &FfzRoomResponse) -> Vec<EmoteRecord> {
	body.sets
		.values()
		.flat_map(|set| set.emoticons.iter())
		.filter_map(ffz_record)
		.collect()
}

fn global_records(body: &FfzGlobalResponse) -> Vec<EmoteRecord> {
	body.default_sets
		.iter()
		.filter_map(|id| body.sets.get(&id.to_string()))
		.flat_map(|set| set.emoticons.iter())
		.filter_map(ffz_record)
		.collect()
}

/// FrankerFaceZ has no push channel; the snapshot is all there is.
#[derive(Clone)]
pub struct FfzRegistry {
	http: reqwest::Client,
	store: Arc<Store>,
}

impl FfzRegistry {
	pub fn new(store: Arc<Store>) -> anyhow::Result<Self> {
		Ok(Self {
			http: http_client()?,
			store,
		})
	}

	async fn fetch_room(&self, broadcaster_id: &UserId) -> anyhow::Result<FfzRoomResponse> {
		let url = format!("{FFZ_BASE_URL}/v1/room/id/{broadcaster_id}");
		self.http
			.get(url)
			.send()
			.await
			.context("ffz room request")?
			.error_for_status()
			.context("ffz room status")?
			.json()
			.await
			.context("ffz room json")
	}

	async fn fetch_global(&self) -> anyhow::Result<FfzGlobalResponse> {
		let url = format!("{FFZ_BASE_URL}/v1/set/global");
		self.http
			.get(url)
			.send()
			.await
			.context("ffz global request")?
			.error_for_status()
			.context("ffz global status")?
			.json()
			.await
			.context("ffz global json")
	}

	/// Every set of the room, then the global default sets.
	pub async fn load_snapshot(&self, broadcaster_id: &UserId) -> usize {
		let mut loaded = 0;

		match self.fetch_room(broadcaster_id).await {
			Ok(body) => {
				let records = room_records(&body);
				info!(broadcaster_id = %broadcaster_id, emote_count = records.len(), "ffz room emotes fetched");
				loaded += self.store.merge_emotes(records);
			}
			Err(e) => warn!(broadcaster_id = %broadcaster_id, error = ?e, "ffz room emotes fetch failed"),
		}

		match self.fetch_global().await {
			Ok(body) => {
				let records = global_records(&body);
				if records.is_empty() {
					warn!("ffz global emotes empty");
				}
				loaded += self.store.merge_emotes(records);
			}
			Err(e) => warn!(error = ?e, "ffz global emotes fetch failed"),
		}

		loaded
	}

	pub fn add(&self, emote: &FfzEmote) -> bool {
		match ffz_record(emote) {
			Some(record) => {
				self.store.insert_emote(record);
				true
			}
			None => false,
		}
	}

	pub fn remove(&self, emote_id: &str) -> usize {
		self.store.remove_emote(EmoteOrigin::FrankerFaceZ, emote_id)
	}
}
