#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use athano_domain::{EmoteOrigin, EmoteRecord, UserId};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{http_client, normalize_url};
use crate::Store;

const SEVENTV_BASE_URL: &str = "https://7tv.io/v3";
const SEVENTV_GLOBAL_SET: &str = "global";
const SEVENTV_EMOTE_TTL: Duration = Duration::from_secs(600);

/// Preferred file names, largest first.
const PREFERRED_FILES: [&str; 2] = ["3x.webp", "3x.avif"];
/// Index used when an emote is looked up on its own and has none of the preferred files.
const FALLBACK_FILE_INDEX: usize = 2;

struct CachedEmote {
	fetched_at: Instant,
	emote: SevenTvEmoteData,
}

/// Emote lookups by id, kept for [`SEVENTV_EMOTE_TTL`]. Expired entries are dropped on every insert.
#[derive(Clone, Default)]
struct EmoteCache {
	entries: Arc<Mutex<HashMap<String, CachedEmote>>>,
}

impl EmoteCache {
	fn get(&self, emote_id: &str, now: Instant) -> Option<SevenTvEmoteData> {
		let mut entries = self.entries.lock();
		let entry = entries.get(emote_id)?;
		if now.saturating_duration_since(entry.fetched_at) <= SEVENTV_EMOTE_TTL {
			Some(entry.emote.clone())
		} else {
			entries.remove(emote_id);
			None
		}
	}

	fn insert(&self, emote_id: &str, emote: SevenTvEmoteData, now: Instant) {
		let mut entries = self.entries.lock();
		entries.retain(|_, e| now.saturating_duration_since(e.fetched_at) <= SEVENTV_EMOTE_TTL);
		entries.insert(emote_id.to_string(), CachedEmote { fetched_at: now, emote });
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.entries.lock().len()
	}
}

#[derive(Debug, Deserialize)]
struct SevenTvUserResponse {
	#[serde(default)]
	emote_set: Option<SevenTvSetRef>,
}

#[derive(Debug, Deserialize)]
struct SevenTvSetRef {
	id: String,
}

#[derive(Debug, Deserialize)]
struct SevenTvEmoteSetResponse {
	#[serde(default)]
	emotes: Vec<SevenTvActiveEmote>,
}

/// An emote as listed in a set; `name` is the set-local alias.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SevenTvActiveEmote {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub data: Option<SevenTvEmoteData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SevenTvEmoteData {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub flags: u32,
	#[serde(default)]
	pub host: Option<SevenTvHost>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SevenTvHost {
	pub url: String,
	#[serde(default)]
	pub files: Vec<SevenTvFile>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SevenTvFile {
	pub name: String,
	#[serde(default)]
	pub width: Option<u32>,
	#[serde(default)]
	pub height: Option<u32>,
}

fn record(id: &str, name: &str, flags: u32, host: &SevenTvHost, file: &SevenTvFile) -> EmoteRecord {
	EmoteRecord {
		origin: EmoteOrigin::SevenTv,
		id: id.to_string(),
		name: name.to_string(),
		src: format!("{}/{}", normalize_url(&host.url), file.name),
		width: file.width,
		height: file.height,
		modifier: false,
		hidden: false,
		modifier_flags: flags,
	}
}

/// Record from the inline set payload, when it carries one of the preferred files.
pub(crate) fn record_from_active(emote: &SevenTvActiveEmote) -> Option<EmoteRecord> {
	let data = emote.data.as_ref()?;
	let host = data.host.as_ref()?;
	let file = host.files.iter().find(|f| PREFERRED_FILES.contains(&f.name.as_str()))?;
	Some(record(&emote.id, &emote.name, data.flags, host, file))
}

/// Record from a standalone emote lookup, named after the set entry that referenced it.
pub(crate) fn record_from_lookup(name: &str, data: &SevenTvEmoteData) -> Option<EmoteRecord> {
	let host = data.host.as_ref()?;
	let file = host.files.get(FALLBACK_FILE_INDEX).or_else(|| host.files.last())?;
	Some(record(&data.id, name, data.flags, host, file))
}

/// 7TV emote sets for one Twitch channel.
#[derive(Clone)]
pub struct SevenTvRegistry {
	http: reqwest::Client,
	store: Arc<Store>,
	cache: EmoteCache,
}

impl SevenTvRegistry {
	pub fn new(store: Arc<Store>) -> anyhow::Result<Self> {
		Ok(Self {
			http: http_client()?,
			store,
			cache: EmoteCache::default(),
		})
	}

	/// Emote set id bound to a Twitch user, if the user has a 7TV account.
	pub async fn resolve_emote_set_id(&self, twitch_id: &UserId) -> anyhow::Result<Option<String>> {
		let url = format!("{SEVENTV_BASE_URL}/users/twitch/{twitch_id}");
		let resp = self
			.http
			.get(url)
			.send()
			.await
			.context("7tv user request")?;

		if resp.status() == reqwest::StatusCode::NOT_FOUND {
			return Ok(None);
		}

		let body: SevenTvUserResponse = resp
			.error_for_status()
			.context("7tv user status")?
			.json()
			.await
			.context("7tv user json")?;

		Ok(body.emote_set.map(|s| s.id))
	}

	async fn fetch_emote_set(&self, set_id: &str) -> anyhow::Result<Vec<SevenTvActiveEmote>> {
		let url = format!("{SEVENTV_BASE_URL}/emote-sets/{set_id}");
		let body: SevenTvEmoteSetResponse = self
			.http
			.get(url)
			.send()
			.await
			.context("7tv emote set request")?
			.error_for_status()
			.context("7tv emote set status")?
			.json()
			.await
			.context("7tv emote set json")?;
		Ok(body.emotes)
	}

	async fn fetch_emote(&self, emote_id: &str) -> anyhow::Result<SevenTvEmoteData> {
		if let Some(emote) = self.cache.get(emote_id, Instant::now()) {
			return Ok(emote);
		}

		let url = format!("{SEVENTV_BASE_URL}/emotes/{emote_id}");
		let emote: SevenTvEmoteData = self
			.http
			.get(url)
			.send()
			.await
			.context("7tv emote request")?
			.error_for_status()
			.context("7tv emote status")?
			.json()
			.await
			.context("7tv emote json")?;

		self.cache.insert(emote_id, emote.clone(), Instant::now());
		Ok(emote)
	}

	/// Load the channel set (when there is one) then the global set. A set that fails to load is skipped.
	pub async fn load_snapshot(&self, set_id: Option<&str>) -> usize {
		let mut loaded = 0;
		for set in set_id.into_iter().chain([SEVENTV_GLOBAL_SET]) {
			match self.fetch_emote_set(set).await {
				Ok(emotes) => {
					if emotes.is_empty() {
						warn!(set_id = %set, "7tv emote set empty");
					}
					for emote in emotes {
						if self.add(emote).await {
							loaded += 1;
						}
					}
					info!(set_id = %set, "7tv emote set loaded");
				}
				Err(e) => warn!(set_id = %set, error = ?e, "7tv emote set fetch failed"),
			}
		}
		loaded
	}

	/// Insert one emote, looking it up by id when the inline payload has no usable file.
	pub async fn add(&self, emote: SevenTvActiveEmote) -> bool {
		if let Some(record) = record_from_active(&emote) {
			self.store.insert_emote(record);
			return true;
		}

		debug!(emote_id = %emote.id, name = %emote.name, "7tv emote lacks inline files, fetching");
		match self.fetch_emote(&emote.id).await {
			Ok(data) => match record_from_lookup(&emote.name, &data) {
				Some(record) => {
					self.store.insert_emote(record);
					true
				}
				None => {
					warn!(emote_id = %emote.id, "7tv emote has no files");
					false
				}
			},
			Err(e) => {
				warn!(emote_id = %emote.id, error = ?e, "7tv emote fetch failed");
				false
			}
		}
	}

	pub fn remove(&self, emote_id: &str) -> usize {
		self.store.remove_emote(EmoteOrigin::SevenTv, emote_id)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn active(files: serde_json::Value) -> SevenTvActiveEmote {
		serde_json::from_value(json!({
			"id": "01F6",
			"name": "catJAM",
			"flags": 0,
			"data": {
				"id": "01F6",
				"name": "catJAM_original",
				"flags": 256,
				"host": {"url": "//cdn.7tv.app/emote/01F6", "files": files}
			}
		}))
		.unwrap()
	}

	#[test]
	fn prefers_3x_webp_and_uses_set_alias() {
		let emote = active(json!([
			{"name": "1x.webp", "width": 32, "height": 32},
			{"name": "3x.webp", "width": 96, "height": 96},
			{"name": "4x.webp", "width": 128, "height": 128}
		]));
		let record = record_from_active(&emote).unwrap();
		assert_eq!(record.name, "catJAM");
		assert_eq!(record.src, "https://cdn.7tv.app/emote/01F6/3x.webp");
		assert_eq!((record.width, record.height), (Some(96), Some(96)));
		assert_eq!(record.modifier_flags, 256);
		assert_eq!(record.origin, EmoteOrigin::SevenTv);
	}

	#[test]
	fn falls_back_to_avif() {
		let emote = active(json!([{"name": "3x.avif", "width": 96, "height": 96}]));
		assert!(record_from_active(&emote).unwrap().src.ends_with("/3x.avif"));
	}

	#[test]
	fn missing_preferred_file_needs_lookup() {
		let emote = active(json!([{"name": "1x.png"}]));
		assert!(record_from_active(&emote).is_none());

		let bare: SevenTvActiveEmote = serde_json::from_value(json!({"id": "x", "name": "y"})).unwrap();
		assert!(record_from_active(&bare).is_none());
	}

	#[test]
	fn lookup_uses_third_file_or_last() {
		let data: SevenTvEmoteData = serde_json::from_value(json!({
			"id": "e1",
			"name": "Orig",
			"flags": 0,
			"host": {"url": "https://cdn.7tv.app/emote/e1", "files": [
				{"name": "1x.png"}, {"name": "2x.png"}, {"name": "3x.png", "width": 96, "height": 96}, {"name": "4x.png"}
			]}
		}))
		.unwrap();
		let record = record_from_lookup("Alias", &data).unwrap();
		assert_eq!(record.src, "https://cdn.7tv.app/emote/e1/3x.png");
		assert_eq!(record.name, "Alias");

		let short: SevenTvEmoteData = serde_json::from_value(json!({
			"id": "e2",
			"host": {"url": "https://cdn/e2", "files": [{"name": "1x.png"}, {"name": "2x.png"}]}
		}))
		.unwrap();
		assert!(record_from_lookup("A", &short).unwrap().src.ends_with("/2x.png"));

		let empty: SevenTvEmoteData =
			serde_json::from_value(json!({"id": "e3", "host": {"url": "https://cdn/e3", "files": []}})).unwrap();
		assert!(record_from_lookup("A", &empty).is_none());
	}

	#[test]
	fn user_response_exposes_set_id() {
		let user: SevenTvUserResponse =
			serde_json::from_value(json!({"id": "u", "platform": "TWITCH", "emote_set": {"id": "set1", "name": "x"}}))
				.unwrap();
		assert_eq!(user.emote_set.unwrap().id, "set1");

		let no_set: SevenTvUserResponse = serde_json::from_value(json!({"id": "u"})).unwrap();
		assert!(no_set.emote_set.is_none());
	}

	#[test]
	fn emote_cache_expires_and_prunes_on_insert() {
		let cache = EmoteCache::default();
		let t0 = Instant::now();
		let data = |id: &str| -> SevenTvEmoteData { serde_json::from_value(json!({"id": id, "name": "n"})).unwrap() };

		cache.insert("a", data("a"), t0);
		cache.insert("b", data("b"), t0);
		assert_eq!(cache.get("a", t0 + Duration::from_secs(600)), Some(data("a")));
		assert_eq!(cache.get("missing", t0), None);

		// "b" is never read again but still goes once a later insert finds it stale
		let later = t0 + Duration::from_secs(601);
		cache.insert("c", data("c"), later);
		assert_eq!(cache.len(), 1);
		assert_eq!(cache.get("a", later), None);
		assert_eq!(cache.get("c", later), Some(data("c")));
	}

	#[test]
	fn registries_do_not_share_a_cache() {
		let first = SevenTvRegistry::new(Arc::new(Store::new(10))).unwrap();
		let second = SevenTvRegistry::new(Arc::new(Store::new(10))).unwrap();
		let data: SevenTvEmoteData = serde_json::from_value(json!({"id": "x", "name": "n"})).unwrap();

		first.cache.insert("x", data.clone(), Instant::now());
		assert_eq!(first.clone().cache.get("x", Instant::now()), Some(data));
		assert_eq!(second.cache.get("x", Instant::now()), None);
	}
}
