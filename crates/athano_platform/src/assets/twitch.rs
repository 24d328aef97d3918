#![forbid(unsafe_code)]

use std::sync::Arc;

use athano_domain::{ChatBadge, ChatCheer};
use tracing::{info, warn};

use crate::Store;
use crate::twitch::{CatalogueScope, HelixBadgeSet, HelixCheermote, HelixClient};

/// `{set_id}_{version}` keyed badges, 4x image.
pub fn badges_from_sets(sets: Vec<HelixBadgeSet>) -> Vec<ChatBadge> {
	let mut badges = Vec::new();
	for set in sets {
		for version in set.versions {
			badges.push(ChatBadge {
				name: format!("{}_{}", set.set_id, version.id),
				url: version.image_url_4x,
			});
		}
	}
	badges
}

/// One cheer per tier, keyed `{prefix}{min_bits}`, using the dark animated 4x image.
pub fn cheers_from_cheermotes(cheermotes: Vec<HelixCheermote>) -> Vec<ChatCheer> {
	let mut cheers = Vec::new();
	for cheermote in cheermotes {
		for tier in &cheermote.tiers {
			cheers.push(ChatCheer {
				name: format!("{}{}", cheermote.prefix, tier.min_bits),
				prefix: cheermote.prefix.clone(),
				url: tier.dark_animated_4x().unwrap_or_default().to_string(),
				color: tier.color.clone(),
				min_bits: tier.min_bits,
			});
		}
	}
	cheers
}

/// Static badge and cheermote tables, global then channel.
#[derive(Clone)]
pub struct TwitchCatalogue {
	helix: HelixClient,
	store: Arc<Store>,
}

impl TwitchCatalogue {
	pub fn new(helix: HelixClient, store: Arc<Store>) -> Self {
		Self { helix, store }
	}

	pub async fn load_badges(&self, scope: &CatalogueScope) -> anyhow::Result<usize> {
		let sets = self.helix.chat_badges(scope).await?;
		let badges = badges_from_sets(sets);
		if badges.is_empty() {
			warn!(scope = scope.label(), "twitch badges empty");
		} else {
			info!(scope = scope.label(), badge_count = badges.len(), "twitch badges fetched");
		}
		let n = badges.len();
		self.store.merge_badges(badges);
		Ok(n)
	}

	pub async fn load_cheers(&self, scope: &CatalogueScope) -> anyhow::Result<usize> {
		let cheermotes = self.helix.cheermotes(scope).await?;
		let cheers = cheers_from_cheermotes(cheermotes);
		if cheers.is_empty() {
			warn!(scope = scope.label(), "twitch cheermotes empty");
		} else {
			info!(scope = scope.label(), cheer_count = cheers.len(), "twitch cheermotes fetched");
		}
		let n = cheers.len();
		self.store.merge_cheers(cheers);
		Ok(n)
	}

	/// Badges and cheers for `scope`; failures are logged and the rest still loads.
	pub async fn load(&self, scope: &CatalogueScope) {
		if let Err(e) = self.load_badges(scope).await {
			warn!(scope = scope.label(), error = ?e, "twitch badges fetch failed");
		}
		if let Err(e) = self.load_cheers(scope).await {
			warn!(scope = scope.label(), error = ?e, "twitch cheermotes fetch failed");
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn badge_keys_combine_set_and_version() {
		let sets: Vec<HelixBadgeSet> = serde_json::from_value(json!([
			{"set_id": "subscriber", "versions": [
				{"id": "0", "image_url_1x": "s0-1", "image_url_4x": "s0-4", "title": "Subscriber"},
				{"id": "3", "image_url_1x": "s3-1", "image_url_4x": "s3-4"}
			]},
			{"set_id": "vip", "versions": [{"id": "1", "image_url_4x": "vip-4"}]}
		]))
		.unwrap();

		let badges = badges_from_sets(sets);
		let names: Vec<_> = badges.iter().map(|b| b.name.as_str()).collect();
		assert_eq!(names, vec!["subscriber_0", "subscriber_3", "vip_1"]);
		assert_eq!(badges[1].url, "s3-4");
	}

	#[test]
	fn cheers_expand_every_tier() {
		let cheermotes: Vec<HelixCheermote> = serde_json::from_value(json!([
			{"prefix": "Cheer", "tiers": [
				{"min_bits": 1, "color": "#979797", "images": {"dark": {"animated": {"4": "c1"}}}},
				{"min_bits": 100, "color": "#9c3ee8", "images": {"dark": {"animated": {"4": "c100"}}}}
			]}
		]))
		.unwrap();

		let cheers = cheers_from_cheermotes(cheermotes);
		assert_eq!(cheers.len(), 2);
		assert_eq!(cheers[1].name, "Cheer100");
		assert_eq!(cheers[1].prefix, "Cheer");
		assert_eq!(cheers[1].url, "c100");
		assert_eq!(cheers[1].color, "#9c3ee8");
		assert_eq!(cheers[1].min_bits, 100);
	}
}
