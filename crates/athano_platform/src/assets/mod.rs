#![forbid(unsafe_code)]

//! Provider emote registries and the Twitch badge/cheer catalogue.
//!
//! Each registry fetches a provider's REST snapshot, normalizes it into [`athano_domain::EmoteRecord`]s and writes
//! them into the shared [`crate::Store`]; push clients call the same registry for incremental changes.

use std::time::Duration;

use anyhow::Context;

mod bttv;
mod ffz;
mod seventv;
mod twitch;

pub use bttv::{BttvEmote, BttvRegistry, bttv_record};
pub use ffz::{FfzEmote, FfzRegistry};
pub use seventv::{SevenTvActiveEmote, SevenTvEmoteData, SevenTvFile, SevenTvHost, SevenTvRegistry};
pub use twitch::{TwitchCatalogue, badges_from_sets, cheers_from_cheermotes};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn http_client() -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent("athano/0.x (assets)")
		.timeout(HTTP_TIMEOUT)
		.connect_timeout(CONNECT_TIMEOUT)
		.build()
		.context("build reqwest client")
}

/// Providers sometimes return protocol-relative URLs (`//cdn...`).
pub(crate) fn normalize_url(url: &str) -> String {
	if url.starts_with("//") {
		format!("https:{url}")
	} else {
		url.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn protocol_relative_urls_get_https() {
		assert_eq!(normalize_url("//cdn.7tv.app/emote/1"), "https://cdn.7tv.app/emote/1");
		assert_eq!(normalize_url("https://cdn.ffz/1"), "https://cdn.ffz/1");
	}
}
