#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use athano_domain::{BroadcasterContext, UserId, UserProfile};
use tracing::{info, warn};
use url::Url;

use super::client::{DEFAULT_EVENTSUB_WS_URL, EventSubClient, EventSubHandle};
use super::dispatcher::Dispatcher;
use super::helix::{CatalogueScope, HelixClient, TwitchTokenValidation, validate_user_token};
use crate::Store;
use crate::assets::{BttvRegistry, FfzRegistry, SevenTvRegistry, TwitchCatalogue};
use crate::push::{BTTV_WS_URL, BttvPush, PushClient, PushHandle, SEVENTV_WS_URL, SevenTvPush};

/// Token validation plus login lookup.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
	async fn validate_token(&self) -> anyhow::Result<TwitchTokenValidation>;

	async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserProfile>>;
}

#[async_trait]
impl IdentityLookup for HelixClient {
	async fn validate_token(&self) -> anyhow::Result<TwitchTokenValidation> {
		validate_user_token(self.bearer_token()).await
	}

	async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserProfile>> {
		HelixClient::user_by_login(self, login).await
	}
}

/// What to load for a broadcaster.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
	/// Channel login; the token owner's channel when unset.
	pub channel: Option<String>,
	pub eventsub_ws_url: Url,
	pub seventv: bool,
	pub bttv: bool,
	pub ffz: bool,
}

impl LoaderConfig {
	pub fn new(channel: Option<String>) -> anyhow::Result<Self> {
		Ok(Self {
			channel,
			eventsub_ws_url: Url::parse(DEFAULT_EVENTSUB_WS_URL)?,
			seventv: true,
			bttv: true,
			ffz: true,
		})
	}
}

/// Broadcaster from the configured channel, user from the token; the token owner stands in for a missing channel.
pub async fn resolve_context(identity: &dyn IdentityLookup, channel: Option<&str>) -> anyhow::Result<BroadcasterContext> {
	let mut ctx = BroadcasterContext::default();

	if let Some(login) = channel.map(str::trim).filter(|l| !l.is_empty()) {
		match identity.user_by_login(login).await {
			Ok(Some(profile)) => {
				info!(login, broadcaster_id = %profile.id, "broadcaster resolved");
				ctx.broadcaster_id = UserId::new(profile.id).ok();
			}
			Ok(None) => warn!(login, "channel not found, falling back to token owner"),
			Err(e) => warn!(login, error = ?e, "channel lookup failed, falling back to token owner"),
		}
	}

	let validation = identity.validate_token().await.context("validate access token")?;
	let user_id = UserId::new(validation.user_id)?;
	info!(login = %validation.login, user_id = %user_id, "token validated");
	if ctx.broadcaster_id.is_none() {
		ctx.broadcaster_id = Some(user_id.clone());
	}
	ctx.user_id = Some(user_id);
	ctx.login = Some(validation.login);

	Ok(ctx)
}

/// Live connections for one broadcaster.
pub struct LoadedBroadcaster {
	pub context: BroadcasterContext,
	eventsub: EventSubHandle,
	pushes: Vec<PushHandle>,
}

impl LoadedBroadcaster {
	pub fn push_count(&self) -> usize {
		self.pushes.len()
	}

	pub async fn dispose(self) {
		self.eventsub.dispose().await;
		for push in self.pushes {
			push.dispose().await;
		}
		info!("broadcaster connections closed");
	}
}

/// Resolve ids, load catalogues and emote snapshots, then start EventSub and the provider push clients.
///
/// Returns `Ok(None)` when there is no credential or no broadcaster to load.
pub async fn load_broadcaster(
	helix: HelixClient,
	store: Arc<Store>,
	cfg: &LoaderConfig,
) -> anyhow::Result<Option<LoadedBroadcaster>> {
	if helix.bearer_token().is_empty() {
		info!("no access token configured, skipping broadcaster load");
		return Ok(None);
	}

	let ctx = resolve_context(&helix, cfg.channel.as_deref()).await?;
	store.set_broadcaster_context(ctx.clone());
	let Some((broadcaster_id, user_id)) = ctx.session_ids() else {
		return Ok(None);
	};
	let (broadcaster_id, user_id) = (broadcaster_id.clone(), user_id.clone());

	let catalogue = TwitchCatalogue::new(helix.clone(), store.clone());
	catalogue.load(&CatalogueScope::Global).await;
	catalogue.load(&CatalogueScope::Channel(broadcaster_id.clone())).await;

	let mut pushes = Vec::new();

	if cfg.seventv {
		let registry = SevenTvRegistry::new(store.clone())?;
		let set_id = match registry.resolve_emote_set_id(&broadcaster_id).await {
			Ok(set_id) => set_id,
			Err(e) => {
				warn!(broadcaster_id = %broadcaster_id, error = ?e, "7tv user lookup failed");
				None
			}
		};
		if let Some(set_id) = &set_id {
			let push = SevenTvPush::new(Url::parse(SEVENTV_WS_URL)?, set_id.clone());
			pushes.push(PushClient::new(push, Arc::new(registry.clone())).spawn());
		} else {
			info!(broadcaster_id = %broadcaster_id, "no 7tv emote set, loading global only");
		}
		let loaded = registry.load_snapshot(set_id.as_deref()).await;
		info!(emote_count = loaded, "7tv emotes loaded");
	}

	if cfg.bttv {
		let registry = BttvRegistry::new(store.clone())?;
		let loaded = registry.load_snapshot(&broadcaster_id).await;
		info!(emote_count = loaded, "bttv emotes loaded");
		let push = BttvPush::new(Url::parse(BTTV_WS_URL)?, broadcaster_id.clone());
		pushes.push(PushClient::new(push, Arc::new(registry)).spawn());
	}

	if cfg.ffz {
		let registry = FfzRegistry::new(store.clone())?;
		let loaded = registry.load_snapshot(&broadcaster_id).await;
		info!(emote_count = loaded, "ffz emotes loaded");
	}

	let dispatcher = Dispatcher::new(store.clone(), Arc::new(helix.clone()));
	let eventsub = EventSubClient::new(cfg.eventsub_ws_url.clone(), Arc::new(helix), Arc::new(dispatcher))
		.spawn(broadcaster_id.clone(), user_id);

	info!(broadcaster_id = %broadcaster_id, emote_count = store.emote_count(), "broadcaster loaded");
	Ok(Some(LoadedBroadcaster {
		context: ctx,
		eventsub,
		pushes,
	}))
}
