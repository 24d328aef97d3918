#![forbid(unsafe_code)]

mod client;
pub(crate) mod dispatcher;
pub mod eventsub;
mod helix;
mod loader;
pub mod session;

pub use client::{DEFAULT_EVENTSUB_WS_URL, EventSink, EventSubClient, EventSubHandle, Subscriber};
pub use dispatcher::{Dispatcher, ProfileLookup};
pub use helix::{
	CatalogueScope, DEFAULT_HELIX_BASE_URL, HelixBadgeSet, HelixBadgeVersion, HelixCheermote, HelixCheermoteTier,
	HelixClient, TwitchTokenValidation, validate_user_token,
};
pub use loader::{IdentityLookup, LoadedBroadcaster, LoaderConfig, load_broadcaster, resolve_context};
