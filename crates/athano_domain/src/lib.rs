#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod chat;
mod emote;
pub mod filters;

pub use chat::{
	ChatEvent, ChatMessage, ChatMessageDelete, ChatNotification, Cheer, CheermoteRef, EmoteRef, Fragment, FragmentKind,
	Mention, MessageBadge, MessageBody, Reply, SubscriptionType, UserProfile,
};
pub use emote::{
	ChatBadge, ChatCheer, EmoteOrigin, EmoteRecord, ModifierTag, SEVENTV_ZERO_WIDTH, bttv_modifier_trigger,
	decode_modifier_flags,
};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown subscription type: {0}")]
	UnknownSubscriptionType(String),
}

/// Twitch user identifier (broadcaster, chatter or token owner).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Identifiers that gate every live connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcasterContext {
	pub broadcaster_id: Option<UserId>,
	pub user_id: Option<UserId>,
	pub login: Option<String>,
}

impl BroadcasterContext {
	/// `(broadcaster_id, user_id)` once both are known.
	pub fn session_ids(&self) -> Option<(&UserId, &UserId)> {
		match (&self.broadcaster_id, &self.user_id) {
			(Some(b), Some(u)) => Some((b, u)),
			_ => None,
		}
	}
}
