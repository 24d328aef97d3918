#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseIdError;

/// EventSub subscription types the overlay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionType {
	ChatMessage,
	ChatMessageDelete,
	ChatNotification,
}

impl SubscriptionType {
	/// Types subscribed to after a fresh welcome.
	pub const SUBSCRIBED: [SubscriptionType; 2] = [SubscriptionType::ChatMessage, SubscriptionType::ChatMessageDelete];

	pub const fn as_str(self) -> &'static str {
		match self {
			SubscriptionType::ChatMessage => "channel.chat.message",
			SubscriptionType::ChatMessageDelete => "channel.chat.message_delete",
			SubscriptionType::ChatNotification => "channel.chat.notification",
		}
	}
}

impl fmt::Display for SubscriptionType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SubscriptionType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"" => Err(ParseIdError::Empty),
			"channel.chat.message" => Ok(SubscriptionType::ChatMessage),
			"channel.chat.message_delete" => Ok(SubscriptionType::ChatMessageDelete),
			"channel.chat.notification" => Ok(SubscriptionType::ChatNotification),
			other => Err(ParseIdError::UnknownSubscriptionType(other.to_string())),
		}
	}
}

/// A notification event tagged with the subscription type that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
	Message(Box<ChatMessage>),
	MessageDelete(ChatMessageDelete),
	Notification(Box<ChatNotification>),
}

impl ChatEvent {
	/// Decode the raw `payload.event` object for `kind`.
	pub fn from_event(kind: SubscriptionType, event: serde_json::Value) -> Result<Self, serde_json::Error> {
		Ok(match kind {
			SubscriptionType::ChatMessage => ChatEvent::Message(Box::new(serde_json::from_value(event)?)),
			SubscriptionType::ChatMessageDelete => ChatEvent::MessageDelete(serde_json::from_value(event)?),
			SubscriptionType::ChatNotification => ChatEvent::Notification(Box::new(serde_json::from_value(event)?)),
		})
	}

	pub fn subscription_type(&self) -> SubscriptionType {
		match self {
			ChatEvent::Message(_) => SubscriptionType::ChatMessage,
			ChatEvent::MessageDelete(_) => SubscriptionType::ChatMessageDelete,
			ChatEvent::Notification(_) => SubscriptionType::ChatNotification,
		}
	}
}

/// `channel.chat.message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub broadcaster_user_id: String,
	#[serde(default)]
	pub broadcaster_user_login: String,
	#[serde(default)]
	pub broadcaster_user_name: String,

	pub chatter_user_id: String,
	pub chatter_user_login: String,
	pub chatter_user_name: String,

	pub message_id: String,
	pub message: MessageBody,
	#[serde(default = "default_message_type")]
	pub message_type: String,
	#[serde(default)]
	pub badges: Vec<MessageBadge>,
	#[serde(default)]
	pub cheer: Option<Cheer>,
	#[serde(default)]
	pub color: String,
	#[serde(default)]
	pub reply: Option<Reply>,
	#[serde(default)]
	pub channel_points_custom_reward_id: Option<String>,
}

fn default_message_type() -> String {
	"text".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub fragments: Vec<Fragment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
	Text,
	Cheermote,
	Emote,
	Mention,
	#[serde(other)]
	Unknown,
}

/// One ordered piece of a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
	#[serde(rename = "type")]
	pub kind: FragmentKind,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub cheermote: Option<CheermoteRef>,
	#[serde(default)]
	pub emote: Option<EmoteRef>,
	#[serde(default)]
	pub mention: Option<Mention>,
}

impl Fragment {
	pub fn text(text: impl Into<String>) -> Self {
		Self {
			kind: FragmentKind::Text,
			text: text.into(),
			cheermote: None,
			emote: None,
			mention: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheermoteRef {
	pub prefix: String,
	pub bits: u64,
	#[serde(default)]
	pub tier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteRef {
	pub id: String,
	#[serde(default)]
	pub emote_set_id: String,
	#[serde(default)]
	pub owner_id: String,
	#[serde(default)]
	pub format: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
	pub user_id: String,
	pub user_name: String,
	pub user_login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBadge {
	pub set_id: String,
	pub id: String,
	#[serde(default)]
	pub info: String,
}

impl MessageBadge {
	/// Key into the badge table (`{set_id}_{id}`).
	pub fn key(&self) -> String {
		format!("{}_{}", self.set_id, self.id)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cheer {
	pub bits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reply {
	pub parent_message_id: String,
	pub parent_message_body: String,
	pub parent_user_id: String,
	pub parent_user_name: String,
	pub parent_user_login: String,
	pub thread_message_id: String,
	pub thread_user_id: String,
	pub thread_user_name: String,
	pub thread_user_login: String,
}

/// `channel.chat.message_delete` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageDelete {
	pub broadcaster_user_id: String,
	#[serde(default)]
	pub broadcaster_user_login: String,
	#[serde(default)]
	pub broadcaster_user_name: String,
	#[serde(default)]
	pub target_user_id: String,
	#[serde(default)]
	pub target_user_login: String,
	#[serde(default)]
	pub target_user_name: String,
	pub message_id: String,
}

/// `channel.chat.notification` event (subs, raids, announcements...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatNotification {
	pub broadcaster_user_id: String,
	#[serde(default)]
	pub chatter_user_id: String,
	#[serde(default)]
	pub chatter_user_login: String,
	#[serde(default)]
	pub chatter_user_name: String,
	#[serde(default)]
	pub chatter_is_anonymous: bool,
	#[serde(default)]
	pub color: String,
	#[serde(default)]
	pub badges: Vec<MessageBadge>,
	#[serde(default)]
	pub system_message: String,
	pub message_id: String,
	#[serde(default)]
	pub message: MessageBody,
	#[serde(default)]
	pub notice_type: String,
}

/// Helix user record, cached per chatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: String,
	pub login: String,
	#[serde(default)]
	pub display_name: String,
	#[serde(default, rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub broadcaster_type: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub profile_image_url: String,
	#[serde(default)]
	pub offline_image_url: String,
	#[serde(default)]
	pub created_at: Option<String>,
}
