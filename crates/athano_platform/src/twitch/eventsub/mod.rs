#![forbid(unsafe_code)]

//! EventSub WebSocket envelopes, decoded into a closed set of frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame is not valid json: {0}")]
	Json(#[from] serde_json::Error),
	#[error("frame has no message_id")]
	MissingMessageId,
	#[error("unknown message_type: {0}")]
	UnknownMessageType(String),
	#[error("invalid {message_type} payload: {reason}")]
	InvalidPayload {
		message_type: &'static str,
		reason: String,
	},
}

impl FrameError {
	fn payload(message_type: &'static str, reason: impl Into<String>) -> Self {
		FrameError::InvalidPayload {
			message_type,
			reason: reason.into(),
		}
	}
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
	#[serde(default)]
	message_id: Option<String>,
	#[serde(default)]
	message_type: String,
	#[serde(default)]
	message_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
	metadata: RawMetadata,
	#[serde(default)]
	payload: serde_json::Value,
}

/// Envelope metadata, present on every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
	pub message_id: String,
	pub message_type: String,
	/// `None` when the server timestamp could not be parsed.
	pub timestamp: Option<DateTime<Utc>>,
}

/// An envelope whose metadata is valid but whose payload has not been interpreted yet.
///
/// Deduplication runs on the metadata alone, so a duplicate is dropped before its payload is even looked at.
#[derive(Debug)]
pub struct Envelope {
	pub metadata: FrameMetadata,
	payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventSubFrame {
	Welcome {
		session_id: String,
		/// `None` when the server sent `null`.
		keepalive_secs: Option<u64>,
	},
	Keepalive,
	Notification {
		subscription_type: String,
		event: serde_json::Value,
	},
	Reconnect {
		/// `None` when missing or empty.
		reconnect_url: Option<String>,
	},
	Revocation {
		subscription_type: String,
		status: String,
	},
}

/// `Some(None)` for an explicit `null`, `None` (via `#[serde(default)]`) when the key is absent.
fn nullable<'de, D>(d: D) -> Result<Option<Option<u64>>, D::Error>
where
	D: Deserializer<'de>,
{
	Option::<u64>::deserialize(d).map(Some)
}

#[derive(Debug, Deserialize)]
struct WelcomePayload {
	session: WelcomeSession,
}

#[derive(Debug, Deserialize)]
struct WelcomeSession {
	#[serde(default)]
	id: String,
	#[serde(default, deserialize_with = "nullable")]
	keepalive_timeout_seconds: Option<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct ReconnectPayload {
	session: ReconnectSession,
}

#[derive(Debug, Deserialize)]
struct ReconnectSession {
	#[serde(default)]
	reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionInfo {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	status: String,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
	subscription: SubscriptionInfo,
}

/// Validate the envelope shape and metadata. Frames without a `message_id` are rejected.
pub fn parse_envelope(text: &str) -> Result<Envelope, FrameError> {
	let raw: RawEnvelope = serde_json::from_str(text)?;

	let message_id = raw
		.metadata
		.message_id
		.filter(|id| !id.is_empty())
		.ok_or(FrameError::MissingMessageId)?;

	let timestamp = raw
		.metadata
		.message_timestamp
		.as_deref()
		.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
		.map(|dt| dt.with_timezone(&Utc));

	Ok(Envelope {
		metadata: FrameMetadata {
			message_id,
			message_type: raw.metadata.message_type,
			timestamp,
		},
		payload: raw.payload,
	})
}

impl Envelope {
	pub fn into_frame(self) -> Result<EventSubFrame, FrameError> {
		match self.metadata.message_type.as_str() {
			"session_welcome" => {
				let p: WelcomePayload =
					serde_json::from_value(self.payload).map_err(|e| FrameError::payload("session_welcome", e.to_string()))?;
				if p.session.id.is_empty() {
					return Err(FrameError::payload("session_welcome", "missing session id"));
				}
				let keepalive = p
					.session
					.keepalive_timeout_seconds
					.ok_or_else(|| FrameError::payload("session_welcome", "missing keepalive_timeout_seconds"))?;
				Ok(EventSubFrame::Welcome {
					session_id: p.session.id,
					keepalive_secs: keepalive,
				})
			}
			"session_keepalive" => Ok(EventSubFrame::Keepalive),
			"notification" => {
				let subscription_type = self
					.payload
					.get("subscription")
					.and_then(|s| s.get("type"))
					.and_then(|t| t.as_str())
					.ok_or_else(|| FrameError::payload("notification", "missing subscription.type"))?
					.to_string();

				let event = match self.payload.get("event") {
					Some(event @ serde_json::Value::Object(_)) => event.clone(),
					_ => return Err(FrameError::payload("notification", "missing event object")),
				};

				Ok(EventSubFrame::Notification {
					subscription_type,
					event,
				})
			}
			"session_reconnect" => {
				let p: ReconnectPayload = serde_json::from_value(self.payload)
					.map_err(|e| FrameError::payload("session_reconnect", e.to_string()))?;
				Ok(EventSubFrame::Reconnect {
					reconnect_url: p.session.reconnect_url.filter(|u| !u.trim().is_empty()),
				})
			}
			"revocation" => {
				let p: RevocationPayload =
					serde_json::from_value(self.payload).map_err(|e| FrameError::payload("revocation", e.to_string()))?;
				Ok(EventSubFrame::Revocation {
					subscription_type: p.subscription.kind,
					status: p.subscription.status,
				})
			}
			other => Err(FrameError::UnknownMessageType(other.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frame(text: &str) -> Result<EventSubFrame, FrameError> {
		parse_envelope(text)?.into_frame()
	}

	#[test]
	fn welcome_with_keepalive() {
		let text = r#"{
			"metadata": {"message_id": "w1", "message_type": "session_welcome", "message_timestamp": "2023-07-19T14:56:51.634234626Z"},
			"payload": {"session": {"id": "s1", "status": "connected", "keepalive_timeout_seconds": 10, "reconnect_url": null}}
		}"#;
		let env = parse_envelope(text).unwrap();
		assert_eq!(env.metadata.message_id, "w1");
		assert!(env.metadata.timestamp.is_some());
		assert_eq!(
			env.into_frame().unwrap(),
			EventSubFrame::Welcome {
				session_id: "s1".to_string(),
				keepalive_secs: Some(10),
			}
		);
	}

	#[test]
	fn welcome_null_keepalive_is_valid_but_missing_is_not() {
		let null = r#"{"metadata":{"message_id":"a","message_type":"session_welcome"},"payload":{"session":{"id":"s","keepalive_timeout_seconds":null}}}"#;
		assert_eq!(
			frame(null).unwrap(),
			EventSubFrame::Welcome {
				session_id: "s".to_string(),
				keepalive_secs: None,
			}
		);

		let missing = r#"{"metadata":{"message_id":"a","message_type":"session_welcome"},"payload":{"session":{"id":"s"}}}"#;
		assert!(matches!(frame(missing), Err(FrameError::InvalidPayload { .. })));

		let no_id = r#"{"metadata":{"message_id":"a","message_type":"session_welcome"},"payload":{"session":{"keepalive_timeout_seconds":10}}}"#;
		assert!(matches!(frame(no_id), Err(FrameError::InvalidPayload { .. })));
	}

	#[test]
	fn missing_message_id_is_rejected() {
		let text = r#"{"metadata":{"message_type":"session_keepalive"},"payload":{}}"#;
		assert!(matches!(parse_envelope(text), Err(FrameError::MissingMessageId)));
		let empty = r#"{"metadata":{"message_id":"","message_type":"session_keepalive"},"payload":{}}"#;
		assert!(matches!(parse_envelope(empty), Err(FrameError::MissingMessageId)));
	}

	#[test]
	fn notification_requires_event_and_type() {
		let ok = r#"{"metadata":{"message_id":"n","message_type":"notification"},
			"payload":{"subscription":{"type":"channel.chat.message_delete"},"event":{"message_id":"m","broadcaster_user_id":"1"}}}"#;
		let EventSubFrame::Notification {
			subscription_type,
			event,
		} = frame(ok).unwrap()
		else {
			panic!("expected notification");
		};
		assert_eq!(subscription_type, "channel.chat.message_delete");
		assert_eq!(event["message_id"], "m");

		let no_event = r#"{"metadata":{"message_id":"n","message_type":"notification"},"payload":{"subscription":{"type":"x"}}}"#;
		assert!(frame(no_event).is_err());

		let no_type = r#"{"metadata":{"message_id":"n","message_type":"notification"},"payload":{"event":{}}}"#;
		assert!(frame(no_type).is_err());
	}

	#[test]
	fn reconnect_url_blank_is_none() {
		let text = r#"{"metadata":{"message_id":"r","message_type":"session_reconnect"},"payload":{"session":{"id":"s","reconnect_url":"  "}}}"#;
		assert_eq!(frame(text).unwrap(), EventSubFrame::Reconnect { reconnect_url: None });

		let text = r#"{"metadata":{"message_id":"r","message_type":"session_reconnect"},"payload":{"session":{"id":"s","reconnect_url":"wss://x/ws?id=1"}}}"#;
		assert_eq!(
			frame(text).unwrap(),
			EventSubFrame::Reconnect {
				reconnect_url: Some("wss://x/ws?id=1".to_string())
			}
		);
	}

	#[test]
	fn revocation_and_unknown_types() {
		let text = r#"{"metadata":{"message_id":"v","message_type":"revocation"},"payload":{"subscription":{"type":"channel.chat.message","status":"authorization_revoked"}}}"#;
		assert_eq!(
			frame(text).unwrap(),
			EventSubFrame::Revocation {
				subscription_type: "channel.chat.message".to_string(),
				status: "authorization_revoked".to_string(),
			}
		);

		let unknown = r#"{"metadata":{"message_id":"u","message_type":"mystery"},"payload":{}}"#;
		assert!(matches!(frame(unknown), Err(FrameError::UnknownMessageType(t)) if t == "mystery"));
		assert!(matches!(parse_envelope("not json"), Err(FrameError::Json(_))));
	}
}
