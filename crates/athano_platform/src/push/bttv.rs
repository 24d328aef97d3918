#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use athano_domain::UserId;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use super::{EmoteSink, PushEffect, PushProtocol, SocketClosed};
use crate::assets::{BttvEmote, BttvRegistry};

pub const BTTV_WS_URL: &str = "wss://sockets.betterttv.net/ws";

const JOIN_RETRY_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

type Effect = PushEffect<BttvEmote>;

#[derive(Debug, Deserialize)]
struct RawMessage {
	name: String,
	#[serde(default)]
	data: Value,
}

#[derive(Debug, Deserialize)]
struct EmoteCreate {
	emote: BttvEmote,
}

#[derive(Debug, Deserialize)]
struct EmoteDelete {
	#[serde(rename = "emoteId")]
	emote_id: String,
}

/// BetterTTV channel socket: join once per connection, then mirror emote create/delete.
#[derive(Debug)]
pub struct BttvPush {
	url: Url,
	broadcaster_id: UserId,

	open: bool,
	joined: bool,
	reconnect_pending: bool,
	disposed: bool,
}

impl BttvPush {
	pub fn new(url: Url, broadcaster_id: UserId) -> Self {
		Self {
			url,
			broadcaster_id,
			open: false,
			joined: false,
			reconnect_pending: false,
			disposed: false,
		}
	}

	pub fn is_open(&self) -> bool {
		self.open
	}

	pub fn is_joined(&self) -> bool {
		self.joined
	}

	fn join_frame(&self) -> String {
		json!({"name": "join_channel", "data": {"name": format!("twitch:{}", self.broadcaster_id)}}).to_string()
	}

	/// Send `join_channel`, or retry shortly if the socket is not open yet.
	pub fn join_channel(&mut self) -> Vec<Effect> {
		if self.disposed || self.joined {
			return Vec::new();
		}
		if !self.open {
			warn!("bttv socket not open, retrying join in 1s");
			return vec![PushEffect::ScheduleJoin(JOIN_RETRY_DELAY)];
		}
		self.joined = true;
		info!(broadcaster_id = %self.broadcaster_id, "bttv joining channel");
		vec![PushEffect::Send(self.join_frame())]
	}

	fn schedule_reconnect(&mut self) -> Vec<Effect> {
		if self.disposed || self.reconnect_pending {
			return Vec::new();
		}
		self.reconnect_pending = true;
		metrics::counter!("athano_reconnects_scheduled_total", "client" => "bttv").increment(1);
		warn!(delay_ms = RECONNECT_DELAY.as_millis() as u64, "bttv reconnect scheduled");
		vec![PushEffect::ScheduleReconnect(RECONNECT_DELAY)]
	}
}

impl PushProtocol for BttvPush {
	type Emote = BttvEmote;

	fn name(&self) -> &'static str {
		"bttv"
	}

	fn start(&mut self) -> Vec<Effect> {
		vec![PushEffect::Connect(self.url.clone())]
	}

	fn on_open(&mut self) -> Vec<Effect> {
		info!("bttv socket open");
		self.open = true;
		self.joined = false;
		self.join_channel()
	}

	fn on_text(&mut self, text: &str) -> Vec<Effect> {
		if self.disposed {
			return Vec::new();
		}

		let msg: RawMessage = match serde_json::from_str(text) {
			Ok(m) => m,
			Err(e) => {
				warn!(error = %e, "bttv frame discarded");
				return Vec::new();
			}
		};

		match msg.name.as_str() {
			"emote_create" => match serde_json::from_value::<EmoteCreate>(msg.data) {
				Ok(create) => {
					info!(emote_id = %create.emote.id, code = %create.emote.code, "bttv emote added");
					vec![PushEffect::Add(create.emote)]
				}
				Err(e) => {
					warn!(error = %e, "bttv emote_create discarded");
					Vec::new()
				}
			},
			"emote_delete" => match serde_json::from_value::<EmoteDelete>(msg.data) {
				Ok(delete) => {
					info!(emote_id = %delete.emote_id, "bttv emote removed");
					vec![PushEffect::Remove(delete.emote_id)]
				}
				Err(e) => {
					warn!(error = %e, "bttv emote_delete discarded");
					Vec::new()
				}
			},
			other => {
				debug!(name = other, "bttv message ignored");
				Vec::new()
			}
		}
	}

	fn on_close(&mut self, closed: SocketClosed) -> Vec<Effect> {
		info!(code = closed.code, reason = %closed.reason, "bttv socket closed");
		self.open = false;
		self.joined = false;
		self.schedule_reconnect()
	}

	fn on_connect_failed(&mut self, _error: &str) -> Vec<Effect> {
		self.open = false;
		self.schedule_reconnect()
	}

	fn on_reconnect_timer(&mut self) -> Vec<Effect> {
		if self.disposed || !self.reconnect_pending {
			return Vec::new();
		}
		self.reconnect_pending = false;
		vec![PushEffect::Connect(self.url.clone())]
	}

	fn on_join_timer(&mut self) -> Vec<Effect> {
		self.join_channel()
	}

	fn on_send_failed(&mut self, text: &str) -> Vec<Effect> {
		if self.disposed || !self.joined || text != self.join_frame() {
			return Vec::new();
		}
		self.joined = false;
		warn!("bttv join not delivered, retrying in 1s");
		vec![PushEffect::ScheduleJoin(JOIN_RETRY_DELAY)]
	}

	fn dispose(&mut self) -> Vec<Effect> {
		if self.disposed {
			return Vec::new();
		}
		self.disposed = true;
		self.reconnect_pending = false;
		self.open = false;
		vec![PushEffect::Close {
			code: 1000,
			reason: String::new(),
		}]
	}
}

#[async_trait]
impl EmoteSink<BttvEmote> for BttvRegistry {
	async fn add(&self, emote: BttvEmote) {
		BttvRegistry::add(self, &emote);
	}

	fn remove(&self, emote_id: &str) {
		BttvRegistry::remove(self, emote_id);
	}
}
