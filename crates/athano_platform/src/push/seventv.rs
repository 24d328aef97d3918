#![forbid(unsafe_code)]

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use athano_util::backoff::BackoffPolicy;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{EmoteSink, PushEffect, PushProtocol, SocketClosed};
use crate::assets::{SevenTvActiveEmote, SevenTvRegistry};

pub const SEVENTV_WS_URL: &str = "wss://events.7tv.io/v3";

const MAX_MISSED_HEARTBEATS: u32 = 3;
/// Ceiling for the server-advertised heartbeat interval.
const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
const SERVER_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
const EMOTES_KEY: &str = "emotes";

type Effect = PushEffect<SevenTvActiveEmote>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
	Dispatch,
	Hello,
	Heartbeat,
	Reconnect,
	Ack,
	Error,
	EndOfStream,
	Identify,
	Resume,
	Subscribe,
	Unsubscribe,
	Signal,
}

impl OpCode {
	pub const fn code(self) -> u8 {
		match self {
			OpCode::Dispatch => 0,
			OpCode::Hello => 1,
			OpCode::Heartbeat => 2,
			OpCode::Reconnect => 4,
			OpCode::Ack => 5,
			OpCode::Error => 6,
			OpCode::EndOfStream => 7,
			OpCode::Identify => 33,
			OpCode::Resume => 34,
			OpCode::Subscribe => 35,
			OpCode::Unsubscribe => 36,
			OpCode::Signal => 37,
		}
	}

	pub const fn from_code(code: u8) -> Option<Self> {
		Some(match code {
			0 => OpCode::Dispatch,
			1 => OpCode::Hello,
			2 => OpCode::Heartbeat,
			4 => OpCode::Reconnect,
			5 => OpCode::Ack,
			6 => OpCode::Error,
			7 => OpCode::EndOfStream,
			33 => OpCode::Identify,
			34 => OpCode::Resume,
			35 => OpCode::Subscribe,
			36 => OpCode::Unsubscribe,
			37 => OpCode::Signal,
			_ => return None,
		})
	}
}

/// Event API close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	ServerError,
	UnknownOperation,
	InvalidPayload,
	AuthFailure,
	AlreadyIdentified,
	RateLimited,
	Restart,
	Maintenance,
	Timeout,
	AlreadySubscribed,
	NotSubscribed,
	InsufficientPrivilege,
}

impl CloseReason {
	pub const fn code(self) -> u16 {
		match self {
			CloseReason::ServerError => 4000,
			CloseReason::UnknownOperation => 4001,
			CloseReason::InvalidPayload => 4002,
			CloseReason::AuthFailure => 4003,
			CloseReason::AlreadyIdentified => 4004,
			CloseReason::RateLimited => 4005,
			CloseReason::Restart => 4006,
			CloseReason::Maintenance => 4007,
			CloseReason::Timeout => 4008,
			CloseReason::AlreadySubscribed => 4009,
			CloseReason::NotSubscribed => 4010,
			CloseReason::InsufficientPrivilege => 4011,
		}
	}

	pub const fn from_code(code: u16) -> Option<Self> {
		Some(match code {
			4000 => CloseReason::ServerError,
			4001 => CloseReason::UnknownOperation,
			4002 => CloseReason::InvalidPayload,
			4003 => CloseReason::AuthFailure,
			4004 => CloseReason::AlreadyIdentified,
			4005 => CloseReason::RateLimited,
			4006 => CloseReason::Restart,
			4007 => CloseReason::Maintenance,
			4008 => CloseReason::Timeout,
			4009 => CloseReason::AlreadySubscribed,
			4010 => CloseReason::NotSubscribed,
			4011 => CloseReason::InsufficientPrivilege,
			_ => return None,
		})
	}

	/// Codes after which the server expects the client back.
	pub const fn reconnects(self) -> bool {
		match self {
			CloseReason::ServerError | CloseReason::Restart | CloseReason::Maintenance | CloseReason::Timeout => true,
			CloseReason::RateLimited => true,
			CloseReason::UnknownOperation
			| CloseReason::InvalidPayload
			| CloseReason::AuthFailure
			| CloseReason::AlreadyIdentified
			| CloseReason::AlreadySubscribed
			| CloseReason::NotSubscribed
			| CloseReason::InsufficientPrivilege => false,
		}
	}
}

static RATE_LIMIT_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Best-effort: the event API reports rate limiting only in free text.
fn mentions_rate_limit(text: &str) -> bool {
	RATE_LIMIT_RE
		.get_or_init(|| Regex::new(r"(?i)429|rate.?limit").ok())
		.as_ref()
		.is_some_and(|re| re.is_match(text))
}

#[derive(Debug, Deserialize)]
struct RawFrame {
	op: u8,
	#[serde(default)]
	d: Value,
}

#[derive(Debug, Deserialize)]
struct HelloPayload {
	heartbeat_interval: u64,
	#[serde(default)]
	session_id: String,
	#[serde(default)]
	subscription_limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatPayload {
	#[serde(default)]
	count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct AckPayload {
	#[serde(default)]
	command: String,
}

#[derive(Debug, Default, Deserialize)]
struct EndOfStreamPayload {
	#[serde(default)]
	code: u16,
	#[serde(default)]
	message: String,
}

#[derive(Debug, Deserialize)]
struct DispatchPayload {
	#[serde(rename = "type")]
	kind: String,
	body: ChangeMap,
}

#[derive(Debug, Deserialize)]
struct ChangeMap {
	#[serde(default)]
	id: String,
	#[serde(default)]
	added: Vec<ChangeField>,
	#[serde(default)]
	updated: Vec<ChangeField>,
	#[serde(default)]
	removed: Vec<ChangeField>,
	#[serde(default)]
	pushed: Vec<ChangeField>,
	#[serde(default)]
	pulled: Vec<ChangeField>,
}

#[derive(Debug, Deserialize)]
struct ChangeField {
	key: String,
	#[serde(default)]
	old_value: Option<Value>,
	#[serde(default)]
	value: Option<Value>,
}

impl ChangeField {
	fn removed_id(&self) -> Option<String> {
		let old = self.old_value.as_ref()?;
		old.get("id").and_then(Value::as_str).map(str::to_string)
	}

	fn added_emote(&self) -> Option<SevenTvActiveEmote> {
		let value = self.value.clone()?;
		match serde_json::from_value(value) {
			Ok(emote) => Some(emote),
			Err(e) => {
				warn!(error = %e, "7tv dispatch emote malformed");
				None
			}
		}
	}
}

fn emotes(fields: &[ChangeField]) -> impl Iterator<Item = &ChangeField> {
	fields.iter().filter(|f| f.key == EMOTES_KEY)
}

/// Turn an emote-set change map into registry effects.
///
/// Removals first, then each update as remove-then-add, then additions.
fn change_effects(body: &ChangeMap) -> Vec<Effect> {
	let mut effects = Vec::new();

	for field in emotes(&body.removed).chain(emotes(&body.pulled)) {
		if let Some(id) = field.removed_id() {
			effects.push(PushEffect::Remove(id));
		}
	}

	for field in emotes(&body.updated) {
		if let Some(id) = field.removed_id() {
			effects.push(PushEffect::Remove(id));
		}
		if let Some(emote) = field.added_emote() {
			effects.push(PushEffect::Add(emote));
		}
	}

	for field in emotes(&body.pushed).chain(emotes(&body.added)) {
		if let Some(emote) = field.added_emote() {
			effects.push(PushEffect::Add(emote));
		}
	}

	effects
}

fn subscribe_frame(emote_set_id: &str) -> String {
	json!({
		"op": OpCode::Subscribe.code(),
		"d": {"type": "emote_set.*", "condition": {"object_id": emote_set_id}},
	})
	.to_string()
}

/// Connection manager for one 7TV emote-set subscription.
#[derive(Debug)]
pub struct SevenTvPush {
	url: Url,
	emote_set_id: String,
	policy: BackoffPolicy,

	session_id: Option<String>,
	subscribed: bool,
	heartbeat_running: bool,
	missed_heartbeats: u32,
	retry_count: u32,
	reconnect_pending: bool,
	gave_up: bool,
	disposed: bool,
}

impl SevenTvPush {
	pub fn new(url: Url, emote_set_id: impl Into<String>) -> Self {
		Self::with_policy(url, emote_set_id, BackoffPolicy::seventv())
	}

	pub fn with_policy(url: Url, emote_set_id: impl Into<String>, policy: BackoffPolicy) -> Self {
		Self {
			url,
			emote_set_id: emote_set_id.into(),
			policy,
			session_id: None,
			subscribed: false,
			heartbeat_running: false,
			missed_heartbeats: 0,
			retry_count: 0,
			reconnect_pending: false,
			gave_up: false,
			disposed: false,
		}
	}

	pub fn session_id(&self) -> Option<&str> {
		self.session_id.as_deref()
	}

	pub fn retry_count(&self) -> u32 {
		self.retry_count
	}

	pub fn missed_heartbeats(&self) -> u32 {
		self.missed_heartbeats
	}

	pub fn is_reconnect_pending(&self) -> bool {
		self.reconnect_pending
	}

	pub fn gave_up(&self) -> bool {
		self.gave_up
	}

	/// Refused while another reconnect is pending; gives up once the retry budget is spent.
	fn schedule_reconnect(&mut self, reason: &str, delay: Option<Duration>) -> Vec<Effect> {
		if self.disposed || self.gave_up || self.reconnect_pending {
			return Vec::new();
		}

		if self.policy.exhausted(self.retry_count) {
			error!(
				max_retries = self.policy.max_retries,
				reason, "7tv max reconnect attempts reached, stopping"
			);
			metrics::counter!("athano_retries_exhausted_total", "client" => "seventv").increment(1);
			self.gave_up = true;
			return vec![PushEffect::GiveUp];
		}

		let delay = delay.unwrap_or_else(|| self.policy.delay(self.retry_count));
		warn!(
			delay_ms = delay.as_millis() as u64,
			attempt = self.retry_count + 1,
			max_retries = self.policy.max_retries,
			reason,
			"7tv reconnect scheduled"
		);
		metrics::counter!("athano_reconnects_scheduled_total", "client" => "seventv").increment(1);
		self.reconnect_pending = true;
		vec![PushEffect::ScheduleReconnect(delay)]
	}

	fn reset_connection(&mut self) -> Vec<Effect> {
		self.subscribed = false;
		self.missed_heartbeats = 0;
		if self.heartbeat_running {
			self.heartbeat_running = false;
			vec![PushEffect::StopHeartbeat]
		} else {
			Vec::new()
		}
	}

	fn on_hello(&mut self, hello: HelloPayload) -> Vec<Effect> {
		debug!(
			session_id = %hello.session_id,
			heartbeat_interval_ms = hello.heartbeat_interval,
			subscription_limit = ?hello.subscription_limit,
			"7tv hello"
		);
		self.session_id = Some(hello.session_id);

		let mut effects = Vec::new();
		if !self.subscribed {
			info!(emote_set_id = %self.emote_set_id, "7tv subscribing to emote set");
			effects.push(PushEffect::Send(subscribe_frame(&self.emote_set_id)));
			self.subscribed = true;
		}
		if !self.heartbeat_running {
			self.heartbeat_running = true;
			self.missed_heartbeats = 0;
			let interval = Duration::from_millis(hello.heartbeat_interval).min(MAX_HEARTBEAT_INTERVAL);
			effects.push(PushEffect::StartHeartbeat(interval));
		}
		effects
	}

	fn on_dispatch(&mut self, payload: DispatchPayload) -> Vec<Effect> {
		if !payload.kind.starts_with("emote_set.") {
			debug!(kind = %payload.kind, "7tv dispatch ignored");
			return Vec::new();
		}
		let effects = change_effects(&payload.body);
		for effect in &effects {
			match effect {
				PushEffect::Add(emote) => info!(set_id = %payload.body.id, emote_id = %emote.id, name = %emote.name, "7tv emote added"),
				PushEffect::Remove(id) => info!(set_id = %payload.body.id, emote_id = %id, "7tv emote removed"),
				_ => {}
			}
		}
		effects
	}

	fn on_end_of_stream(&mut self, eos: EndOfStreamPayload) -> Vec<Effect> {
		debug!(code = eos.code, message = %eos.message, "7tv end of stream");
		let mut effects = self.reset_connection();
		if eos.code == CloseReason::RateLimited.code() || mentions_rate_limit(&eos.message) {
			effects.extend(self.schedule_reconnect("end of stream rate limited", Some(self.policy.rate_limit_floor)));
		} else {
			effects.extend(self.schedule_reconnect("end of stream", None));
		}
		effects
	}
}

fn payload<T: DeserializeOwned + Default>(op: OpCode, d: Value) -> T {
	serde_json::from_value(d).unwrap_or_else(|e| {
		debug!(op = op.code(), error = %e, "7tv payload shape unexpected");
		T::default()
	})
}

impl PushProtocol for SevenTvPush {
	type Emote = SevenTvActiveEmote;

	fn name(&self) -> &'static str {
		"seventv"
	}

	fn start(&mut self) -> Vec<Effect> {
		vec![PushEffect::Connect(self.url.clone())]
	}

	fn on_open(&mut self) -> Vec<Effect> {
		info!(emote_set_id = %self.emote_set_id, "7tv socket open");
		self.retry_count = 0;
		Vec::new()
	}

	fn on_text(&mut self, text: &str) -> Vec<Effect> {
		if self.disposed {
			return Vec::new();
		}

		let frame: RawFrame = match serde_json::from_str(text) {
			Ok(f) => f,
			Err(e) => {
				warn!(error = %e, "7tv frame discarded");
				return Vec::new();
			}
		};

		let Some(op) = OpCode::from_code(frame.op) else {
			debug!(op = frame.op, "7tv unknown opcode");
			return Vec::new();
		};

		match op {
			OpCode::Dispatch => match serde_json::from_value::<DispatchPayload>(frame.d) {
				Ok(p) => self.on_dispatch(p),
				Err(e) => {
					warn!(error = %e, "7tv dispatch discarded");
					Vec::new()
				}
			},
			OpCode::Hello => match serde_json::from_value::<HelloPayload>(frame.d) {
				Ok(p) => self.on_hello(p),
				Err(e) => {
					warn!(error = %e, "7tv hello discarded");
					Vec::new()
				}
			},
			OpCode::Heartbeat => {
				let hb: HeartbeatPayload = payload(op, frame.d);
				debug!(count = hb.count, "7tv heartbeat");
				self.missed_heartbeats = 0;
				Vec::new()
			}
			OpCode::Reconnect => {
				info!("7tv server requested reconnect");
				let mut effects = self.schedule_reconnect("server requested reconnect", Some(SERVER_RECONNECT_DELAY));
				effects.insert(
					0,
					PushEffect::Close {
						code: 1000,
						reason: String::new(),
					},
				);
				effects
			}
			OpCode::Ack => {
				let ack: AckPayload = payload(op, frame.d);
				debug!(command = %ack.command, "7tv ack");
				Vec::new()
			}
			OpCode::Error => {
				let msg = match &frame.d {
					Value::String(s) => s.clone(),
					other => other.to_string(),
				};
				error!(message = %msg, "7tv error opcode");
				if mentions_rate_limit(&msg) {
					self.schedule_reconnect("error opcode rate limited", Some(self.policy.rate_limit_floor))
				} else {
					Vec::new()
				}
			}
			OpCode::EndOfStream => {
				let eos: EndOfStreamPayload = payload(op, frame.d);
				self.on_end_of_stream(eos)
			}
			OpCode::Identify | OpCode::Resume | OpCode::Subscribe | OpCode::Unsubscribe | OpCode::Signal => {
				debug!(op = frame.op, "7tv client opcode received from server");
				Vec::new()
			}
		}
	}

	fn on_close(&mut self, closed: SocketClosed) -> Vec<Effect> {
		info!(code = closed.code, reason = %closed.reason, clean = closed.clean, "7tv socket closed");
		let mut effects = self.reset_connection();

		let reason = CloseReason::from_code(closed.code);
		if reason == Some(CloseReason::RateLimited) || mentions_rate_limit(&closed.reason) {
			let delay = self.policy.rate_limited_delay(self.retry_count);
			effects.extend(self.schedule_reconnect("rate limited", Some(delay)));
		} else if reason.is_some_and(CloseReason::reconnects) || !closed.clean {
			let why = format!("close code {}", closed.code);
			effects.extend(self.schedule_reconnect(&why, None));
		}
		effects
	}

	fn on_connect_failed(&mut self, error: &str) -> Vec<Effect> {
		if mentions_rate_limit(error) {
			let delay = self.policy.rate_limited_delay(self.retry_count);
			return self.schedule_reconnect("connect rate limited", Some(delay));
		}
		self.schedule_reconnect("error before open", None)
	}

	fn on_heartbeat_tick(&mut self) -> Vec<Effect> {
		if !self.heartbeat_running {
			return Vec::new();
		}
		self.missed_heartbeats += 1;
		if self.missed_heartbeats > MAX_MISSED_HEARTBEATS {
			error!(missed = self.missed_heartbeats, "7tv too many missed heartbeats, closing");
			self.missed_heartbeats = 0;
			return vec![PushEffect::Close {
				code: CloseReason::Timeout.code(),
				reason: "heartbeat timeout".to_string(),
			}];
		}
		Vec::new()
	}

	fn on_reconnect_timer(&mut self) -> Vec<Effect> {
		if self.disposed || !self.reconnect_pending {
			return Vec::new();
		}
		self.reconnect_pending = false;
		self.retry_count += 1;
		vec![PushEffect::Connect(self.url.clone())]
	}

	fn dispose(&mut self) -> Vec<Effect> {
		if self.disposed {
			return Vec::new();
		}
		self.disposed = true;
		self.reconnect_pending = false;
		let mut effects = self.reset_connection();
		effects.push(PushEffect::Close {
			code: 1000,
			reason: String::new(),
		});
		effects
	}
}

#[async_trait]
impl EmoteSink<SevenTvActiveEmote> for SevenTvRegistry {
	async fn add(&self, emote: SevenTvActiveEmote) {
		SevenTvRegistry::add(self, emote).await;
	}

	fn remove(&self, emote_id: &str) {
		SevenTvRegistry::remove(self, emote_id);
	}
}
