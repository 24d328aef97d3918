#![forbid(unsafe_code)]

//! EventSub session state machine.
//!
//! The machine owns no sockets or timers. Every transition returns the [`SessionEffect`]s the driver must carry out,
//! in order; the driver reports socket and timer outcomes back through the `on_*` methods.
//!
//! A `session_reconnect` is handled by opening a temporary socket to the reconnect URL while the primary stays live.
//! Both sockets feed the same dedup ledger. Once the temporary socket is welcomed, the primary is pointed at the
//! reconnect URL and bounced; the welcome that follows skips resubscription.

use std::time::Duration;

use athano_domain::{ChatEvent, SubscriptionType, UserId};
use athano_util::backoff::BackoffPolicy;
use athano_util::dedup::DedupLedger;
use tracing::{debug, error, info, warn};
use url::Url;

use super::eventsub::{EventSubFrame, parse_envelope};

#[cfg(test)]
mod tests;

/// Keepalive assumed until a welcome says otherwise.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 10;
/// Welcomes announcing a shorter keepalive are ignored.
pub const MIN_KEEPALIVE_SECS: u64 = 10;
/// Twitch accepts keepalive timeouts up to 600s; larger values are clamped.
pub const MAX_KEEPALIVE_SECS: u64 = 600;
/// Slack added to the keepalive before the watchdog fires.
pub const WATCHDOG_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
	Primary,
	/// Parallel socket opened on `session_reconnect`.
	Temporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
	Disconnected,
	Connecting,
	Welcomed,
	Subscribed,
	Reconnecting,
	GaveUp,
	Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
	pub kind: SubscriptionType,
	pub session_id: String,
	pub broadcaster_user_id: UserId,
	pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
	Connect(Url),
	OpenTemporary(Url),
	ClosePrimary,
	CloseTemporary,
	/// (Re)start the inactivity watchdog with this period.
	ArmWatchdog(Duration),
	ScheduleReconnect(Duration),
	Subscribe(SubscriptionRequest),
	Dispatch(ChatEvent),
	/// Retries exhausted; nothing further will be attempted.
	GiveUp,
}

#[derive(Debug)]
pub struct EventSubSession {
	base_url: Url,
	current_url: Url,
	using_reconnect_url: bool,
	/// Target of the temporary socket, promoted once it is welcomed.
	reconnect_url: Option<Url>,

	broadcaster_id: Option<UserId>,
	user_id: Option<UserId>,
	session_id: Option<String>,
	keepalive_secs: u64,

	following_reconnect: bool,
	handover_pending: bool,
	temporary_open: bool,

	ledger: DedupLedger,
	policy: BackoffPolicy,
	attempts: u32,
	phase: SessionPhase,
}

impl EventSubSession {
	pub fn new(base_url: Url) -> Self {
		Self::with_policy(base_url, BackoffPolicy::eventsub())
	}

	pub fn with_policy(base_url: Url, policy: BackoffPolicy) -> Self {
		Self {
			current_url: base_url.clone(),
			base_url,
			using_reconnect_url: false,
			reconnect_url: None,
			broadcaster_id: None,
			user_id: None,
			session_id: None,
			keepalive_secs: DEFAULT_KEEPALIVE_SECS,
			following_reconnect: false,
			handover_pending: false,
			temporary_open: false,
			ledger: DedupLedger::default(),
			policy,
			attempts: 0,
			phase: SessionPhase::Disconnected,
		}
	}

	pub fn phase(&self) -> SessionPhase {
		self.phase
	}

	pub fn session_id(&self) -> Option<&str> {
		self.session_id.as_deref()
	}

	pub fn keepalive_secs(&self) -> u64 {
		self.keepalive_secs
	}

	pub fn watchdog_period(&self) -> Duration {
		Duration::from_secs(self.keepalive_secs).saturating_add(WATCHDOG_GRACE)
	}

	pub fn current_url(&self) -> &Url {
		&self.current_url
	}

	pub fn is_following_reconnect(&self) -> bool {
		self.following_reconnect
	}

	pub fn temporary_open(&self) -> bool {
		self.temporary_open
	}

	pub fn attempts(&self) -> u32 {
		self.attempts
	}

	pub fn ledger(&self) -> &DedupLedger {
		&self.ledger
	}

	pub fn is_disposed(&self) -> bool {
		self.phase == SessionPhase::Disposed
	}

	/// Open the primary socket for this broadcaster/user pair.
	pub fn connect(&mut self, broadcaster_id: UserId, user_id: UserId) -> Vec<SessionEffect> {
		if self.is_disposed() {
			return Vec::new();
		}
		self.broadcaster_id = Some(broadcaster_id);
		self.user_id = Some(user_id);
		self.phase = SessionPhase::Connecting;
		vec![SessionEffect::Connect(self.current_url.clone())]
	}

	pub fn on_open(&mut self, role: SessionRole) -> Vec<SessionEffect> {
		if self.is_disposed() {
			return Vec::new();
		}
		match role {
			SessionRole::Primary => {
				info!(url = %self.current_url, "eventsub connected");
				self.attempts = 0;
				vec![SessionEffect::ArmWatchdog(self.watchdog_period())]
			}
			SessionRole::Temporary => {
				debug!("eventsub handover socket connected");
				Vec::new()
			}
		}
	}

	/// Process one inbound text frame from either socket.
	pub fn on_text(&mut self, role: SessionRole, text: &str) -> Vec<SessionEffect> {
		if self.is_disposed() {
			return Vec::new();
		}

		let envelope = match parse_envelope(text) {
			Ok(env) => env,
			Err(e) => {
				warn!(?role, error = %e, "eventsub frame discarded");
				return Vec::new();
			}
		};

		let message_id = envelope.metadata.message_id.clone();
		if self.ledger.contains(&message_id) {
			metrics::counter!("athano_eventsub_duplicate_frames_total").increment(1);
			debug!(?role, message_id = %message_id, "eventsub duplicate frame dropped");
			return Vec::new();
		}

		// only a frame that validates counts as processed: it is recorded and feeds the watchdog
		let frame = match envelope.into_frame() {
			Ok(frame) => frame,
			Err(e) => {
				warn!(?role, message_id = %message_id, error = %e, "eventsub frame discarded");
				return Vec::new();
			}
		};
		self.ledger.record(&message_id);

		let mut effects = self.on_frame(role, frame);

		if role == SessionRole::Primary && !self.is_disposed() {
			effects.push(SessionEffect::ArmWatchdog(self.watchdog_period()));
		}
		effects
	}

	fn apply_keepalive(&mut self, keepalive_secs: Option<u64>) {
		match keepalive_secs {
			Some(secs) if secs > MAX_KEEPALIVE_SECS => {
				warn!(secs, clamped = MAX_KEEPALIVE_SECS, "eventsub keepalive above ceiling clamped");
				self.keepalive_secs = MAX_KEEPALIVE_SECS;
			}
			Some(secs) if secs >= MIN_KEEPALIVE_SECS => self.keepalive_secs = secs,
			Some(secs) => debug!(secs, kept = self.keepalive_secs, "eventsub keepalive below floor ignored"),
			None => {}
		}
	}

	fn on_frame(&mut self, role: SessionRole, frame: EventSubFrame) -> Vec<SessionEffect> {
		match frame {
			EventSubFrame::Welcome {
				session_id,
				keepalive_secs,
			} => self.on_welcome(role, session_id, keepalive_secs),
			EventSubFrame::Keepalive => {
				debug!(?role, "eventsub keepalive");
				Vec::new()
			}
			EventSubFrame::Notification {
				subscription_type,
				event,
			} => {
				let kind = match subscription_type.parse::<SubscriptionType>() {
					Ok(kind) => kind,
					Err(_) => {
						debug!(%subscription_type, "eventsub notification for unhandled type");
						return Vec::new();
					}
				};
				match ChatEvent::from_event(kind, event) {
					Ok(event) => vec![SessionEffect::Dispatch(event)],
					Err(e) => {
						warn!(%kind, error = %e, "eventsub notification event invalid");
						Vec::new()
					}
				}
			}
			EventSubFrame::Reconnect { reconnect_url } => self.on_reconnect(role, reconnect_url),
			EventSubFrame::Revocation {
				subscription_type,
				status,
			} => {
				warn!(%subscription_type, %status, "eventsub subscription revoked");
				Vec::new()
			}
		}
	}

	fn on_welcome(&mut self, role: SessionRole, session_id: String, keepalive_secs: Option<u64>) -> Vec<SessionEffect> {
		self.apply_keepalive(keepalive_secs);
		let mut effects = Vec::new();

		match role {
			SessionRole::Temporary => {
				info!(session_id = %session_id, "eventsub handover welcomed");
				self.following_reconnect = true;
				if let Some(url) = self.reconnect_url.take() {
					self.current_url = url;
					self.using_reconnect_url = true;
				}
				self.handover_pending = true;
				self.temporary_open = false;
				self.phase = SessionPhase::Reconnecting;
				effects.push(SessionEffect::ClosePrimary);
				effects.push(SessionEffect::CloseTemporary);
			}
			SessionRole::Primary => {
				info!(session_id = %session_id, keepalive_secs = self.keepalive_secs, "eventsub welcome");
				if self.temporary_open {
					self.temporary_open = false;
					effects.push(SessionEffect::CloseTemporary);
				}
				self.session_id = Some(session_id.clone());

				if self.following_reconnect {
					self.following_reconnect = false;
					self.phase = SessionPhase::Subscribed;
					debug!("eventsub welcome after directed reconnect, subscriptions carried over");
					return effects;
				}

				match (&self.broadcaster_id, &self.user_id) {
					(Some(broadcaster), Some(user)) => {
						for kind in SubscriptionType::SUBSCRIBED {
							effects.push(SessionEffect::Subscribe(SubscriptionRequest {
								kind,
								session_id: session_id.clone(),
								broadcaster_user_id: broadcaster.clone(),
								user_id: user.clone(),
							}));
						}
						self.phase = SessionPhase::Subscribed;
					}
					_ => {
						warn!("eventsub welcome without broadcaster context, not subscribing");
						self.phase = SessionPhase::Welcomed;
					}
				}
			}
		}
		effects
	}

	fn on_reconnect(&mut self, role: SessionRole, reconnect_url: Option<String>) -> Vec<SessionEffect> {
		if role == SessionRole::Temporary {
			warn!("eventsub reconnect on handover socket ignored");
			return Vec::new();
		}

		let Some(url) = reconnect_url.as_deref().and_then(|u| Url::parse(u).ok()) else {
			warn!(?reconnect_url, "eventsub reconnect without usable url, bouncing primary");
			return vec![SessionEffect::ClosePrimary];
		};

		info!(url = %url, "eventsub reconnect requested, opening handover socket");
		let mut effects = Vec::new();
		if self.temporary_open {
			effects.push(SessionEffect::CloseTemporary);
		}
		self.reconnect_url = Some(url.clone());
		self.temporary_open = true;
		self.phase = SessionPhase::Reconnecting;
		effects.push(SessionEffect::OpenTemporary(url));
		effects
	}

	/// The primary socket is gone, whether the server closed it, it errored or we closed it.
	pub fn on_primary_closed(&mut self) -> Vec<SessionEffect> {
		if self.is_disposed() || self.phase == SessionPhase::GaveUp {
			return Vec::new();
		}

		if self.handover_pending {
			self.handover_pending = false;
			self.phase = SessionPhase::Connecting;
			info!(url = %self.current_url, "eventsub moving primary to reconnect url");
			return vec![SessionEffect::Connect(self.current_url.clone())];
		}

		self.schedule_retry()
	}

	pub fn on_connect_failed(&mut self) -> Vec<SessionEffect> {
		if self.is_disposed() || self.phase == SessionPhase::GaveUp {
			return Vec::new();
		}
		self.handover_pending = false;
		self.schedule_retry()
	}

	fn schedule_retry(&mut self) -> Vec<SessionEffect> {
		let mut effects = Vec::new();

		if self.using_reconnect_url {
			debug!("eventsub reconnect url is single use, falling back to base url");
			self.current_url = self.base_url.clone();
			self.using_reconnect_url = false;
		}
		self.ledger.clear();
		self.following_reconnect = false;
		self.session_id = None;
		self.reconnect_url = None;
		if self.temporary_open {
			self.temporary_open = false;
			effects.push(SessionEffect::CloseTemporary);
		}

		if self.policy.exhausted(self.attempts) {
			metrics::counter!("athano_retries_exhausted_total", "client" => "eventsub").increment(1);
			error!(attempts = self.attempts, "eventsub reconnect attempts exhausted, giving up");
			self.phase = SessionPhase::GaveUp;
			effects.push(SessionEffect::GiveUp);
			return effects;
		}

		let delay = self.policy.delay(self.attempts);
		self.attempts += 1;
		self.phase = SessionPhase::Reconnecting;
		metrics::counter!("athano_reconnects_scheduled_total", "client" => "eventsub").increment(1);
		warn!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "eventsub reconnect scheduled");
		effects.push(SessionEffect::ScheduleReconnect(delay));
		effects
	}

	pub fn on_reconnect_timer(&mut self) -> Vec<SessionEffect> {
		if self.is_disposed() || self.phase == SessionPhase::GaveUp {
			return Vec::new();
		}
		self.phase = SessionPhase::Connecting;
		vec![SessionEffect::Connect(self.current_url.clone())]
	}

	pub fn on_watchdog_expired(&mut self) -> Vec<SessionEffect> {
		if self.is_disposed() {
			return Vec::new();
		}
		warn!(period_ms = self.watchdog_period().as_millis() as u64, "eventsub inactivity watchdog expired");
		vec![SessionEffect::ClosePrimary]
	}

	/// The temporary socket closed before it was welcomed.
	pub fn on_temporary_closed(&mut self) -> Vec<SessionEffect> {
		if self.temporary_open {
			debug!("eventsub handover socket closed");
		}
		self.temporary_open = false;
		self.reconnect_url = None;
		Vec::new()
	}

	pub fn on_temporary_failed(&mut self) -> Vec<SessionEffect> {
		if self.is_disposed() {
			return Vec::new();
		}
		warn!("eventsub handover socket failed, bouncing primary");
		self.temporary_open = false;
		self.reconnect_url = None;
		vec![SessionEffect::ClosePrimary]
	}

	/// Tear down. Idempotent; every later call is a no-op.
	pub fn dispose(&mut self) -> Vec<SessionEffect> {
		if self.is_disposed() {
			return Vec::new();
		}
		self.phase = SessionPhase::Disposed;
		self.handover_pending = false;
		let mut effects = Vec::new();
		if self.temporary_open {
			self.temporary_open = false;
			effects.push(SessionEffect::CloseTemporary);
		}
		effects.push(SessionEffect::ClosePrimary);
		effects
	}
}
