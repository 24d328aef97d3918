#![forbid(unsafe_code)]

//! Async driver for [`EventSubSession`]: owns the sockets and timers and carries out the session's effects.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use athano_domain::{ChatEvent, UserId};
use futures_util::SinkExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::session::{EventSubSession, SessionEffect, SessionRole, SubscriptionRequest};
use crate::ws::{WsConnector, WsStream, arm, default_connector, fire, frame_text, next_frame, spawn_drain, stop_drain};

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

/// Creates EventSub subscriptions for a welcomed session.
#[async_trait]
pub trait Subscriber: Send + Sync {
	async fn subscribe(&self, req: &SubscriptionRequest) -> anyhow::Result<()>;
}

/// Receives decoded notifications, in arrival order, on its own task.
#[async_trait]
pub trait EventSink: Send + Sync {
	async fn handle(&self, event: ChatEvent);
}

pub struct EventSubClient {
	session: EventSubSession,
	connector: WsConnector,
	subscriber: Arc<dyn Subscriber>,
	sink: Arc<dyn EventSink>,
	events: Option<mpsc::UnboundedSender<ChatEvent>>,

	primary: Option<WsStream>,
	temporary: Option<WsStream>,
	watchdog: Option<Pin<Box<Sleep>>>,
	reconnect: Option<Pin<Box<Sleep>>>,
}

/// Running client. Dropping the handle leaves the task running; call [`EventSubHandle::dispose`].
pub struct EventSubHandle {
	shutdown: watch::Sender<bool>,
	task: JoinHandle<()>,
	drain: JoinHandle<()>,
}

impl EventSubHandle {
	pub fn is_finished(&self) -> bool {
		self.task.is_finished()
	}

	/// Cancel timers, close both sockets and wait for the task to end.
	pub async fn dispose(self) {
		let _ = self.shutdown.send(true);
		if let Err(e) = self.task.await {
			warn!(error = ?e, "eventsub task ended abnormally");
		}
		stop_drain(self.drain).await;
	}
}

impl EventSubClient {
	pub fn new(base_url: Url, subscriber: Arc<dyn Subscriber>, sink: Arc<dyn EventSink>) -> Self {
		Self::from_session(EventSubSession::new(base_url), subscriber, sink)
	}

	pub fn from_session(session: EventSubSession, subscriber: Arc<dyn Subscriber>, sink: Arc<dyn EventSink>) -> Self {
		Self {
			session,
			connector: default_connector(),
			subscriber,
			sink,
			events: None,
			primary: None,
			temporary: None,
			watchdog: None,
			reconnect: None,
		}
	}

	pub fn with_connector(mut self, connector: WsConnector) -> Self {
		self.connector = connector;
		self
	}

	pub fn spawn(mut self, broadcaster_id: UserId, user_id: UserId) -> EventSubHandle {
		let sink = self.sink.clone();
		let (events, drain) = spawn_drain(move |event: ChatEvent| {
			let sink = sink.clone();
			async move { sink.handle(event).await }
		});
		self.events = Some(events);

		let (shutdown, shutdown_rx) = watch::channel(false);
		let task = tokio::spawn(self.run(broadcaster_id, user_id, shutdown_rx));
		EventSubHandle { shutdown, task, drain }
	}

	async fn run(mut self, broadcaster_id: UserId, user_id: UserId, mut shutdown: watch::Receiver<bool>) {
		let effects = self.session.connect(broadcaster_id, user_id);
		if self.apply(effects, &mut shutdown).await.is_continue() {
			loop {
				let effects = tokio::select! {
					_ = shutdown.changed() => break,

					msg = next_frame(&mut self.primary) => self.on_primary_frame(msg).await,

					msg = next_frame(&mut self.temporary) => self.on_temporary_frame(msg).await,

					_ = fire(&mut self.watchdog) => {
						self.watchdog = None;
						self.session.on_watchdog_expired()
					}

					_ = fire(&mut self.reconnect) => {
						self.reconnect = None;
						self.session.on_reconnect_timer()
					}
				};

				if self.apply(effects, &mut shutdown).await.is_break() {
					break;
				}
			}
		}

		self.teardown().await;
	}

	async fn on_primary_frame(&mut self, msg: Option<Result<Message, tungstenite::Error>>) -> Vec<SessionEffect> {
		match msg {
			None => {
				info!("eventsub socket ended");
				self.drop_primary();
				self.session.on_primary_closed()
			}
			Some(Err(e)) => {
				warn!(error = %e, "eventsub socket read error");
				self.drop_primary();
				self.session.on_primary_closed()
			}
			Some(Ok(Message::Ping(p))) => {
				if let Some(ws) = self.primary.as_mut() {
					let _ = ws.send(Message::Pong(p)).await;
				}
				Vec::new()
			}
			Some(Ok(Message::Close(frame))) => {
				info!(?frame, "eventsub socket closed by server");
				self.drop_primary();
				self.session.on_primary_closed()
			}
			Some(Ok(msg)) => match frame_text(&msg) {
				Some(text) => self.session.on_text(SessionRole::Primary, text),
				None => Vec::new(),
			},
		}
	}

	async fn on_temporary_frame(&mut self, msg: Option<Result<Message, tungstenite::Error>>) -> Vec<SessionEffect> {
		match msg {
			None | Some(Ok(Message::Close(_))) => {
				self.temporary = None;
				self.session.on_temporary_closed()
			}
			Some(Err(e)) => {
				warn!(error = %e, "eventsub handover socket read error");
				self.temporary = None;
				self.session.on_temporary_failed()
			}
			Some(Ok(Message::Ping(p))) => {
				if let Some(ws) = self.temporary.as_mut() {
					let _ = ws.send(Message::Pong(p)).await;
				}
				Vec::new()
			}
			Some(Ok(msg)) => match frame_text(&msg) {
				Some(text) => self.session.on_text(SessionRole::Temporary, text),
				None => Vec::new(),
			},
		}
	}

	fn drop_primary(&mut self) {
		self.primary = None;
		self.watchdog = None;
	}

	async fn connect(&self, url: Url, shutdown: &mut watch::Receiver<bool>) -> Option<anyhow::Result<WsStream>> {
		let connecting = (self.connector)(url);
		tokio::select! {
			res = connecting => Some(res),
			_ = shutdown.changed() => None,
		}
	}

	/// Run effects in order, feeding follow-up effects back into the queue.
	async fn apply(&mut self, effects: Vec<SessionEffect>, shutdown: &mut watch::Receiver<bool>) -> ControlFlow<()> {
		let mut queue: VecDeque<SessionEffect> = effects.into();

		while let Some(effect) = queue.pop_front() {
			match effect {
				SessionEffect::Connect(url) => {
					self.drop_primary();
					debug!(url = %url, "eventsub connecting");
					let Some(res) = self.connect(url, shutdown).await else {
						return ControlFlow::Break(());
					};
					match res {
						Ok(ws) => {
							self.primary = Some(ws);
							queue.extend(self.session.on_open(SessionRole::Primary));
						}
						Err(e) => {
							warn!(error = ?e, "eventsub connect failed");
							queue.extend(self.session.on_connect_failed());
						}
					}
				}
				SessionEffect::OpenTemporary(url) => {
					self.temporary = None;
					let Some(res) = self.connect(url, shutdown).await else {
						return ControlFlow::Break(());
					};
					match res {
						Ok(ws) => {
							self.temporary = Some(ws);
							queue.extend(self.session.on_open(SessionRole::Temporary));
						}
						Err(e) => {
							warn!(error = ?e, "eventsub handover connect failed");
							queue.extend(self.session.on_temporary_failed());
						}
					}
				}
				SessionEffect::ClosePrimary => {
					self.watchdog = None;
					if let Some(mut ws) = self.primary.take() {
						let _ = ws.close(None).await;
						queue.extend(self.session.on_primary_closed());
					}
				}
				SessionEffect::CloseTemporary => {
					if let Some(mut ws) = self.temporary.take() {
						let _ = ws.close(None).await;
					}
				}
				SessionEffect::ArmWatchdog(period) => {
					if self.primary.is_some() {
						self.watchdog = arm(period);
					}
				}
				SessionEffect::ScheduleReconnect(delay) => {
					self.reconnect = arm(delay);
				}
				SessionEffect::Subscribe(req) => {
					let subscriber = self.subscriber.clone();
					tokio::spawn(async move {
						match subscriber.subscribe(&req).await {
							Ok(()) => info!(kind = %req.kind, session_id = %req.session_id, "eventsub subscribed"),
							Err(e) => error!(kind = %req.kind, error = ?e, "eventsub subscribe failed"),
						}
					});
				}
				SessionEffect::Dispatch(event) => {
					if let Some(events) = &self.events
						&& events.send(event).is_err()
					{
						warn!("eventsub sink stopped, notification dropped");
					}
				}
				SessionEffect::GiveUp => {
					return ControlFlow::Break(());
				}
			}
		}

		ControlFlow::Continue(())
	}

	async fn teardown(&mut self) {
		let _ = self.session.dispose();
		self.watchdog = None;
		self.reconnect = None;
		if let Some(mut ws) = self.temporary.take() {
			let _ = ws.close(None).await;
		}
		if let Some(mut ws) = self.primary.take() {
			let _ = ws.close(None).await;
		}
		debug!("eventsub client disposed");
	}
}
