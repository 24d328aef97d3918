#![forbid(unsafe_code)]

//! Provider push sockets (7TV event API, BetterTTV).
//!
//! Each provider is a [`PushProtocol`] state machine: transition methods take what happened on the socket or a timer
//! and return the [`PushEffect`]s to carry out. [`PushClient`] is the async driver that owns the socket and timers,
//! applies effects in order and forwards emote changes to an [`EmoteSink`].

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, Sleep};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::ws::{
	WsConnector, WsStream, arm, default_connector, fire, frame_text, next_frame, periodic, spawn_drain, stop_drain, tick,
};

pub mod bttv;
pub mod seventv;

pub use bttv::{BTTV_WS_URL, BttvPush};
pub use seventv::{SEVENTV_WS_URL, SevenTvPush};

/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;
const NO_STATUS_CLOSE: u16 = 1005;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEffect<E> {
	Connect(Url),
	Send(String),
	Close { code: u16, reason: String },
	StartHeartbeat(Duration),
	StopHeartbeat,
	ScheduleReconnect(Duration),
	ScheduleJoin(Duration),
	Add(E),
	Remove(String),
	/// Retry budget spent; the driver stops.
	GiveUp,
}

/// How a socket went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketClosed {
	pub code: u16,
	pub reason: String,
	pub clean: bool,
}

impl SocketClosed {
	pub fn clean(code: u16, reason: impl Into<String>) -> Self {
		Self {
			code,
			reason: reason.into(),
			clean: true,
		}
	}

	pub fn abnormal() -> Self {
		Self {
			code: ABNORMAL_CLOSE,
			reason: String::new(),
			clean: false,
		}
	}
}

pub trait PushProtocol: Send + 'static {
	type Emote: Send + 'static;

	/// Label used in logs and metrics.
	fn name(&self) -> &'static str;

	fn start(&mut self) -> Vec<PushEffect<Self::Emote>>;

	fn on_open(&mut self) -> Vec<PushEffect<Self::Emote>>;

	fn on_text(&mut self, text: &str) -> Vec<PushEffect<Self::Emote>>;

	fn on_close(&mut self, closed: SocketClosed) -> Vec<PushEffect<Self::Emote>>;

	fn on_connect_failed(&mut self, error: &str) -> Vec<PushEffect<Self::Emote>>;

	fn on_heartbeat_tick(&mut self) -> Vec<PushEffect<Self::Emote>> {
		Vec::new()
	}

	fn on_reconnect_timer(&mut self) -> Vec<PushEffect<Self::Emote>>;

	fn on_join_timer(&mut self) -> Vec<PushEffect<Self::Emote>> {
		Vec::new()
	}

	/// A `Send` effect could not be written to the socket.
	fn on_send_failed(&mut self, _text: &str) -> Vec<PushEffect<Self::Emote>> {
		Vec::new()
	}

	/// Cancel every timer and close the socket. Calling it twice yields nothing the second time.
	fn dispose(&mut self) -> Vec<PushEffect<Self::Emote>>;
}

/// Registry side of a push client.
#[async_trait]
pub trait EmoteSink<E>: Send + Sync {
	async fn add(&self, emote: E);

	fn remove(&self, emote_id: &str);
}

/// Emote change waiting to be applied to the sink.
enum SinkOp<E> {
	Add(E),
	Remove(String),
}

pub struct PushClient<P: PushProtocol> {
	protocol: P,
	connector: WsConnector,
	sink: Arc<dyn EmoteSink<P::Emote>>,
	ops: Option<mpsc::UnboundedSender<SinkOp<P::Emote>>>,

	socket: Option<WsStream>,
	heartbeat: Option<Interval>,
	reconnect: Option<Pin<Box<Sleep>>>,
	join: Option<Pin<Box<Sleep>>>,
}

pub struct PushHandle {
	name: &'static str,
	shutdown: watch::Sender<bool>,
	task: JoinHandle<()>,
	drain: JoinHandle<()>,
}

impl PushHandle {
	pub fn is_finished(&self) -> bool {
		self.task.is_finished()
	}

	pub async fn dispose(self) {
		let _ = self.shutdown.send(true);
		if let Err(e) = self.task.await {
			warn!(client = self.name, error = ?e, "push task ended abnormally");
		}
		stop_drain(self.drain).await;
	}
}

impl<P: PushProtocol> PushClient<P> {
	pub fn new(protocol: P, sink: Arc<dyn EmoteSink<P::Emote>>) -> Self {
		Self {
			protocol,
			connector: default_connector(),
			sink,
			ops: None,
			socket: None,
			heartbeat: None,
			reconnect: None,
			join: None,
		}
	}

	pub fn with_connector(mut self, connector: WsConnector) -> Self {
		self.connector = connector;
		self
	}

	pub fn spawn(mut self) -> PushHandle {
		let name = self.protocol.name();
		let sink = self.sink.clone();
		let (ops, drain) = spawn_drain(move |op: SinkOp<P::Emote>| {
			let sink = sink.clone();
			async move {
				match op {
					SinkOp::Add(emote) => sink.add(emote).await,
					SinkOp::Remove(id) => sink.remove(&id),
				}
			}
		});
		self.ops = Some(ops);

		let (shutdown, shutdown_rx) = watch::channel(false);
		let task = tokio::spawn(self.run(shutdown_rx));
		PushHandle {
			name,
			shutdown,
			task,
			drain,
		}
	}

	async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
		let effects = self.protocol.start();
		if self.apply(effects, &mut shutdown).await.is_continue() {
			loop {
				let effects = tokio::select! {
					_ = shutdown.changed() => break,

					msg = next_frame(&mut self.socket) => self.on_frame(msg).await,

					_ = tick(&mut self.heartbeat) => self.protocol.on_heartbeat_tick(),

					_ = fire(&mut self.reconnect) => {
						self.reconnect = None;
						self.protocol.on_reconnect_timer()
					}

					_ = fire(&mut self.join) => {
						self.join = None;
						self.protocol.on_join_timer()
					}
				};

				if self.apply(effects, &mut shutdown).await.is_break() {
					break;
				}
			}
		}

		self.teardown().await;
	}

	async fn on_frame(&mut self, msg: Option<Result<Message, tungstenite::Error>>) -> Vec<PushEffect<P::Emote>> {
		let name = self.protocol.name();
		match msg {
			None => {
				self.socket = None;
				self.protocol.on_close(SocketClosed::abnormal())
			}
			Some(Err(e)) => {
				warn!(client = name, error = %e, "push socket read error");
				self.socket = None;
				self.protocol.on_close(SocketClosed::abnormal())
			}
			Some(Ok(Message::Ping(p))) => {
				if let Some(ws) = self.socket.as_mut() {
					let _ = ws.send(Message::Pong(p)).await;
				}
				Vec::new()
			}
			Some(Ok(Message::Close(frame))) => {
				self.socket = None;
				let closed = match frame {
					Some(f) => SocketClosed::clean(u16::from(f.code), f.reason.as_str()),
					None => SocketClosed::clean(NO_STATUS_CLOSE, ""),
				};
				self.protocol.on_close(closed)
			}
			Some(Ok(msg)) => match frame_text(&msg) {
				Some(text) => self.protocol.on_text(text),
				None => Vec::new(),
			},
		}
	}

	async fn apply(&mut self, effects: Vec<PushEffect<P::Emote>>, shutdown: &mut watch::Receiver<bool>) -> ControlFlow<()> {
		let name = self.protocol.name();
		let mut queue: VecDeque<_> = effects.into();

		while let Some(effect) = queue.pop_front() {
			match effect {
				PushEffect::Connect(url) => {
					self.socket = None;
					debug!(client = name, url = %url, "push connecting");
					let connecting = (self.connector)(url);
					let res = tokio::select! {
						res = connecting => res,
						_ = shutdown.changed() => return ControlFlow::Break(()),
					};
					match res {
						Ok(ws) => {
							info!(client = name, "push socket connected");
							self.socket = Some(ws);
							queue.extend(self.protocol.on_open());
						}
						Err(e) => {
							warn!(client = name, error = ?e, "push connect failed");
							queue.extend(self.protocol.on_connect_failed(&e.to_string()));
						}
					}
				}
				PushEffect::Send(text) => match self.socket.as_mut() {
					Some(ws) => {
						if let Err(e) = ws.send(Message::text(text.clone())).await {
							warn!(client = name, error = %e, "push send failed");
							queue.extend(self.protocol.on_send_failed(&text));
						}
					}
					None => {
						debug!(client = name, "push send skipped, socket closed");
						queue.extend(self.protocol.on_send_failed(&text));
					}
				},
				PushEffect::Close { code, reason } => {
					if let Some(mut ws) = self.socket.take() {
						let frame = CloseFrame {
							code: CloseCode::from(code),
							reason: reason.clone().into(),
						};
						let _ = ws.close(Some(frame)).await;
						queue.extend(self.protocol.on_close(SocketClosed::clean(code, reason)));
					}
				}
				PushEffect::StartHeartbeat(period) => {
					self.heartbeat = Some(periodic(period));
				}
				PushEffect::StopHeartbeat => {
					self.heartbeat = None;
				}
				PushEffect::ScheduleReconnect(delay) => {
					self.reconnect = arm(delay);
				}
				PushEffect::ScheduleJoin(delay) => {
					self.join = arm(delay);
				}
				PushEffect::Add(emote) => self.forward(SinkOp::Add(emote)),
				PushEffect::Remove(id) => self.forward(SinkOp::Remove(id)),
				PushEffect::GiveUp => return ControlFlow::Break(()),
			}
		}

		ControlFlow::Continue(())
	}

	fn forward(&self, op: SinkOp<P::Emote>) {
		if let Some(ops) = &self.ops
			&& ops.send(op).is_err()
		{
			warn!(client = self.protocol.name(), "emote sink stopped, change dropped");
		}
	}

	async fn teardown(&mut self) {
		let _ = self.protocol.dispose();
		self.heartbeat = None;
		self.reconnect = None;
		self.join = None;
		if let Some(mut ws) = self.socket.take() {
			let _ = ws.close(None).await;
		}
		debug!(client = self.protocol.name(), "push client disposed");
	}
}
