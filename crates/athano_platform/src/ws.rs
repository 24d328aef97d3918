#![forbid(unsafe_code)]

//! Socket plumbing shared by the EventSub and push clients.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, Sleep};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<WsStream>> + Send + Sync>;

pub async fn connect_ws(url: Url) -> anyhow::Result<WsStream> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.with_context(|| format!("connect_async to {url}"))?;
	Ok(ws)
}

pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(async move { connect_ws(url).await }) as BoxFuture<'static, anyhow::Result<WsStream>>)
}

/// Next frame of an optional socket; pends forever when there is none.
pub(crate) async fn next_frame(ws: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
	match ws {
		Some(ws) => ws.next().await,
		None => std::future::pending().await,
	}
}

/// Resolves when an armed timer fires; pends forever when disarmed.
pub(crate) async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
	match timer {
		Some(t) => t.as_mut().await,
		None => std::future::pending().await,
	}
}

pub(crate) async fn tick(interval: &mut Option<Interval>) {
	match interval {
		Some(i) => {
			i.tick().await;
		}
		None => std::future::pending().await,
	}
}

pub(crate) fn arm(delay: Duration) -> Option<Pin<Box<Sleep>>> {
	Some(Box::pin(tokio::time::sleep(delay)))
}

const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval whose first tick is one full period away. The period is kept within `1ms..=24h`.
pub(crate) fn periodic(period: Duration) -> Interval {
	let period = period.clamp(Duration::from_millis(1), MAX_PERIOD);
	tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

/// Ordered hand-off from a socket loop to a consumer that may await the network.
///
/// Items are applied one at a time in send order; the socket loop never waits on `apply`.
pub(crate) fn spawn_drain<T, F, Fut>(mut apply: F) -> (mpsc::UnboundedSender<T>, JoinHandle<()>)
where
	T: Send + 'static,
	F: FnMut(T) -> Fut + Send + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	let (tx, mut rx) = mpsc::unbounded_channel();
	let task = tokio::spawn(async move {
		while let Some(item) = rx.recv().await {
			apply(item).await;
		}
	});
	(tx, task)
}

/// Stop a drain task; whatever it still holds is dropped.
pub(crate) async fn stop_drain(task: JoinHandle<()>) {
	task.abort();
	let _ = task.await;
}

/// Text payload of a frame; binary frames are accepted when they are UTF-8.
pub(crate) fn frame_text(msg: &Message) -> Option<&str> {
	match msg {
		Message::Text(t) => Some(t.as_str()),
		Message::Binary(b) => std::str::from_utf8(b).ok(),
		_ => None,
	}
}
