#![forbid(unsafe_code)]

mod config;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use athano_domain::filters::MessageFilter;
use athano_platform::Store;
use athano_platform::render::{RenderToken, render_message};
use athano_platform::twitch::{HelixClient, LoaderConfig, load_broadcaster};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::config::OverlayConfig;

const RENDER_INTERVAL: Duration = Duration::from_millis(500);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: athano_overlay [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.athano/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter =
		std::env::var("RUST_LOG").unwrap_or_else(|_| "info,athano_platform=debug,athano_overlay=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn loader_config(cfg: &OverlayConfig) -> anyhow::Result<LoaderConfig> {
	Ok(LoaderConfig {
		channel: cfg.twitch.channel.clone(),
		eventsub_ws_url: Url::parse(&cfg.twitch.eventsub_ws_url).context("parse eventsub_ws_url")?,
		seventv: cfg.providers.seventv,
		bttv: cfg.providers.bttv,
		ffz: cfg.providers.ffz,
	})
}

/// Renders each newly visible message once, until shutdown.
async fn render_loop(store: Arc<Store>, filter: MessageFilter, mut shutdown: watch::Receiver<bool>) {
	let mut seen: HashSet<String> = HashSet::new();
	let mut tick = tokio::time::interval(RENDER_INTERVAL);

	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			_ = tick.tick() => {}
		}

		let visible = store.visible_messages(&filter);
		let tables = store.render_tables();
		let mut current = HashSet::with_capacity(visible.len());

		for msg in &visible {
			current.insert(msg.message_id.clone());
			if seen.contains(&msg.message_id) {
				continue;
			}

			let rendered = render_message(msg, &tables);
			let emotes = rendered
				.tokens
				.iter()
				.filter(|t| matches!(t, RenderToken::Emote { .. }))
				.count();
			metrics::counter!("athano_messages_rendered_total").increment(1);
			info!(
				message_id = %msg.message_id,
				chatter = %msg.chatter_user_name,
				badges = rendered.badges.len(),
				tokens = rendered.tokens.len(),
				emotes,
				"message rendered"
			);
			debug!(tokens = ?rendered.tokens, "render tokens");
		}

		seen = current;
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_overlay_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded overlay config (toml + env overrides)");

	init_metrics(cfg.metrics_bind.as_deref());

	let filter = MessageFilter::from_configs(&cfg.overlay.username_filters, &cfg.overlay.message_filters)
		.unwrap_or_else(|e| {
			warn!(error = %e, "filter rules rejected, showing every message");
			MessageFilter::default()
		});

	let store = Arc::new(Store::new(cfg.overlay.messages_to_retain));
	let helix = HelixClient::new(
		Url::parse(&cfg.twitch.helix_base_url).context("parse helix_base_url")?,
		cfg.twitch.client_id.clone(),
		cfg.twitch.access_token.clone(),
	)?;

	let loaded = load_broadcaster(helix, store.clone(), &loader_config(&cfg)?).await?;
	if loaded.is_none() {
		info!("overlay idle: no broadcaster to follow");
	}

	let (shutdown, shutdown_rx) = watch::channel(false);
	let renderer = tokio::spawn(render_loop(store.clone(), filter, shutdown_rx));

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutting down");

	let _ = shutdown.send(true);
	if let Some(loaded) = loaded {
		loaded.dispose().await;
	}
	if let Err(e) = renderer.await {
		warn!(error = %e, "render loop ended abnormally");
	}

	Ok(())
}
