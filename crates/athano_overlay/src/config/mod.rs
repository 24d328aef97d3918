#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use athano_domain::filters::{FilterConfig, decode_filters};
use athano_platform::SecretString;
use athano_platform::store::DEFAULT_MESSAGES_TO_RETAIN;
use athano_platform::twitch::{DEFAULT_EVENTSUB_WS_URL, DEFAULT_HELIX_BASE_URL};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.athano/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".athano").join("config.toml"))
}

/// Load the overlay config from TOML, then apply `ATHANO_*` env overrides.
pub fn load_overlay_config_from_path(path: &Path) -> anyhow::Result<OverlayConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = OverlayConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
	pub twitch: TwitchSettings,
	pub providers: ProviderSettings,
	pub overlay: OverlaySettings,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: String,
	/// User access token (bearer). Empty means no live connections.
	pub access_token: SecretString,
	/// Channel login; the token owner's channel when unset.
	pub channel: Option<String>,
	pub eventsub_ws_url: String,
	pub helix_base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSettings {
	pub seventv: bool,
	pub bttv: bool,
	pub ffz: bool,
}

#[derive(Debug, Clone)]
pub struct OverlaySettings {
	/// 0 keeps every message.
	pub messages_to_retain: usize,
	pub username_filters: FilterConfig,
	pub message_filters: FilterConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	providers: FileProviderSettings,

	#[serde(default)]
	overlay: FileOverlaySettings,

	#[serde(default)]
	metrics: FileMetricsSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	access_token: Option<String>,
	channel: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProviderSettings {
	seventv: Option<bool>,
	bttv: Option<bool>,
	ffz: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOverlaySettings {
	messages_to_retain: Option<usize>,
	username_filters: Option<String>,
	message_filters: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMetricsSettings {
	bind: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl OverlayConfig {
	fn from_file(file: FileConfig) -> Self {
		let twitch = TwitchSettings {
			client_id: non_blank(file.twitch.client_id).unwrap_or_default(),
			access_token: SecretString::new(non_blank(file.twitch.access_token).unwrap_or_default()),
			channel: non_blank(file.twitch.channel),
			eventsub_ws_url: non_blank(file.twitch.eventsub_ws_url).unwrap_or_else(|| DEFAULT_EVENTSUB_WS_URL.to_string()),
			helix_base_url: non_blank(file.twitch.helix_base_url).unwrap_or_else(|| DEFAULT_HELIX_BASE_URL.to_string()),
		};

		Self {
			twitch,
			providers: ProviderSettings {
				seventv: file.providers.seventv.unwrap_or(true),
				bttv: file.providers.bttv.unwrap_or(true),
				ffz: file.providers.ffz.unwrap_or(true),
			},
			overlay: OverlaySettings {
				messages_to_retain: file.overlay.messages_to_retain.unwrap_or(DEFAULT_MESSAGES_TO_RETAIN),
				username_filters: non_blank(file.overlay.username_filters)
					.map(|s| decode_filters(&s))
					.unwrap_or_default(),
				message_filters: non_blank(file.overlay.message_filters)
					.map(|s| decode_filters(&s))
					.unwrap_or_default(),
			},
			metrics_bind: non_blank(file.metrics.bind),
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut OverlayConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_blank(env(key));

	if let Some(v) = var("ATHANO_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = v;
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("ATHANO_TWITCH_ACCESS_TOKEN") {
		cfg.twitch.access_token = SecretString::new(v);
		info!("twitch config: access_token overridden by env");
	}

	if let Some(v) = var("ATHANO_TWITCH_CHANNEL") {
		cfg.twitch.channel = Some(v);
		info!("twitch config: channel overridden by env");
	}

	if let Some(v) = var("ATHANO_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = v;
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = var("ATHANO_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = v;
		info!("twitch config: helix_base_url overridden by env");
	}

	for (key, slot) in [
		("ATHANO_SEVENTV_ENABLED", &mut cfg.providers.seventv),
		("ATHANO_BTTV_ENABLED", &mut cfg.providers.bttv),
		("ATHANO_FFZ_ENABLED", &mut cfg.providers.ffz),
	] {
		if let Some(v) = var(key) {
			match parse_env_bool(&v) {
				Some(enabled) => {
					*slot = enabled;
					info!(env = key, enabled, "provider config: overridden by env");
				}
				None => warn!(env = key, value = %v, "ignoring non-boolean env value"),
			}
		}
	}

	if let Some(v) = var("ATHANO_MESSAGES_TO_RETAIN")
		&& let Ok(retain) = v.parse::<usize>()
	{
		cfg.overlay.messages_to_retain = retain;
		info!(retain, "overlay config: messages_to_retain overridden by env");
	}

	if let Some(v) = var("ATHANO_USERNAME_FILTERS") {
		cfg.overlay.username_filters = decode_filters(&v);
		info!(
			rules = cfg.overlay.username_filters.rules.len(),
			"overlay config: username_filters overridden by env"
		);
	}

	if let Some(v) = var("ATHANO_MESSAGE_FILTERS") {
		cfg.overlay.message_filters = decode_filters(&v);
		info!(
			rules = cfg.overlay.message_filters.rules.len(),
			"overlay config: message_filters overridden by env"
		);
	}

	if let Some(v) = var("ATHANO_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("overlay config: metrics_bind overridden by env");
	}

	if cfg.twitch.access_token.is_empty() {
		warn!("twitch config: no access_token configured; emotes and chat stay offline");
	}
	if cfg.twitch.client_id.is_empty() {
		warn!("twitch config: no client_id configured");
	}
}
