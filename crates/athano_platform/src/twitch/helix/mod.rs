#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use athano_domain::{UserId, UserProfile};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use url::Url;

use super::client::Subscriber;
use super::dispatcher::ProfileLookup;
use super::session::SubscriptionRequest;
use crate::SecretString;

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const USERS_PATH: &str = "/helix/users";
const TOKEN_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest advertised rate-limit delay honoured before the single retry.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

fn http_client(user_agent: &str) -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent(user_agent)
		.timeout(HTTP_TIMEOUT)
		.connect_timeout(CONNECT_TIMEOUT)
		.build()
		.context("build reqwest client")
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs).min(MAX_RETRY_DELAY));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now).min(MAX_RETRY_DELAY));
		}
	}

	None
}

/// Send once, retrying a single time on 429 (after the advertised delay) or 5xx. Auth failures are never retried.
pub(crate) async fn send_with_retry(
	req: reqwest::RequestBuilder,
	label: &'static str,
) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// `GET id.twitch.tv/oauth2/validate` response.
#[derive(Debug, Clone, Deserialize)]
pub struct TwitchTokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	#[serde(default)]
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

/// Global or broadcaster-scoped catalogue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogueScope {
	Global,
	Channel(UserId),
}

impl CatalogueScope {
	pub fn label(&self) -> &'static str {
		match self {
			CatalogueScope::Global => "global",
			CatalogueScope::Channel(_) => "channel",
		}
	}
}

#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: SecretString,
}

#[derive(Debug, Serialize)]
struct HelixChatMessageCondition<'a> {
	broadcaster_user_id: &'a str,
	user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'a str,
	session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'static str,
	version: &'static str,
	condition: HelixChatMessageCondition<'a>,
	transport: HelixWebsocketTransport<'a>,
}

impl<'a> HelixCreateSubscriptionRequest<'a> {
	fn from_request(req: &'a SubscriptionRequest) -> Self {
		Self {
			r#type: req.kind.as_str(),
			version: "1",
			condition: HelixChatMessageCondition {
				broadcaster_user_id: req.broadcaster_user_id.as_str(),
				user_id: req.user_id.as_str(),
			},
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id: &req.session_id,
			},
		}
	}
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
	data: Vec<UserProfile>,
}

#[derive(Debug, Deserialize)]
struct HelixDataResponse<T> {
	#[serde(default = "Vec::new")]
	data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixBadgeSet {
	pub set_id: String,
	#[serde(default)]
	pub versions: Vec<HelixBadgeVersion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixBadgeVersion {
	pub id: String,
	#[serde(default)]
	pub title: Option<String>,
	#[serde(default)]
	pub image_url_1x: String,
	#[serde(default)]
	pub image_url_4x: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixCheermote {
	pub prefix: String,
	#[serde(default)]
	pub tiers: Vec<HelixCheermoteTier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixCheermoteTier {
	pub min_bits: u64,
	#[serde(default)]
	pub color: String,
	#[serde(default)]
	pub images: serde_json::Value,
}

impl HelixCheermoteTier {
	/// `images.dark.animated["4"]`.
	pub fn dark_animated_4x(&self) -> Option<&str> {
		self.images.get("dark")?.get("animated")?.get("4")?.as_str()
	}
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: impl Into<String>, bearer_token: SecretString) -> anyhow::Result<Self> {
		let http = http_client("athano/0.x (eventsub-ws)")?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
			bearer_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token.expose()))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	pub fn bearer_token(&self) -> &SecretString {
		&self.bearer_token
	}

	pub async fn create_eventsub_subscription(&self, req: &SubscriptionRequest) -> anyhow::Result<()> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let kind = req.kind.as_str();
		let body = HelixCreateSubscriptionRequest::from_request(req);

		let resp = send_with_retry(
			self.authed(self.http.post(url)).json(&body),
			"POST /helix/eventsub/subscriptions",
		)
		.await
		.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		let text = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if status == StatusCode::CONFLICT {
			anyhow::bail!("helix create subscription conflict (type={kind}): body={text}");
		}
		if !status.is_success() {
			anyhow::bail!("helix create subscription failed (type={kind}): status={status} body={text}");
		}
		Ok(())
	}

	pub async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserProfile>> {
		let url = self.url(&format!("{USERS_PATH}?login={}", urlencoding::encode(login)))?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/users")
			.await
			.context("helix GET /helix/users send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		Ok(parsed.data.into_iter().next())
	}

	pub async fn chat_badges(&self, scope: &CatalogueScope) -> anyhow::Result<Vec<HelixBadgeSet>> {
		let path = match scope {
			CatalogueScope::Global => "/helix/chat/badges/global".to_string(),
			CatalogueScope::Channel(id) => {
				format!("/helix/chat/badges?broadcaster_id={}", urlencoding::encode(id.as_str()))
			}
		};
		let resp = send_with_retry(self.authed(self.http.get(self.url(&path)?)), "GET /helix/chat/badges")
			.await
			.context("twitch badges request")?
			.error_for_status()
			.context("twitch badges status")?;

		let body: HelixDataResponse<HelixBadgeSet> = resp.json().await.context("twitch badges json")?;
		Ok(body.data)
	}

	pub async fn cheermotes(&self, scope: &CatalogueScope) -> anyhow::Result<Vec<HelixCheermote>> {
		let path = match scope {
			CatalogueScope::Global => "/helix/bits/cheermotes".to_string(),
			CatalogueScope::Channel(id) => {
				format!("/helix/bits/cheermotes?broadcaster_id={}", urlencoding::encode(id.as_str()))
			}
		};
		let resp = send_with_retry(self.authed(self.http.get(self.url(&path)?)), "GET /helix/bits/cheermotes")
			.await
			.context("twitch cheermotes request")?
			.error_for_status()
			.context("twitch cheermotes status")?;

		let body: HelixDataResponse<HelixCheermote> = resp.json().await.context("twitch cheermotes json")?;
		Ok(body.data)
	}
}

pub async fn validate_user_token(access_token: &SecretString) -> anyhow::Result<TwitchTokenValidation> {
	let http = http_client("athano/0.x (oauth-validate)")?;

	let resp = http
		.get(TOKEN_VALIDATE_URL)
		.header("Authorization", format!("OAuth {}", access_token.expose()))
		.send()
		.await
		.context("twitch validate token request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch validate token read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch validate token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch validate token parse json")
}

#[async_trait]
impl Subscriber for HelixClient {
	async fn subscribe(&self, req: &SubscriptionRequest) -> anyhow::Result<()> {
		self.create_eventsub_subscription(req).await
	}
}

#[async_trait]
impl ProfileLookup for HelixClient {
	async fn profile_by_login(&self, login: &str) -> anyhow::Result<Option<UserProfile>> {
		self.user_by_login(login).await
	}
}
