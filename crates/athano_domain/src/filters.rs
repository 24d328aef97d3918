#![forbid(unsafe_code)]

//! Exclude-only user/message filters and their URL-safe encoding.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ChatMessage;

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
	&alphabet::URL_SAFE,
	GeneralPurposeConfig::new()
		.with_encode_padding(false)
		.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
	Exact,
	Contains,
	Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
	pub match_type: MatchType,
	pub pattern: String,
	#[serde(default)]
	pub case_sensitive: bool,
}

impl FilterRule {
	pub fn new(match_type: MatchType, pattern: impl Into<String>, case_sensitive: bool) -> Self {
		Self {
			match_type,
			pattern: pattern.into(),
			case_sensitive,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
	#[serde(default)]
	pub rules: Vec<FilterRule>,
}

#[derive(Debug, Error)]
pub enum FilterError {
	#[error("invalid base64url: {0}")]
	Base64(#[from] base64::DecodeError),
	#[error("filter config is not utf-8")]
	Utf8(#[from] std::string::FromUtf8Error),
	#[error("invalid filter json: {0}")]
	Json(#[from] serde_json::Error),
	#[error("invalid rule pattern: {0}")]
	Pattern(#[from] regex::Error),
}

/// Regex body for one rule, before case handling.
fn rule_body(rule: &FilterRule) -> String {
	match rule.match_type {
		MatchType::Exact => format!("^{}$", regex::escape(&rule.pattern)),
		MatchType::Contains => regex::escape(&rule.pattern),
		MatchType::Wildcard => {
			let mut body = String::from("^");
			for ch in rule.pattern.chars() {
				match ch {
					'*' => body.push_str(".*"),
					'?' => body.push('.'),
					other => body.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
				}
			}
			body.push('$');
			body
		}
	}
}

/// Expand ASCII letters into `[xX]` classes so a single rule can ignore case.
fn expand_case_insensitive(body: &str) -> String {
	let mut out = String::with_capacity(body.len() * 4);
	for ch in body.chars() {
		if ch.is_ascii_alphabetic() {
			out.push('[');
			out.push(ch.to_ascii_lowercase());
			out.push(ch.to_ascii_uppercase());
			out.push(']');
		} else {
			out.push(ch);
		}
	}
	out
}

/// Full pattern for one rule, anchored where the chained lookahead would evaluate it.
pub fn rule_pattern(rule: &FilterRule) -> String {
	let mut body = rule_body(rule);
	if !rule.case_sensitive {
		body = expand_case_insensitive(&body);
	}
	if rule.match_type == MatchType::Contains {
		body = format!(".*{body}.*");
	}
	format!("^(?:{body})")
}

/// Compiled exclude-only matcher: a string is admitted when no rule matches it.
#[derive(Debug, Clone)]
pub struct FilterMatcher {
	rules: Vec<Regex>,
}

impl FilterMatcher {
	/// `None` when the config has no usable (non-empty) rule.
	pub fn build(cfg: &FilterConfig) -> Result<Option<Self>, FilterError> {
		let mut rules = Vec::new();
		for rule in cfg.rules.iter().filter(|r| !r.pattern.is_empty()) {
			rules.push(Regex::new(&rule_pattern(rule))?);
		}

		if rules.is_empty() {
			return Ok(None);
		}
		Ok(Some(Self { rules }))
	}

	pub fn admits(&self, value: &str) -> bool {
		!self.rules.iter().any(|re| re.is_match(value))
	}
}

/// Username and message-text filters applied together.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
	pub username: Option<FilterMatcher>,
	pub message: Option<FilterMatcher>,
}

impl MessageFilter {
	pub fn from_configs(username: &FilterConfig, message: &FilterConfig) -> Result<Self, FilterError> {
		Ok(Self {
			username: FilterMatcher::build(username)?,
			message: FilterMatcher::build(message)?,
		})
	}

	pub fn is_empty(&self) -> bool {
		self.username.is_none() && self.message.is_none()
	}

	pub fn admits(&self, msg: &ChatMessage) -> bool {
		let user_ok = self.username.as_ref().is_none_or(|m| m.admits(&msg.chatter_user_name));
		let text_ok = self.message.as_ref().is_none_or(|m| m.admits(&msg.message.text));
		user_ok && text_ok
	}
}

/// base64url (unpadded) JSON of `cfg`; the empty config encodes to `""`.
pub fn encode_filters(cfg: &FilterConfig) -> String {
	if cfg.rules.is_empty() {
		return String::new();
	}
	match serde_json::to_string(cfg) {
		Ok(json) => URL_SAFE_LENIENT.encode(json),
		Err(_) => String::new(),
	}
}

pub fn try_decode_filters(encoded: &str) -> Result<FilterConfig, FilterError> {
	let encoded = encoded.trim();
	if encoded.is_empty() {
		return Ok(FilterConfig::default());
	}
	let bytes = URL_SAFE_LENIENT.decode(encoded)?;
	let json = String::from_utf8(bytes)?;
	Ok(serde_json::from_str(&json)?)
}

/// Lenient decode: anything unreadable yields the empty config.
pub fn decode_filters(encoded: &str) -> FilterConfig {
	try_decode_filters(encoded).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn matcher(rules: Vec<FilterRule>) -> FilterMatcher {
		FilterMatcher::build(&FilterConfig { rules }).unwrap().unwrap()
	}

	#[test]
	fn contains_insensitive_excludes_any_case() {
		let m = matcher(vec![FilterRule::new(MatchType::Contains, "bot", false)]);
		assert!(!m.admits("NightBot"));
		assert!(!m.admits("nightbot"));
		assert!(m.admits("alice"));
	}

	#[test]
	fn exact_sensitive_only_excludes_exact_case() {
		let m = matcher(vec![FilterRule::new(MatchType::Exact, "Mod", true)]);
		assert!(!m.admits("Mod"));
		assert!(m.admits("MOD"));
		assert!(m.admits("Mod1"));
	}

	#[test]
	fn exact_insensitive_and_contains_sensitive() {
		let exact = matcher(vec![FilterRule::new(MatchType::Exact, "Alice", false)]);
		assert!(!exact.admits("ALICE"));
		assert!(exact.admits("Alice1"));

		let contains = matcher(vec![FilterRule::new(MatchType::Contains, "foo", true)]);
		assert!(!contains.admits("foobar"));
		assert!(contains.admits("FOObar"));
	}

	#[test]
	fn wildcard_translates_star_and_question_mark() {
		let m = matcher(vec![FilterRule::new(MatchType::Wildcard, "a*e", true)]);
		assert!(!m.admits("axe"));
		assert!(!m.admits("ae"));
		assert!(m.admits("Axe"));

		let q = matcher(vec![FilterRule::new(MatchType::Wildcard, "b?t", false)]);
		assert!(!q.admits("BOT"));
		assert!(q.admits("boot"));
	}

	#[test]
	fn metacharacters_are_literal() {
		let m = matcher(vec![FilterRule::new(MatchType::Contains, "a.b", true)]);
		assert!(!m.admits("xa.by"));
		assert!(m.admits("axb"));

		let w = matcher(vec![FilterRule::new(MatchType::Wildcard, "(x)*", true)]);
		assert!(!w.admits("(x)yz"));
	}

	#[test]
	fn mixed_rules_are_independent() {
		let m = matcher(vec![
			FilterRule::new(MatchType::Exact, "Mod", true),
			FilterRule::new(MatchType::Contains, "bot", false),
		]);
		assert!(!m.admits("Mod"));
		assert!(m.admits("MOD"));
		assert!(!m.admits("NightBot"));
	}

	#[test]
	fn empty_patterns_build_no_matcher() {
		let cfg = FilterConfig {
			rules: vec![FilterRule::new(MatchType::Contains, "", false)],
		};
		assert!(FilterMatcher::build(&cfg).unwrap().is_none());
		assert!(FilterMatcher::build(&FilterConfig::default()).unwrap().is_none());
	}

	#[test]
	fn empty_config_encodes_to_empty_string() {
		assert_eq!(encode_filters(&FilterConfig::default()), "");
		assert_eq!(decode_filters(""), FilterConfig::default());
	}

	#[test]
	fn encoded_config_is_url_safe_and_decodes_back() {
		let cfg = FilterConfig {
			rules: vec![
				FilterRule::new(MatchType::Wildcard, "???>>>*", true),
				FilterRule::new(MatchType::Exact, "Mod", false),
			],
		};
		let encoded = encode_filters(&cfg);
		assert!(!encoded.contains('+') && !encoded.contains('/') && !encoded.contains('='));
		assert_eq!(decode_filters(&encoded), cfg);
	}

	#[test]
	fn decodes_camel_case_wire_format_and_defaults_case_sensitivity() {
		let json = r#"{"rules":[{"matchType":"contains","pattern":"bot"}]}"#;
		let encoded = URL_SAFE_LENIENT.encode(json);
		let cfg = decode_filters(&encoded);
		assert_eq!(cfg.rules, vec![FilterRule::new(MatchType::Contains, "bot", false)]);
	}

	#[test]
	fn garbage_decodes_to_empty_config() {
		assert_eq!(decode_filters("!!!not-base64"), FilterConfig::default());
		assert_eq!(decode_filters(&URL_SAFE_LENIENT.encode("{\"nope\":1")), FilterConfig::default());
		assert!(try_decode_filters("!!!").is_err());
	}
}
