#![forbid(unsafe_code)]

//! Render-time resolution of a chat message into text, emote and cheer tokens.

use std::collections::HashMap;
use std::sync::OnceLock;

use athano_domain::{
	ChatBadge, ChatCheer, ChatMessage, EmoteOrigin, EmoteRecord, Fragment, FragmentKind, MessageBadge, ModifierTag,
	bttv_modifier_trigger,
};
use regex::Regex;
use tracing::debug;

const TWITCH_EMOTE_CDN: &str = "https://static-cdn.jtvnw.net/emoticons/v2";
const TWEMOJI_SVG_BASE: &str = "https://cdn.jsdelivr.net/gh/jdecked/twemoji@latest/assets/svg";

/// Twemoji does not ship images for these.
const TWEMOJI_EXCLUDED: [&str; 3] = ["a9", "ae", "2122"];

const ZWJ: char = '\u{200D}';
const VS16: char = '\u{FE0F}';

/// Snapshot of the lookup tables a render pass reads.
#[derive(Debug, Clone, Default)]
pub struct RenderTables {
	pub emotes: HashMap<String, EmoteRecord>,
	pub badges: HashMap<String, ChatBadge>,
	pub cheers: Vec<ChatCheer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderToken {
	Text(String),
	Emote {
		text: String,
		emote: EmoteRecord,
		modifiers: Vec<ModifierTag>,
		/// Zero-width emotes stacked on top of `emote`.
		overlays: Vec<EmoteRecord>,
	},
	Cheer {
		text: String,
		cheer: ChatCheer,
		bits: u64,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
	pub badges: Vec<ChatBadge>,
	pub tokens: Vec<RenderToken>,
}

pub fn render_message(msg: &ChatMessage, tables: &RenderTables) -> RenderedMessage {
	RenderedMessage {
		badges: resolve_badges(&msg.badges, tables),
		tokens: resolve_fragments(&msg.message.fragments, tables),
	}
}

/// Badge images for a message, in message order. Unknown badges are dropped.
pub fn resolve_badges(badges: &[MessageBadge], tables: &RenderTables) -> Vec<ChatBadge> {
	badges
		.iter()
		.filter_map(|b| {
			let key = b.key();
			let found = tables.badges.get(&key).cloned();
			if found.is_none() {
				debug!(badge = %key, "badge not in catalogue");
			}
			found
		})
		.collect()
}

/// Highest tier whose threshold is at most `bits`; prefixes compare case-insensitively.
pub fn find_cheer<'a>(cheers: &'a [ChatCheer], prefix: &str, bits: u64) -> Option<&'a ChatCheer> {
	cheers
		.iter()
		.filter(|c| c.prefix.eq_ignore_ascii_case(prefix) && c.min_bits <= bits)
		.max_by_key(|c| c.min_bits)
}

pub fn twitch_emote(id: &str, text: &str) -> EmoteRecord {
	EmoteRecord {
		origin: EmoteOrigin::Twitch,
		id: id.to_string(),
		name: text.to_string(),
		src: format!("{TWITCH_EMOTE_CDN}/{id}/default/dark/3.0"),
		width: None,
		height: None,
		modifier: false,
		hidden: false,
		modifier_flags: 0,
	}
}

static EMOJI_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn emoji_re() -> Option<&'static Regex> {
	EMOJI_RE
		.get_or_init(|| {
			Regex::new(
				r"(?x)
				[\x{1F1E6}-\x{1F1FF}]{2}
				| \p{Extended_Pictographic} [\x{FE0F}\x{1F3FB}-\x{1F3FF}]?
				  (?: \x{200D} \p{Extended_Pictographic} [\x{FE0F}\x{1F3FB}-\x{1F3FF}]? )*
				",
			)
			.ok()
		})
		.as_ref()
}

/// Twemoji file name: lowercase hex codepoints joined by `-`, dropping VS16 unless the sequence has a ZWJ.
pub fn twemoji_icon(seq: &str) -> String {
	let keep_vs16 = seq.contains(ZWJ);
	seq.chars()
		.filter(|&c| keep_vs16 || c != VS16)
		.map(|c| format!("{:x}", c as u32))
		.collect::<Vec<_>>()
		.join("-")
}

fn emoji_record(seq: &str) -> Option<EmoteRecord> {
	let icon = twemoji_icon(seq);
	if icon.is_empty() || TWEMOJI_EXCLUDED.contains(&icon.as_str()) {
		return None;
	}
	Some(EmoteRecord {
		origin: EmoteOrigin::Emoji,
		id: seq.to_string(),
		name: seq.to_string(),
		src: format!("{TWEMOJI_SVG_BASE}/{icon}.svg"),
		width: None,
		height: None,
		modifier: false,
		hidden: false,
		modifier_flags: 0,
	})
}

/// Intermediate part; `Skip` holds a consumed BTTV trigger word.
#[derive(Debug)]
enum Part {
	Text(String),
	Skip,
	Emote {
		text: String,
		emote: EmoteRecord,
		modifiers: Vec<ModifierTag>,
		overlays: Vec<EmoteRecord>,
	},
	Cheer {
		text: String,
		cheer: ChatCheer,
		bits: u64,
	},
}

/// Splits `text` into alternating words and whitespace runs, keeping both.
fn split_words(text: &str) -> Vec<&str> {
	let mut out = Vec::new();
	let mut start = 0;
	let mut in_space: Option<bool> = None;
	for (i, c) in text.char_indices() {
		let space = c.is_whitespace();
		if in_space.is_some_and(|s| s != space) {
			out.push(&text[start..i]);
			start = i;
		}
		in_space = Some(space);
	}
	if start < text.len() {
		out.push(&text[start..]);
	}
	out
}

struct Resolver<'t> {
	tables: &'t RenderTables,
	parts: Vec<Part>,
	pending: Vec<ModifierTag>,
}

impl<'t> Resolver<'t> {
	fn new(tables: &'t RenderTables) -> Self {
		Self {
			tables,
			parts: Vec::new(),
			pending: Vec::new(),
		}
	}

	/// Adjacent non-space text inside one word is kept together.
	fn push_text(&mut self, text: &str, glue: bool) {
		if text.is_empty() {
			return;
		}
		if glue && let Some(Part::Text(prev)) = self.parts.last_mut() {
			prev.push_str(text);
			return;
		}
		self.parts.push(Part::Text(text.to_string()));
	}

	fn push_emote(&mut self, text: &str, emote: EmoteRecord) {
		let modifiers = std::mem::take(&mut self.pending);
		self.parts.push(Part::Emote {
			text: text.to_string(),
			emote,
			modifiers,
			overlays: Vec::new(),
		});
	}

	fn fragment(&mut self, fragment: &Fragment) {
		if fragment.kind == FragmentKind::Cheermote
			&& let Some(cm) = &fragment.cheermote
			&& let Some(cheer) = find_cheer(&self.tables.cheers, &cm.prefix, cm.bits)
		{
			self.parts.push(Part::Cheer {
				text: fragment.text.clone(),
				cheer: cheer.clone(),
				bits: cm.bits,
			});
			self.pending.clear();
			return;
		}

		if let Some(emote) = &fragment.emote {
			self.parts.push(Part::Emote {
				text: fragment.text.clone(),
				emote: twitch_emote(&emote.id, &fragment.text),
				modifiers: Vec::new(),
				overlays: Vec::new(),
			});
			self.pending.clear();
			return;
		}

		for word in split_words(&fragment.text) {
			self.word(word);
		}
	}

	fn word(&mut self, word: &str) {
		if word.chars().all(char::is_whitespace) {
			self.push_text(word, false);
			return;
		}

		if let Some(tag) = bttv_modifier_trigger(word) {
			self.parts.push(Part::Skip);
			self.pending.push(tag);
			return;
		}

		if let Some(emote) = self.tables.emotes.get(word).filter(|e| !e.hidden) {
			self.push_emote(word, emote.clone());
			return;
		}

		self.symbols(word);
	}

	/// Splits a word into plain text and emoji sequences.
	fn symbols(&mut self, word: &str) {
		let Some(re) = emoji_re() else {
			self.push_text(word, false);
			return;
		};

		let mut last = 0;
		let mut glue = false;
		for m in re.find_iter(word) {
			let before = &word[last..m.start()];
			self.push_text(before, glue);
			glue = glue || !before.is_empty();
			match emoji_record(m.as_str()) {
				Some(record) => {
					self.push_emote(m.as_str(), record);
					glue = false;
				}
				None => {
					self.push_text(m.as_str(), glue);
					glue = true;
				}
			}
			last = m.end();
		}
		self.push_text(&word[last..], glue);
	}

	/// Folds following modifier emotes into each base emote.
	///
	/// The lookahead steps over single spaces and stops at the first part that is not an emote with decodable
	/// modifier flags.
	fn merge_modifiers(&mut self) -> Vec<bool> {
		let mut consumed = vec![false; self.parts.len()];

		for i in 0..self.parts.len() {
			if consumed[i] || !matches!(self.parts[i], Part::Emote { .. }) {
				continue;
			}

			let mut extra = Vec::new();
			let mut stacked = Vec::new();
			let mut j = i + 1;
			while let Some(next) = self.parts.get(j) {
				match next {
					Part::Text(t) if t == " " => {}
					Part::Emote { emote, .. } if emote.modifier_flags > 0 => {
						let tags = emote.modifier_tags();
						if tags.is_empty() {
							break;
						}
						if emote.origin == EmoteOrigin::SevenTv && tags.contains(&ModifierTag::ZeroWidth) {
							stacked.push(emote.clone());
						}
						extra.extend(tags.into_iter().filter(|t| *t != ModifierTag::Hidden));
						consumed[j] = true;
					}
					_ => break,
				}
				j += 1;
			}

			if let Part::Emote { modifiers, overlays, .. } = &mut self.parts[i] {
				modifiers.extend(extra);
				overlays.extend(stacked);
			}
		}

		consumed
	}

	fn finish(mut self) -> Vec<RenderToken> {
		let consumed = self.merge_modifiers();
		let mut tokens: Vec<RenderToken> = Vec::with_capacity(self.parts.len());

		for (part, consumed) in self.parts.into_iter().zip(consumed) {
			if consumed {
				continue;
			}
			match part {
				Part::Skip => {}
				Part::Text(t) => match tokens.last_mut() {
					Some(RenderToken::Text(prev)) => prev.push_str(&t),
					_ => tokens.push(RenderToken::Text(t)),
				},
				Part::Emote {
					text,
					emote,
					modifiers,
					overlays,
				} => tokens.push(RenderToken::Emote {
					text,
					emote,
					modifiers,
					overlays,
				}),
				Part::Cheer { text, cheer, bits } => tokens.push(RenderToken::Cheer { text, cheer, bits }),
			}
		}

		tokens
	}
}

/// Resolve a message's fragments against the current tables.
///
/// BTTV trigger words (`w!`, `h!`, ...) are dropped and apply to the next emote; emote, cheer and emoji parts
/// clear whatever is pending. Adjacent text is merged in the output.
pub fn resolve_fragments(fragments: &[Fragment], tables: &RenderTables) -> Vec<RenderToken> {
	let mut resolver = Resolver::new(tables);
	for fragment in fragments {
		resolver.fragment(fragment);
	}
	resolver.finish()
}
