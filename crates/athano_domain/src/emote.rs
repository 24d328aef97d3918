#![forbid(unsafe_code)]

use core::fmt;

use serde::{Deserialize, Serialize};

/// Where an emote record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmoteOrigin {
	#[serde(rename = "sevenTV")]
	SevenTv,
	#[serde(rename = "betterTTV")]
	BetterTtv,
	#[serde(rename = "frankerFaceZ")]
	FrankerFaceZ,
	#[serde(rename = "twitch")]
	Twitch,
	#[serde(rename = "emoji")]
	Emoji,
}

impl EmoteOrigin {
	pub const fn as_str(self) -> &'static str {
		match self {
			EmoteOrigin::SevenTv => "sevenTV",
			EmoteOrigin::BetterTtv => "betterTTV",
			EmoteOrigin::FrankerFaceZ => "frankerFaceZ",
			EmoteOrigin::Twitch => "twitch",
			EmoteOrigin::Emoji => "emoji",
		}
	}
}

impl fmt::Display for EmoteOrigin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Normalized emote, whatever the provider.
///
/// `modifier_flags` stays in the provider's own bit layout; use [`EmoteRecord::modifier_tags`] to interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteRecord {
	pub origin: EmoteOrigin,
	pub id: String,
	/// Literal chat text that triggers the emote.
	pub name: String,
	pub src: String,
	pub width: Option<u32>,
	pub height: Option<u32>,
	pub modifier: bool,
	/// Provider asks not to render this entry on its own.
	pub hidden: bool,
	pub modifier_flags: u32,
}

impl EmoteRecord {
	pub fn modifier_tags(&self) -> Vec<ModifierTag> {
		decode_modifier_flags(self.origin, self.modifier_flags)
	}
}

/// Badge catalogue entry keyed by `{set_id}_{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBadge {
	pub name: String,
	pub url: String,
}

/// Cheermote tier keyed by `{prefix}{min_bits}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCheer {
	pub name: String,
	pub prefix: String,
	pub url: String,
	pub color: String,
	pub min_bits: u64,
}

/// Named render modifier decoded from provider flags or trigger words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifierTag {
	Hidden,
	FlipX,
	FlipY,
	GrowX,
	Rainbow,
	HyperRed,
	HyperShake,
	Cursed,
	Jam,
	Bounce,
	ZeroWidth,
	ZeroSpace,
	RotateLeft,
	RotateRight,
	Party,
	Shake,
}

impl ModifierTag {
	pub const fn as_str(self) -> &'static str {
		match self {
			ModifierTag::Hidden => "hidden",
			ModifierTag::FlipX => "flipx",
			ModifierTag::FlipY => "flipy",
			ModifierTag::GrowX => "growx",
			ModifierTag::Rainbow => "rainbow",
			ModifierTag::HyperRed => "hyperred",
			ModifierTag::HyperShake => "hypershake",
			ModifierTag::Cursed => "cursed",
			ModifierTag::Jam => "jam",
			ModifierTag::Bounce => "bounce",
			ModifierTag::ZeroWidth => "zerowidth",
			ModifierTag::ZeroSpace => "zerospace",
			ModifierTag::RotateLeft => "rotateleft",
			ModifierTag::RotateRight => "rotateright",
			ModifierTag::Party => "party",
			ModifierTag::Shake => "shake",
		}
	}
}

impl fmt::Display for ModifierTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// 7TV emote flag marking an overlay emote.
pub const SEVENTV_ZERO_WIDTH: u32 = 1 << 8;

const FFZ_MODIFIER_BITS: [(u32, ModifierTag); 10] = [
	(1, ModifierTag::Hidden),
	(1 << 1, ModifierTag::FlipX),
	(1 << 2, ModifierTag::FlipY),
	(1 << 3, ModifierTag::GrowX),
	(1 << 11, ModifierTag::Rainbow),
	(1 << 12, ModifierTag::HyperRed),
	(1 << 13, ModifierTag::HyperShake),
	(1 << 14, ModifierTag::Cursed),
	(1 << 15, ModifierTag::Jam),
	(1 << 16, ModifierTag::Bounce),
];

const BTTV_TRIGGERS: [(&str, ModifierTag); 9] = [
	("w!", ModifierTag::GrowX),
	("h!", ModifierTag::FlipX),
	("v!", ModifierTag::FlipY),
	("z!", ModifierTag::ZeroSpace),
	("c!", ModifierTag::Cursed),
	("l!", ModifierTag::RotateLeft),
	("r!", ModifierTag::RotateRight),
	("p!", ModifierTag::Party),
	("s!", ModifierTag::Shake),
];

/// Interpret a provider's opaque flag value. Origins without a modifier bit space decode to nothing.
pub fn decode_modifier_flags(origin: EmoteOrigin, flags: u32) -> Vec<ModifierTag> {
	match origin {
		EmoteOrigin::SevenTv => {
			if flags & SEVENTV_ZERO_WIDTH != 0 {
				vec![ModifierTag::ZeroWidth]
			} else {
				Vec::new()
			}
		}
		EmoteOrigin::FrankerFaceZ => FFZ_MODIFIER_BITS
			.iter()
			.filter(|(bit, _)| flags & bit != 0)
			.map(|(_, tag)| *tag)
			.collect(),
		EmoteOrigin::BetterTtv | EmoteOrigin::Twitch | EmoteOrigin::Emoji => Vec::new(),
	}
}

/// BetterTTV modifier words (`w!`, `h!`, ...) that apply to the next emote.
pub fn bttv_modifier_trigger(word: &str) -> Option<ModifierTag> {
	BTTV_TRIGGERS.iter().find(|(w, _)| *w == word).map(|(_, tag)| *tag)
}
