use serde::{Deserialize, Serialize};

use crate::structs::starboard_message::StarboardMessage;

/// Fallback embed colour, the gold of the ⭐ emoji.
pub const DEFAULT_COLOUR: u32 = 0xFFAC33;

/// Colour applied to a mirror embed. Older configs stored either a raw
/// integer or one of the strings "user"/"member"/"author"/"bot", so the
/// serde impls accept both shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColourPolicy {
    Fixed(u32),
    /// Top role colour of the source message's author.
    Member,
    /// Top role colour of the bot itself.
    Bot,
}

impl Default for ColourPolicy {
    fn default() -> Self {
        ColourPolicy::Fixed(DEFAULT_COLOUR)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ColourRepr {
    Num(u32),
    Name(String),
}

impl<'de> Deserialize<'de> for ColourPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match ColourRepr::deserialize(deserializer)? {
            ColourRepr::Num(n) => Ok(ColourPolicy::Fixed(n)),
            ColourRepr::Name(s) => match s.as_str() {
                "user" | "member" | "author" => Ok(ColourPolicy::Member),
                "bot" => Ok(ColourPolicy::Bot),
                other => Err(serde::de::Error::custom(format!(
                    "unknown colour policy `{other}`"
                ))),
            },
        }
    }
}

impl Serialize for ColourPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ColourPolicy::Fixed(n) => serializer.serialize_u32(*n),
            ColourPolicy::Member => serializer.serialize_str("member"),
            ColourPolicy::Bot => serializer.serialize_str("bot"),
        }
    }
}

impl std::str::FromStr for ColourPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "user" | "member" | "author" => Ok(ColourPolicy::Member),
            "bot" => Ok(ColourPolicy::Bot),
            other => {
                let hex = other
                    .strip_prefix('#')
                    .or_else(|| other.strip_prefix("0x"))
                    .unwrap_or(other);
                u32::from_str_radix(hex, 16)
                    .map(ColourPolicy::Fixed)
                    .map_err(|_| {
                        format!("`{s}` is not a colour; use a hex value or one of member/bot")
                    })
            }
        }
    }
}

impl std::fmt::Display for ColourPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColourPolicy::Fixed(n) => write!(f, "#{n:06X}"),
            ColourPolicy::Member => write!(f, "member"),
            ColourPolicy::Bot => write!(f, "bot"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One configured starboard. Unique per guild by lowercased name; owns every
/// promotion record created under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarboardEntry {
    pub name: String,
    /// Target channel the mirrors are posted into.
    pub channel: u64,
    /// Reaction that drives this board, in serenity's rendered form
    /// ("⭐" or "<:name:id>").
    pub emoji: String,
    pub threshold: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub selfstar: bool,
    #[serde(default)]
    pub autostar: bool,
    #[serde(default)]
    pub colour: ColourPolicy,
    #[serde(default)]
    pub blacklist_channel: Vec<u64>,
    #[serde(default)]
    pub whitelist_channel: Vec<u64>,
    #[serde(default)]
    pub blacklist_role: Vec<u64>,
    #[serde(default)]
    pub whitelist_role: Vec<u64>,
    /// Retention window in days for the sweep; `None` keeps records forever.
    #[serde(default)]
    pub purge_days: Option<u32>,
    #[serde(default)]
    pub messages: Vec<StarboardMessage>,
}

impl StarboardEntry {
    pub fn new(name: &str, channel: u64, emoji: String, threshold: u64) -> Self {
        Self {
            name: name.to_lowercase(),
            channel,
            emoji,
            threshold,
            enabled: true,
            selfstar: false,
            autostar: false,
            colour: ColourPolicy::default(),
            blacklist_channel: Vec::new(),
            whitelist_channel: Vec::new(),
            blacklist_role: Vec::new(),
            whitelist_role: Vec::new(),
            purge_days: None,
            messages: Vec::new(),
        }
    }

    /// Role gate. A non-empty whitelist must match and makes the blacklist
    /// irrelevant. `None` means no member information was available (the
    /// reactor may have left the guild); those users always pass so their
    /// old reactions keep counting.
    pub fn check_roles(&self, member_roles: Option<&[u64]>) -> bool {
        let Some(roles) = member_roles else {
            return true;
        };
        if !self.whitelist_role.is_empty() {
            return roles.iter().any(|r| self.whitelist_role.contains(r));
        }
        !roles.iter().any(|r| self.blacklist_role.contains(r))
    }

    /// Channel gate. The NSFW guard runs before any list check: an NSFW
    /// source never feeds a non-NSFW board. After that a non-empty whitelist
    /// must match the channel or its parent category, else the blacklist
    /// rejects on a match.
    pub fn check_channel(
        &self,
        channel: u64,
        parent: Option<u64>,
        source_nsfw: bool,
        target_nsfw: bool,
    ) -> bool {
        if source_nsfw && !target_nsfw {
            return false;
        }
        let hit = |list: &[u64]| {
            list.contains(&channel) || parent.is_some_and(|p| list.contains(&p))
        };
        if !self.whitelist_channel.is_empty() {
            return hit(&self.whitelist_channel);
        }
        !hit(&self.blacklist_channel)
    }

    /// Looks a tracked record up by either copy of the message, source
    /// identity first since events usually target it.
    pub fn find_message(&self, message_id: u64) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.original_message == message_id)
            .or_else(|| {
                self.messages
                    .iter()
                    .position(|m| m.new_message == Some(message_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> StarboardEntry {
        StarboardEntry::new("gold", 10, "⭐".to_string(), 2)
    }

    #[test]
    fn role_whitelist_wins_over_blacklist() {
        let mut e = entry();
        e.whitelist_role = vec![1];
        e.blacklist_role = vec![1];
        assert!(e.check_roles(Some(&[1])));
        assert!(!e.check_roles(Some(&[2])));
    }

    #[test]
    fn role_blacklist_applies_without_whitelist() {
        let mut e = entry();
        e.blacklist_role = vec![3];
        assert!(!e.check_roles(Some(&[3, 4])));
        assert!(e.check_roles(Some(&[4])));
    }

    #[test]
    fn missing_member_info_always_passes() {
        let mut e = entry();
        e.whitelist_role = vec![1];
        assert!(e.check_roles(None));
    }

    #[test]
    fn channel_whitelist_wins_regardless_of_blacklist() {
        let mut e = entry();
        e.whitelist_channel = vec![42];
        e.blacklist_channel = vec![42, 99];
        assert!(e.check_channel(42, None, false, false));
        assert!(!e.check_channel(99, None, false, false));
    }

    #[test]
    fn parent_category_satisfies_whitelist() {
        let mut e = entry();
        e.whitelist_channel = vec![7];
        assert!(e.check_channel(99, Some(7), false, false));
        assert!(!e.check_channel(99, Some(8), false, false));
    }

    #[test]
    fn nsfw_source_never_reaches_sfw_board() {
        let mut e = entry();
        e.whitelist_channel = vec![42];
        // the guard precedes the whitelist
        assert!(!e.check_channel(42, None, true, false));
        assert!(e.check_channel(42, None, true, true));
    }

    #[test]
    fn find_message_checks_original_then_mirror() {
        let mut e = entry();
        let mut m = StarboardMessage::new(100, 5, 1);
        m.new_message = Some(200);
        e.messages.push(m);
        assert_eq!(e.find_message(100), Some(0));
        assert_eq!(e.find_message(200), Some(0));
        assert_eq!(e.find_message(300), None);
    }

    #[test]
    fn entry_round_trips_through_json() {
        let mut e = entry();
        e.colour = ColourPolicy::Member;
        e.whitelist_channel = vec![1, 2];
        e.messages.push(StarboardMessage::new(100, 5, 1));
        let blob = serde_json::to_string(&e).unwrap();
        let back: StarboardEntry = serde_json::from_str(&blob).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn legacy_blob_gets_empty_defaults() {
        let blob = r#"{"name":"gold","channel":1,"emoji":"⭐","threshold":2,"colour":"author"}"#;
        let e: StarboardEntry = serde_json::from_str(blob).unwrap();
        assert!(e.enabled);
        assert!(!e.selfstar);
        assert_eq!(e.colour, ColourPolicy::Member);
        assert!(e.whitelist_channel.is_empty());
        assert!(e.blacklist_role.is_empty());
        assert!(e.messages.is_empty());
        assert_eq!(e.purge_days, None);
    }

    #[test]
    fn colour_policy_parses_and_displays() {
        assert_eq!("user".parse::<ColourPolicy>(), Ok(ColourPolicy::Member));
        assert_eq!("BOT".parse::<ColourPolicy>(), Ok(ColourPolicy::Bot));
        assert_eq!(
            "#ffac33".parse::<ColourPolicy>(),
            Ok(ColourPolicy::Fixed(0xFFAC33))
        );
        assert_eq!(
            "0x010203".parse::<ColourPolicy>(),
            Ok(ColourPolicy::Fixed(0x010203))
        );
        assert!("sparkly".parse::<ColourPolicy>().is_err());
        assert_eq!(ColourPolicy::Fixed(0xFFAC33).to_string(), "#FFAC33");
    }

    #[test]
    fn numeric_colour_survives_serde() {
        let e = {
            let mut e = entry();
            e.colour = ColourPolicy::Fixed(0x123456);
            e
        };
        let blob = serde_json::to_string(&e).unwrap();
        assert!(blob.contains(&0x123456u32.to_string()));
        let back: StarboardEntry = serde_json::from_str(&blob).unwrap();
        assert_eq!(back.colour, ColourPolicy::Fixed(0x123456));
    }
}
