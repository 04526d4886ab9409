use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Promotion record for one source message. Created on the first qualifying
/// reaction; the mirror identity stays null until the voter count reaches
/// the owning entry's threshold and is reset to null again on demotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarboardMessage {
    pub original_message: u64,
    pub original_channel: u64,
    #[serde(default)]
    pub new_message: Option<u64>,
    #[serde(default)]
    pub new_channel: Option<u64>,
    pub author: u64,
    /// Deduplicated voter ids, the authoritative count.
    #[serde(default)]
    pub reactions: BTreeSet<u64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub mirrored_at: Option<DateTime<Utc>>,
}

impl StarboardMessage {
    pub fn new(original_message: u64, original_channel: u64, author: u64) -> Self {
        Self {
            original_message,
            original_channel,
            new_message: None,
            new_channel: None,
            author,
            reactions: BTreeSet::new(),
            created_at: Utc::now(),
            mirrored_at: None,
        }
    }

    pub fn count(&self) -> u64 {
        self.reactions.len() as u64
    }

    pub fn is_promoted(&self) -> bool {
        self.new_message.is_some()
    }

    /// Age reference for the retention sweep: the mirror's creation time when
    /// one exists, else the record's own.
    pub fn retention_stamp(&self) -> DateTime<Utc> {
        self.mirrored_at.unwrap_or(self.created_at)
    }

    pub fn expired(&self, now: DateTime<Utc>, purge_days: u32) -> bool {
        now - self.retention_stamp() > Duration::days(i64::from(purge_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voters_deduplicate() {
        let mut m = StarboardMessage::new(1, 2, 3);
        m.reactions.insert(10);
        m.reactions.insert(10);
        m.reactions.insert(11);
        assert_eq!(m.count(), 2);
    }

    #[test]
    fn retention_prefers_mirror_time() {
        let now = Utc::now();
        let mut m = StarboardMessage::new(1, 2, 3);
        m.created_at = now - Duration::days(30);
        m.mirrored_at = Some(now - Duration::days(5));
        assert!(!m.expired(now, 7));
        m.mirrored_at = Some(now - Duration::days(10));
        assert!(m.expired(now, 7));
    }

    #[test]
    fn pending_record_ages_from_creation() {
        let now = Utc::now();
        let mut m = StarboardMessage::new(1, 2, 3);
        m.created_at = now - Duration::days(10);
        assert!(m.expired(now, 7));
        m.created_at = now - Duration::days(5);
        assert!(!m.expired(now, 7));
    }
}
