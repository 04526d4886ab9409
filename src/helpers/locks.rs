use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Advisory locks keyed by (guild, starboard name). Every read-modify-write
/// of one entry's records happens under that entry's lock; other entries and
/// other guilds proceed independently, so one busy board never starves the
/// rest.
#[derive(Default)]
pub struct EntryLocks {
    locks: DashMap<(u64, String), Arc<Mutex<()>>>,
}

impl EntryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guild: u64, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((guild, name.to_lowercase()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drops the slot for a deleted entry so the map does not grow forever.
    /// Holders of the old `Arc` keep their mutex; a later `get` mints a fresh
    /// one.
    pub fn remove(&self, guild: u64, name: &str) {
        self.locks.remove(&(guild, name.to_lowercase()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_one_lock() {
        let locks = EntryLocks::new();
        let a = locks.get(1, "gold");
        let b = locks.get(1, "GOLD");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn removed_slots_are_recreated_fresh() {
        let locks = EntryLocks::new();
        let a = locks.get(1, "gold");
        locks.remove(1, "GOLD");
        locks.remove(1, "never-existed");
        let b = locks.get(1, "gold");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let locks = EntryLocks::new();
        let a = locks.get(1, "gold");
        let b = locks.get(2, "gold");
        let c = locks.get(1, "silver");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
