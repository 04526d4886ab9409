use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::helpers::locks::EntryLocks;
use crate::helpers::starboard::{StarboardStore, StoreError};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24);

/// Interval between sweeps, taken from the `SWEEP_INTERVAL_HOURS` env value.
/// Unset, zero, or unparseable values fall back to one sweep per day.
pub fn sweep_interval(raw: Option<&str>) -> Duration {
    match raw.map(str::trim).map(str::parse::<u64>) {
        Some(Ok(hours)) if hours > 0 => Duration::from_secs(hours * 60 * 60),
        Some(_) => {
            warn!("ignoring invalid SWEEP_INTERVAL_HOURS value");
            DEFAULT_SWEEP_INTERVAL
        }
        None => DEFAULT_SWEEP_INTERVAL,
    }
}

/// Periodic retention sweep. A failed pass is logged and retried on the next
/// wakeup; the loop itself never exits.
pub async fn retention_task(
    store: Arc<dyn StarboardStore>,
    locks: Arc<EntryLocks>,
    interval: Duration,
) {
    loop {
        sleep(interval).await;
        if let Err(e) = sweep_once(store.as_ref(), &locks, Utc::now()).await {
            warn!(error = %e, "retention sweep failed");
        }
    }
}

/// One pass over every entry of every guild, dropping records older than the
/// entry's purge window. Holds the entry lock for the read-modify-write so a
/// concurrent reaction event cannot interleave with the structural mutation.
pub async fn sweep_once(
    store: &dyn StarboardStore,
    locks: &EntryLocks,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    for guild in store.guilds().await? {
        let names: Vec<String> = store
            .list(guild)
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect();

        for name in names {
            let lock = locks.get(guild, &name);
            let _guard = lock.lock().await;

            let Some(mut entry) = store.get(guild, &name).await? else {
                continue;
            };
            let Some(days) = entry.purge_days else {
                continue;
            };

            let before = entry.messages.len();
            entry.messages.retain(|m| !m.expired(now, days));
            let purged = before - entry.messages.len();
            if purged > 0 {
                debug!(guild, name = %entry.name, purged, "pruned aged starboard records");
                store.save(guild, &entry).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::starboard::SqliteStarboardStore;
    use crate::structs::starboard_entry::StarboardEntry;
    use crate::structs::starboard_message::StarboardMessage;
    use chrono::Duration as Days;

    fn aged_message(id: u64, now: DateTime<Utc>, mirror_age_days: i64) -> StarboardMessage {
        let mut m = StarboardMessage::new(id, 5, 1);
        m.new_message = Some(id + 1000);
        m.new_channel = Some(10);
        m.mirrored_at = Some(now - Days::days(mirror_age_days));
        m
    }

    async fn memory_store(name: &str) -> SqliteStarboardStore {
        let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
        SqliteStarboardStore::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn sweep_drops_only_records_past_the_window() {
        let store = memory_store("sweep_window").await;
        let locks = EntryLocks::new();
        let now = Utc::now();

        let mut entry = StarboardEntry::new("gold", 10, "⭐".to_string(), 2);
        entry.purge_days = Some(7);
        entry.messages.push(aged_message(100, now, 10));
        entry.messages.push(aged_message(200, now, 5));
        store.save(1, &entry).await.unwrap();

        sweep_once(&store, &locks, now).await.unwrap();

        let back = store.get(1, "gold").await.unwrap().unwrap();
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.messages[0].original_message, 200);
    }

    #[test]
    fn sweep_interval_defaults_to_daily() {
        assert_eq!(sweep_interval(None), DEFAULT_SWEEP_INTERVAL);
        assert_eq!(sweep_interval(Some("soon")), DEFAULT_SWEEP_INTERVAL);
        assert_eq!(sweep_interval(Some("0")), DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn sweep_interval_reads_hours() {
        assert_eq!(sweep_interval(Some("6")), Duration::from_secs(6 * 60 * 60));
        assert_eq!(sweep_interval(Some(" 48 ")), Duration::from_secs(48 * 60 * 60));
    }

    #[tokio::test]
    async fn sweep_ignores_entries_without_a_window() {
        let store = memory_store("sweep_no_window").await;
        let locks = EntryLocks::new();
        let now = Utc::now();

        let mut entry = StarboardEntry::new("gold", 10, "⭐".to_string(), 2);
        entry.messages.push(aged_message(100, now, 400));
        store.save(1, &entry).await.unwrap();

        sweep_once(&store, &locks, now).await.unwrap();

        let back = store.get(1, "gold").await.unwrap().unwrap();
        assert_eq!(back.messages.len(), 1);
    }
}
