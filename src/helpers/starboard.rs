use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use thiserror::Error;
use tracing::warn;

use crate::structs::starboard_entry::StarboardEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("bad starboard blob for guild {guild}: {source}")]
    Serde {
        guild: u64,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistence seam for starboard entries. Every save is a full overwrite of
/// that entry's blob; there is no delta persistence. Names are compared
/// case-insensitively.
#[async_trait]
pub trait StarboardStore: Send + Sync {
    async fn get(&self, guild: u64, name: &str) -> Result<Option<StarboardEntry>, StoreError>;
    async fn list(&self, guild: u64) -> Result<Vec<StarboardEntry>, StoreError>;
    async fn save(&self, guild: u64, entry: &StarboardEntry) -> Result<(), StoreError>;
    /// Returns whether an entry was actually removed. Dropping the row drops
    /// every record the entry owned.
    async fn delete(&self, guild: u64, name: &str) -> Result<bool, StoreError>;
    /// Guilds with at least one entry, for the retention sweep.
    async fn guilds(&self) -> Result<Vec<u64>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteStarboardStore {
    pool: SqlitePool,
}

impl SqliteStarboardStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS starboard_entries (
                guild_id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (guild_id, name)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StarboardStore for SqliteStarboardStore {
    async fn get(&self, guild: u64, name: &str) -> Result<Option<StarboardEntry>, StoreError> {
        let row = sqlx::query("SELECT data FROM starboard_entries WHERE guild_id = ? AND name = ?")
            .bind(guild.to_string())
            .bind(name.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let blob: String = row.try_get("data")?;
                let entry = serde_json::from_str(&blob)
                    .map_err(|source| StoreError::Serde { guild, source })?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, guild: u64) -> Result<Vec<StarboardEntry>, StoreError> {
        let rows = sqlx::query("SELECT data FROM starboard_entries WHERE guild_id = ? ORDER BY name")
            .bind(guild.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: String = row.try_get("data")?;
            entries.push(
                serde_json::from_str(&blob)
                    .map_err(|source| StoreError::Serde { guild, source })?,
            );
        }
        Ok(entries)
    }

    async fn save(&self, guild: u64, entry: &StarboardEntry) -> Result<(), StoreError> {
        let blob = serde_json::to_string(entry)
            .map_err(|source| StoreError::Serde { guild, source })?;

        sqlx::query(
            "INSERT OR REPLACE INTO starboard_entries (guild_id, name, data) VALUES (?, ?, ?)",
        )
        .bind(guild.to_string())
        .bind(entry.name.to_lowercase())
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, guild: u64, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM starboard_entries WHERE guild_id = ? AND name = ?")
            .bind(guild.to_string())
            .bind(name.to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn guilds(&self) -> Result<Vec<u64>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT guild_id FROM starboard_entries")
            .fetch_all(&self.pool)
            .await?;

        let mut guilds = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("guild_id")?;
            match raw.parse::<u64>() {
                Ok(id) => guilds.push(id),
                Err(_) => warn!(guild_id = %raw, "skipping unparseable guild id"),
            }
        }
        Ok(guilds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::starboard_entry::ColourPolicy;
    use crate::structs::starboard_message::StarboardMessage;

    // A plain :memory: url would hand every pooled connection its own empty
    // database; a named shared-cache db keeps them on the same one.
    async fn store(name: &str) -> SqliteStarboardStore {
        let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
        SqliteStarboardStore::new(&url).await.unwrap()
    }

    fn entry(name: &str) -> StarboardEntry {
        let mut e = StarboardEntry::new(name, 10, "⭐".to_string(), 2);
        e.colour = ColourPolicy::Fixed(0x123456);
        e.whitelist_channel = vec![42];
        let mut m = StarboardMessage::new(100, 5, 1);
        m.reactions.insert(7);
        m.reactions.insert(8);
        e.messages.push(m);
        e
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = store("round_trip").await;
        let e = entry("gold");
        store.save(1, &e).await.unwrap();
        let back = store.get(1, "gold").await.unwrap().unwrap();
        assert_eq!(e, back);
    }

    #[tokio::test]
    async fn names_are_case_insensitive() {
        let store = store("case_insensitive").await;
        store.save(1, &entry("Gold")).await.unwrap();
        assert!(store.get(1, "GOLD").await.unwrap().is_some());
        assert!(store.delete(1, "gOlD").await.unwrap());
        assert!(store.get(1, "gold").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_scoped_to_the_guild() {
        let store = store("list_scope").await;
        store.save(1, &entry("gold")).await.unwrap();
        store.save(1, &entry("silver")).await.unwrap();
        store.save(2, &entry("gold")).await.unwrap();
        let names: Vec<String> = store
            .list(1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["gold", "silver"]);
    }

    #[tokio::test]
    async fn save_overwrites_the_whole_blob() {
        let store = store("overwrite").await;
        let mut e = entry("gold");
        store.save(1, &e).await.unwrap();
        e.messages.clear();
        e.threshold = 5;
        store.save(1, &e).await.unwrap();
        let back = store.get(1, "gold").await.unwrap().unwrap();
        assert_eq!(back.threshold, 5);
        assert!(back.messages.is_empty());
    }

    #[tokio::test]
    async fn delete_reports_missing_entries() {
        let store = store("delete_missing").await;
        assert!(!store.delete(1, "gold").await.unwrap());
    }

    #[tokio::test]
    async fn guilds_lists_each_guild_once() {
        let store = store("guild_list").await;
        store.save(1, &entry("gold")).await.unwrap();
        store.save(1, &entry("silver")).await.unwrap();
        store.save(2, &entry("gold")).await.unwrap();
        let mut guilds = store.guilds().await.unwrap();
        guilds.sort_unstable();
        assert_eq!(guilds, vec![1, 2]);
    }
}
