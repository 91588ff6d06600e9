use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::CachedUser;
use crate::store::{from_millis, to_millis, StoreError, StoreHandle};
use crate::utils::format_age_minutes;

/// Consider the directory snapshot stale after 1 hour.
pub const DEFAULT_STALE_MINUTES: i64 = 60;

const USER_COLUMNS: &str =
    "id, its_id, secondary_id, name, role, team, mohallah_id, designation, page_rights";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Freshness of the cached directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    /// Incremented by every refresh.
    pub generation: i64,
    pub refreshed_at: DateTime<Utc>,
    pub user_count: usize,
}

impl CacheStatus {
    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.refreshed_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        format_age_minutes(self.age_minutes())
    }

    pub fn is_stale(&self, stale_minutes: i64) -> bool {
        self.age_minutes() > stale_minutes
    }
}

/// Offline mirror of the remote user directory.
#[derive(Clone)]
pub struct UserCache {
    store: StoreHandle,
}

impl UserCache {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Replace the whole cache with `users` in one transaction.
    ///
    /// Users without an identity are skipped; if a primary identifier appears
    /// twice the first occurrence wins. Returns the number of users stored.
    pub async fn refresh(&self, users: Vec<CachedUser>) -> Result<usize, CacheError> {
        let received = users.len();
        let refreshed_at = to_millis(&Utc::now());

        let (stored, generation) = self
            .store
            .write(move |tx| {
                tx.execute("DELETE FROM cached_users", [])?;

                let mut stored = 0usize;
                {
                    let mut insert = tx.prepare(
                        "INSERT OR IGNORE INTO cached_users
                            (id, its_id, secondary_id, name, role, team, mohallah_id,
                             designation, page_rights)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )?;
                    for user in users.iter().filter(|u| u.has_identity()) {
                        let rights = serde_json::to_string(&user.page_rights)?;
                        stored += insert.execute(params![
                            user.id.trim(),
                            user.its_id.trim(),
                            user.secondary_id.as_deref().map(str::trim),
                            user.name,
                            user.role,
                            user.team,
                            user.mohallah_id,
                            user.designation,
                            rights,
                        ])?;
                    }
                }

                tx.execute(
                    "INSERT INTO cache_meta (singleton, generation, refreshed_at, user_count)
                     VALUES (1, 1, ?1, ?2)
                     ON CONFLICT(singleton) DO UPDATE SET
                        generation = generation + 1,
                        refreshed_at = excluded.refreshed_at,
                        user_count = excluded.user_count",
                    params![refreshed_at, stored as i64],
                )?;
                let generation: i64 = tx.query_row(
                    "SELECT generation FROM cache_meta WHERE singleton = 1",
                    [],
                    |row| row.get(0),
                )?;
                Ok((stored, generation))
            })
            .await?;

        info!(
            received,
            stored,
            skipped = received - stored,
            generation,
            "User cache refreshed"
        );
        Ok(stored)
    }

    /// Resolve a scanned or typed identifier: primary identifier first, then
    /// secondary identifier.
    pub async fn lookup(&self, identifier: &str) -> Result<Option<CachedUser>, CacheError> {
        let identifier = identifier.trim().to_string();
        if identifier.is_empty() {
            return Ok(None);
        }

        let found = self
            .store
            .read(move |tx| {
                let by_primary = query_one(
                    tx,
                    &format!("SELECT {} FROM cached_users WHERE its_id = ?1", USER_COLUMNS),
                    &identifier,
                )?;
                if by_primary.is_some() {
                    return Ok(by_primary);
                }
                query_one(
                    tx,
                    &format!(
                        "SELECT {} FROM cached_users WHERE secondary_id = ?1
                         ORDER BY name, id LIMIT 1",
                        USER_COLUMNS
                    ),
                    &identifier,
                )
            })
            .await?;

        debug!(found = found.is_some(), "User lookup");
        Ok(found)
    }

    /// The whole snapshot, ordered by name, read in one transaction.
    pub async fn all(&self) -> Result<Vec<CachedUser>, CacheError> {
        let users = self
            .store
            .read(|tx| {
                let sql = format!("SELECT {} FROM cached_users ORDER BY name, id", USER_COLUMNS);
                let mut stmt = tx.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut users = Vec::new();
                while let Some(row) = rows.next()? {
                    users.push(read_user(row)?);
                }
                Ok(users)
            })
            .await?;
        Ok(users)
    }

    pub async fn status(&self) -> Result<Option<CacheStatus>, CacheError> {
        let status = self
            .store
            .read(|tx| {
                let row = tx
                    .query_row(
                        "SELECT generation, refreshed_at, user_count FROM cache_meta
                         WHERE singleton = 1",
                        [],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
                    )
                    .optional()?;
                row.map(|(generation, refreshed_at, user_count)| -> Result<CacheStatus, StoreError> {
                    Ok(CacheStatus {
                        generation,
                        refreshed_at: from_millis(refreshed_at)?,
                        user_count: user_count.max(0) as usize,
                    })
                })
                .transpose()
            })
            .await?;
        Ok(status)
    }

    /// Bulk clear, including freshness metadata.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let cleared = self
            .store
            .write(|tx| {
                tx.execute("DELETE FROM cache_meta", [])?;
                Ok(tx.execute("DELETE FROM cached_users", [])?)
            })
            .await?;
        info!(cleared, "User cache cleared");
        Ok(cleared)
    }
}

fn query_one(
    tx: &Transaction<'_>,
    sql: &str,
    identifier: &str,
) -> Result<Option<CachedUser>, StoreError> {
    let mut stmt = tx.prepare(sql)?;
    let mut rows = stmt.query([identifier])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_user(row)?)),
        None => Ok(None),
    }
}

fn read_user(row: &Row<'_>) -> Result<CachedUser, StoreError> {
    let rights: String = row.get(8)?;
    Ok(CachedUser {
        id: row.get(0)?,
        its_id: row.get(1)?,
        secondary_id: row.get(2)?,
        name: row.get(3)?,
        role: row.get(4)?,
        team: row.get(5)?,
        mohallah_id: row.get(6)?,
        designation: row.get(7)?,
        page_rights: serde_json::from_str(&rights)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use chrono::Duration;

    fn user(id: &str, its: &str, secondary: Option<&str>, name: &str) -> CachedUser {
        CachedUser {
            id: id.to_string(),
            its_id: its.to_string(),
            secondary_id: secondary.map(str::to_string),
            name: name.to_string(),
            page_rights: vec!["attendance".to_string()],
            ..Default::default()
        }
    }

    async fn cache() -> UserCache {
        let store = LocalStore::in_memory();
        UserCache::new(store.open().await.unwrap())
    }

    #[tokio::test]
    async fn test_lookup_prefers_primary_identifier() {
        let cache = cache().await;
        cache
            .refresh(vec![
                user("u1", "10101010", Some("20202020"), "Burhan"),
                user("u2", "20202020", None, "Zainab"),
            ])
            .await
            .unwrap();

        let found = cache.lookup("20202020").await.unwrap().unwrap();
        assert_eq!(found.id, "u2");

        let found = cache.lookup(" 10101010 ").await.unwrap().unwrap();
        assert_eq!(found.page_rights, vec!["attendance".to_string()]);
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_secondary_identifier() {
        let cache = cache().await;
        cache
            .refresh(vec![
                user("u2", "10000002", Some("99999999"), "Zahra"),
                user("u1", "10000001", Some("99999999"), "Abbas"),
            ])
            .await
            .unwrap();

        let found = cache.lookup("99999999").await.unwrap().unwrap();
        assert_eq!(found.name, "Abbas");
        assert!(cache.lookup("12345678").await.unwrap().is_none());
        assert!(cache.lookup("   ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_skips_users_without_identity() {
        let cache = cache().await;
        let stored = cache
            .refresh(vec![
                user("u1", "10000001", None, "A"),
                user("", "10000002", None, "No id"),
                user("u3", "  ", None, "No ITS"),
                user("u4", "10000001", None, "Duplicate ITS"),
            ])
            .await
            .unwrap();
        assert_eq!(stored, 1);

        let all = cache.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "A");
    }

    #[tokio::test]
    async fn test_refresh_replaces_previous_snapshot() {
        let cache = cache().await;
        cache
            .refresh(vec![user("a1", "1", None, "A1"), user("a2", "2", None, "A2")])
            .await
            .unwrap();
        cache
            .refresh(vec![user("b1", "3", None, "B1")])
            .await
            .unwrap();

        let ids: Vec<String> = cache.all().await.unwrap().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["b1".to_string()]);
        assert!(cache.lookup("1").await.unwrap().is_none());

        let status = cache.status().await.unwrap().unwrap();
        assert_eq!(status.generation, 2);
        assert_eq!(status.user_count, 1);
    }

    #[tokio::test]
    async fn test_clear_empties_cache_and_status() {
        let cache = cache().await;
        cache.refresh(vec![user("u1", "1", None, "A")]).await.unwrap();

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.all().await.unwrap().is_empty());
        assert!(cache.status().await.unwrap().is_none());
    }

    #[test]
    fn test_cache_status_staleness() {
        let fresh = CacheStatus {
            generation: 1,
            refreshed_at: Utc::now(),
            user_count: 10,
        };
        assert!(!fresh.is_stale(DEFAULT_STALE_MINUTES));
        assert_eq!(fresh.age_display(), "just now");

        let old = CacheStatus {
            refreshed_at: Utc::now() - Duration::minutes(61),
            ..fresh
        };
        assert!(old.is_stale(DEFAULT_STALE_MINUTES));
    }
}
