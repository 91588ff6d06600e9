//! Versioned schema for the local store.
//!
//! The version lives in `PRAGMA user_version`. Each migration is additive:
//! tables and indexes are created with `IF NOT EXISTS` and existing rows are
//! never rewritten or dropped. All missing steps run inside one transaction,
//! so a failed upgrade leaves the previous schema intact.

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use super::StoreError;

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 3;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "pending attendance queue",
        sql: r"
            CREATE TABLE IF NOT EXISTS pending_attendance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                miqaat_id TEXT NOT NULL,
                entry TEXT NOT NULL,
                idempotency_token TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );
        ",
    },
    Migration {
        version: 2,
        description: "user directory snapshot",
        sql: r"
            CREATE TABLE IF NOT EXISTS cached_users (
                id TEXT PRIMARY KEY,
                its_id TEXT NOT NULL,
                secondary_id TEXT,
                name TEXT NOT NULL DEFAULT '',
                role TEXT,
                team TEXT,
                mohallah_id TEXT,
                designation TEXT,
                page_rights TEXT NOT NULL DEFAULT '[]'
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_cached_users_its_id
                ON cached_users(its_id);
            CREATE INDEX IF NOT EXISTS idx_cached_users_secondary_id
                ON cached_users(secondary_id);

            CREATE TABLE IF NOT EXISTS cache_meta (
                singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
                generation INTEGER NOT NULL,
                refreshed_at INTEGER NOT NULL,
                user_count INTEGER NOT NULL
            );
        ",
    },
    Migration {
        version: 3,
        description: "delivery bookkeeping for queued records",
        sql: r"
            CREATE TABLE IF NOT EXISTS delivery_state (
                pending_id INTEGER PRIMARY KEY
                    REFERENCES pending_attendance(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_attempt_at INTEGER,
                rejected_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_delivery_state_status
                ON delivery_state(status);

            INSERT OR IGNORE INTO delivery_state (pending_id)
                SELECT id FROM pending_attendance;
        ",
    },
];

pub(crate) fn current_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))?)
}

/// Bring the database up to [`SCHEMA_VERSION`].
pub(crate) fn migrate(conn: &mut Connection) -> Result<u32, StoreError> {
    migrate_to(conn, SCHEMA_VERSION)
}

pub(crate) fn migrate_to(conn: &mut Connection, target: u32) -> Result<u32, StoreError> {
    let found = current_version(conn)?;
    if found > target {
        return Err(StoreError::Downgrade {
            found,
            supported: target,
        });
    }
    if found == target {
        debug!(version = found, "Schema up to date");
        return Ok(found);
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > found && m.version <= target)
    {
        apply(&tx, migration)?;
    }
    tx.pragma_update(None, "user_version", target)?;
    tx.commit()?;

    info!(from = found, to = target, "Schema upgraded");
    Ok(target)
}

fn apply(tx: &Transaction<'_>, migration: &Migration) -> Result<(), StoreError> {
    debug!(
        version = migration.version,
        description = migration.description,
        "Applying migration"
    );
    tx.execute_batch(migration.sql)
        .map_err(|source| StoreError::Migration {
            version: migration.version,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n == 1)
        .unwrap_or(false)
    }

    #[test]
    fn test_fresh_database_gets_all_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);

        for table in ["pending_attendance", "cached_users", "cache_meta", "delivery_state"] {
            assert!(table_exists(&conn, table), "missing table {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_keeps_existing_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_to(&mut conn, 1).unwrap();
        assert!(!table_exists(&conn, "cached_users"));

        conn.execute(
            "INSERT INTO pending_attendance (miqaat_id, entry, idempotency_token, created_at)
             VALUES ('m1', '{}', 'u-1', 1)",
            [],
        )
        .unwrap();

        migrate(&mut conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_attendance", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        // Rows queued before delivery bookkeeping existed start out pending
        let status: String = conn
            .query_row(
                "SELECT status FROM delivery_state WHERE pending_id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "pending");
    }

    #[test]
    fn test_downgrade_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();

        match migrate(&mut conn) {
            Err(StoreError::Downgrade { found, supported }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected downgrade error, got {:?}", other),
        }
    }
}
