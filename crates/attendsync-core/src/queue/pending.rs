use std::sync::Arc;

use rusqlite::{params, Params, Row, Transaction};
use tracing::{debug, info, warn};

use crate::models::{
    idempotency_token, AttendanceEntry, DeliveryState, DeliveryStatus, PendingRecord,
    QueuedRecord,
};
use crate::store::{from_millis, to_millis, StoreError, StoreHandle};
use crate::utils::{truncate_string, Clock, SystemClock};

use super::QueueError;

/// Maximum length of a stored delivery error or rejection reason.
const MAX_ERROR_LENGTH: usize = 500;

/// Milliseconds to step past an occupied token before giving up.
const MAX_TOKEN_COLLISIONS: usize = 16;

const RECORD_COLUMNS: &str = "p.id, p.miqaat_id, p.entry, p.idempotency_token, p.created_at";

const QUEUED_SELECT: &str = "SELECT p.id, p.miqaat_id, p.entry, p.idempotency_token, p.created_at,
        COALESCE(d.status, 'pending'), COALESCE(d.attempts, 0),
        d.last_error, d.last_attempt_at, d.rejected_reason
    FROM pending_attendance p
    LEFT JOIN delivery_state d ON d.pending_id = p.id";

/// Durable, insertion-ordered queue of attendance marks awaiting remote
/// confirmation. Clone is cheap; clones share the store handle.
#[derive(Clone)]
pub struct PendingQueue {
    store: StoreHandle,
    clock: Arc<dyn Clock>,
}

impl PendingQueue {
    pub fn new(store: StoreHandle) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: StoreHandle, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Append a mark and return once it is durably committed.
    ///
    /// Enqueueing an identical mark again within the same millisecond yields
    /// the same token and returns the already-queued record. A different mark
    /// for the same user in that millisecond moves to the next free
    /// millisecond, so it gets its own token.
    pub async fn enqueue(
        &self,
        miqaat_id: &str,
        mut entry: AttendanceEntry,
    ) -> Result<PendingRecord, QueueError> {
        let miqaat_id = miqaat_id.trim().to_string();
        if miqaat_id.is_empty() {
            return Err(QueueError::InvalidEntry("miqaat id is empty".to_string()));
        }
        entry.user_identifier = entry.user_identifier.trim().to_string();
        if entry.user_identifier.is_empty() {
            return Err(QueueError::InvalidEntry("user identifier is empty".to_string()));
        }

        let first_ms = self.clock.now().timestamp_millis();
        let payload =
            serde_json::to_string(&entry).map_err(|e| QueueError::WriteFailure(e.into()))?;

        let (record, inserted) = self
            .store
            .write(move |tx| {
                let existing_sql = format!(
                    "SELECT {} FROM pending_attendance p WHERE p.idempotency_token = ?1",
                    RECORD_COLUMNS
                );
                let mut created_ms = first_ms;

                for _ in 0..MAX_TOKEN_COLLISIONS {
                    let created_at = from_millis(created_ms)?;
                    let token = idempotency_token(&entry.user_identifier, created_at);
                    let inserted = tx.execute(
                        "INSERT OR IGNORE INTO pending_attendance
                            (miqaat_id, entry, idempotency_token, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![miqaat_id, payload, token, created_ms],
                    )?;

                    if inserted == 1 {
                        let id = tx.last_insert_rowid();
                        tx.execute("INSERT INTO delivery_state (pending_id) VALUES (?1)", [id])?;
                        return Ok((
                            PendingRecord {
                                id,
                                miqaat_id,
                                entry,
                                idempotency_token: token,
                                created_at,
                            },
                            true,
                        ));
                    }

                    let existing =
                        tx.query_row_and_then(&existing_sql, params![token], read_record)?;
                    if existing.miqaat_id == miqaat_id && existing.entry == entry {
                        return Ok((existing, false));
                    }
                    created_ms += 1;
                }

                Err(StoreError::TokenCollision(entry.user_identifier))
            })
            .await
            .map_err(QueueError::WriteFailure)?;

        if inserted {
            info!(
                id = record.id,
                miqaat_id = %record.miqaat_id,
                token = %record.idempotency_token,
                "Attendance queued"
            );
        } else {
            debug!(id = record.id, token = %record.idempotency_token, "Attendance already queued");
        }
        Ok(record)
    }

    /// Snapshot of every queued record, pending and rejected, in insertion order.
    pub async fn list(&self) -> Result<Vec<PendingRecord>, QueueError> {
        let records = self
            .store
            .read(|tx| {
                let sql = format!("SELECT {} FROM pending_attendance p ORDER BY p.id", RECORD_COLUMNS);
                let mut stmt = tx.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut records = Vec::new();
                while let Some(row) = rows.next()? {
                    records.push(read_record(row)?);
                }
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    /// Records still eligible for delivery, with their bookkeeping.
    pub async fn deliverable(&self) -> Result<Vec<QueuedRecord>, QueueError> {
        Ok(self
            .store
            .read(|tx| query_queued(tx, "COALESCE(d.status, 'pending') = 'pending'", []))
            .await?)
    }

    /// Records the remote rejected, awaiting an operator.
    pub async fn dead_letters(&self) -> Result<Vec<QueuedRecord>, QueueError> {
        Ok(self
            .store
            .read(|tx| query_queued(tx, "d.status = 'rejected'", []))
            .await?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueuedRecord>, QueueError> {
        let mut found = self
            .store
            .read(move |tx| query_queued(tx, "p.id = ?1", [id]))
            .await?;
        Ok(found.pop())
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .store
            .read(|tx| {
                Ok(tx.query_row("SELECT COUNT(*) FROM pending_attendance", [], |row| {
                    row.get(0)
                })?)
            })
            .await?;
        Ok(count.max(0) as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Delete one record. An id that is already gone is not an error: a
    /// retried sync pass may confirm the same record twice.
    pub async fn remove(&self, id: i64) -> Result<(), QueueError> {
        let removed = self
            .store
            .write(move |tx| {
                tx.execute("DELETE FROM delivery_state WHERE pending_id = ?1", [id])?;
                Ok(tx.execute("DELETE FROM pending_attendance WHERE id = ?1", [id])?)
            })
            .await?;

        if removed == 0 {
            debug!(id, "Record not found on remove, already gone");
        } else {
            debug!(id, "Record removed from queue");
        }
        Ok(())
    }

    /// Discard every queued record, synced or not. Returns how many were dropped.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let discarded = self
            .store
            .write(|tx| {
                tx.execute("DELETE FROM delivery_state", [])?;
                Ok(tx.execute("DELETE FROM pending_attendance", [])?)
            })
            .await?;

        if discarded > 0 {
            warn!(discarded, "Pending queue cleared, unsynced attendance discarded");
        }
        Ok(discarded)
    }

    /// Count a transient delivery failure against the record.
    pub async fn record_retryable_failure(&self, id: i64, error: &str) -> Result<(), QueueError> {
        let error = truncate_string(error, MAX_ERROR_LENGTH);
        let at = to_millis(&self.clock.now());
        let updated = self
            .store
            .write(move |tx| {
                Ok(tx.execute(
                    "UPDATE delivery_state
                     SET attempts = attempts + 1, last_error = ?2, last_attempt_at = ?3
                     WHERE pending_id = ?1",
                    params![id, error, at],
                )?)
            })
            .await?;
        if updated == 0 {
            debug!(id, "Record gone before failure could be recorded");
        }
        Ok(())
    }

    /// Move a record to the terminal rejected state. It is skipped by every
    /// later drain until [`PendingQueue::requeue`].
    pub async fn mark_rejected(&self, id: i64, reason: &str) -> Result<(), QueueError> {
        let reason = truncate_string(reason, MAX_ERROR_LENGTH);
        let at = to_millis(&self.clock.now());
        let updated = self
            .store
            .write(move |tx| {
                Ok(tx.execute(
                    "UPDATE delivery_state
                     SET status = ?2, attempts = attempts + 1, rejected_reason = ?3,
                         last_error = ?3, last_attempt_at = ?4
                     WHERE pending_id = ?1",
                    params![id, DeliveryStatus::Rejected.as_str(), reason, at],
                )?)
            })
            .await?;
        if updated == 0 {
            debug!(id, "Record gone before rejection could be recorded");
        } else {
            warn!(id, "Record dead-lettered");
        }
        Ok(())
    }

    /// Return a rejected record to delivery with a clean attempt history.
    /// Returns `false` if no rejected record has that id.
    pub async fn requeue(&self, id: i64) -> Result<bool, QueueError> {
        let updated = self
            .store
            .write(move |tx| {
                Ok(tx.execute(
                    "UPDATE delivery_state
                     SET status = ?2, attempts = 0, last_error = NULL,
                         last_attempt_at = NULL, rejected_reason = NULL
                     WHERE pending_id = ?1 AND status = ?3",
                    params![
                        id,
                        DeliveryStatus::Pending.as_str(),
                        DeliveryStatus::Rejected.as_str()
                    ],
                )?)
            })
            .await?;
        if updated > 0 {
            info!(id, "Rejected record requeued");
        }
        Ok(updated > 0)
    }
}

fn read_record(row: &Row<'_>) -> Result<PendingRecord, StoreError> {
    let entry: String = row.get(2)?;
    Ok(PendingRecord {
        id: row.get(0)?,
        miqaat_id: row.get(1)?,
        entry: serde_json::from_str(&entry)?,
        idempotency_token: row.get(3)?,
        created_at: from_millis(row.get(4)?)?,
    })
}

fn read_delivery(row: &Row<'_>) -> Result<DeliveryState, StoreError> {
    let status: String = row.get(5)?;
    let status =
        DeliveryStatus::from_str_checked(&status).ok_or_else(|| StoreError::InvalidValue {
            column: "delivery_state.status",
            value: status.clone(),
        })?;
    let last_attempt_at: Option<i64> = row.get(8)?;

    Ok(DeliveryState {
        status,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        last_attempt_at: last_attempt_at.map(from_millis).transpose()?,
        rejected_reason: row.get(9)?,
    })
}

fn query_queued<P: Params>(
    tx: &Transaction<'_>,
    filter: &str,
    params: P,
) -> Result<Vec<QueuedRecord>, StoreError> {
    let sql = format!("{} WHERE {} ORDER BY p.id", QUEUED_SELECT, filter);
    let mut stmt = tx.prepare(&sql)?;
    let mut rows = stmt.query(params)?;
    let mut queued = Vec::new();
    while let Some(row) = rows.next()? {
        queued.push(QueuedRecord {
            record: read_record(row)?,
            delivery: read_delivery(row)?,
        });
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttendanceStatus;
    use crate::store::LocalStore;
    use crate::utils::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    async fn queue_with_clock() -> (PendingQueue, ManualClock, StoreHandle) {
        let store = LocalStore::in_memory();
        let handle = store.open().await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 1, 18, 30, 0).unwrap());
        let queue = PendingQueue::with_clock(handle.clone(), Arc::new(clock.clone()));
        (queue, clock, handle)
    }

    fn present(its: &str) -> AttendanceEntry {
        AttendanceEntry::new(its, AttendanceStatus::Present).marked_by("gate-1")
    }

    #[tokio::test]
    async fn test_enqueue_assigns_token_and_id() {
        let (queue, clock, _) = queue_with_clock().await;

        let record = queue.enqueue("m1", present("10101010")).await.unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.miqaat_id, "m1");
        assert_eq!(
            record.idempotency_token,
            format!("10101010-{}", clock.now().timestamp_millis())
        );

        let listed = queue.list().await.unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[tokio::test]
    async fn test_list_is_insertion_ordered() {
        let (queue, clock, _) = queue_with_clock().await;

        for its in ["30000000", "10000000", "20000000"] {
            queue.enqueue("m1", present(its)).await.unwrap();
            clock.advance(Duration::milliseconds(5));
        }

        let listed = queue.list().await.unwrap();
        let users: Vec<&str> = listed
            .iter()
            .map(|r| r.entry.user_identifier.as_str())
            .collect();
        assert_eq!(users, vec!["30000000", "10000000", "20000000"]);
        assert!(listed.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_same_user_same_instant_is_queued_once() {
        let (queue, _, _) = queue_with_clock().await;

        let entry = present("10101010");
        let first = queue.enqueue("m1", entry.clone()).await.unwrap();
        let second = queue.enqueue("m1", entry).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_different_marks_in_same_millisecond_are_both_kept() {
        let (queue, clock, _) = queue_with_clock().await;
        let ms = clock.now().timestamp_millis();

        let first = queue.enqueue("m1", present("10101010")).await.unwrap();
        let second = queue
            .enqueue("m2", AttendanceEntry::new("10101010", AttendanceStatus::Absent))
            .await
            .unwrap();
        let third = queue
            .enqueue("m1", AttendanceEntry::new("10101010", AttendanceStatus::Late))
            .await
            .unwrap();

        assert_eq!(first.idempotency_token, format!("10101010-{}", ms));
        assert_eq!(second.idempotency_token, format!("10101010-{}", ms + 1));
        assert_eq!(third.idempotency_token, format!("10101010-{}", ms + 2));
        assert_eq!(second.miqaat_id, "m2");
        assert_eq!(second.entry.status, AttendanceStatus::Absent);
        assert_eq!(queue.list().await.unwrap(), vec![first, second, third]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_blank_identity() {
        let (queue, _, _) = queue_with_clock().await;

        assert!(matches!(
            queue.enqueue("  ", present("10101010")).await,
            Err(QueueError::InvalidEntry(_))
        ));
        assert!(matches!(
            queue.enqueue("m1", present("   ")).await,
            Err(QueueError::InvalidEntry(_))
        ));
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_aborted_enqueue_leaves_no_partial_record() {
        let (queue, _, handle) = queue_with_clock().await;
        handle
            .write(|tx| {
                tx.execute_batch("DROP TABLE delivery_state")?;
                Ok(())
            })
            .await
            .unwrap();

        let result = queue.enqueue("m1", present("10101010")).await;
        assert!(matches!(result, Err(QueueError::WriteFailure(_))));
        assert!(queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (queue, _, _) = queue_with_clock().await;
        let record = queue.enqueue("m1", present("10101010")).await.unwrap();

        queue.remove(record.id).await.unwrap();
        queue.remove(record.id).await.unwrap();
        queue.remove(9999).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_discards_everything_and_ids_are_not_reused() {
        let (queue, clock, _) = queue_with_clock().await;
        queue.enqueue("m1", present("10000000")).await.unwrap();
        clock.advance(Duration::milliseconds(1));
        let last = queue.enqueue("m1", present("20000000")).await.unwrap();

        assert_eq!(queue.clear().await.unwrap(), 2);
        assert!(queue.is_empty().await.unwrap());

        clock.advance(Duration::milliseconds(1));
        let next = queue.enqueue("m1", present("30000000")).await.unwrap();
        assert!(next.id > last.id);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_counted() {
        let (queue, clock, _) = queue_with_clock().await;
        let record = queue.enqueue("m1", present("10101010")).await.unwrap();

        clock.advance(Duration::seconds(3));
        queue
            .record_retryable_failure(record.id, &"x".repeat(2000))
            .await
            .unwrap();
        queue
            .record_retryable_failure(record.id, "connection reset")
            .await
            .unwrap();

        let queued = queue.get(record.id).await.unwrap().unwrap();
        assert_eq!(queued.delivery.attempts, 2);
        assert_eq!(queued.delivery.status, DeliveryStatus::Pending);
        assert_eq!(queued.delivery.last_error.as_deref(), Some("connection reset"));
        assert_eq!(queued.delivery.last_attempt_at, Some(clock.now()));
        // The payload itself never changes
        assert_eq!(queued.record, record);
    }

    #[tokio::test]
    async fn test_rejected_records_leave_delivery_until_requeued() {
        let (queue, clock, _) = queue_with_clock().await;
        let bad = queue.enqueue("m1", present("10000000")).await.unwrap();
        clock.advance(Duration::milliseconds(1));
        let good = queue.enqueue("m1", present("20000000")).await.unwrap();

        queue.mark_rejected(bad.id, "unknown miqaat").await.unwrap();

        let deliverable: Vec<i64> = queue
            .deliverable()
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.record.id)
            .collect();
        assert_eq!(deliverable, vec![good.id]);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].delivery.rejected_reason.as_deref(), Some("unknown miqaat"));
        // Still part of the queue until discarded
        assert_eq!(queue.list().await.unwrap().len(), 2);

        assert!(queue.requeue(bad.id).await.unwrap());
        assert!(!queue.requeue(bad.id).await.unwrap());
        let requeued = queue.get(bad.id).await.unwrap().unwrap();
        assert_eq!(requeued.delivery, DeliveryState::default());
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }
}
