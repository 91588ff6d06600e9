use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, ApplyOutcome, ApplyRequest, AttendanceRemote, UserDirectory};
use crate::cache::UserCache;
use crate::models::{DeliveryState, PendingRecord, QueuedRecord};
use crate::queue::PendingQueue;

use super::connectivity::ConnectivityMonitor;
use super::report::{DrainOutcome, DrainReport, RecordOutcome, SyncEvent};
use super::SyncError;

// ============================================================================
// Constants
// ============================================================================

/// Buffer size for the sync event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 60;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 2_000;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 600;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Upper bound on one remote call.
    pub submit_timeout: Duration,
    /// Fallback drain period while online.
    pub drain_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive retryable failures after which a pass gives up.
    pub max_consecutive_failures: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(DEFAULT_SUBMIT_TIMEOUT_SECS),
            drain_interval: Duration::from_secs(DEFAULT_DRAIN_INTERVAL_SECS),
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl SyncOptions {
    /// Wait imposed after `attempts` failed deliveries: zero before the first
    /// failure, then doubling from `initial_backoff` up to `max_backoff`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Whether a record's backoff window has elapsed at `now`.
    pub fn is_due(&self, delivery: &DeliveryState, now: DateTime<Utc>) -> bool {
        match delivery.last_attempt_at {
            None => true,
            Some(at) => {
                let elapsed = (now - at).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.backoff(delivery.attempts)
            }
        }
    }
}

/// Drains the pending queue against the remote service.
///
/// Delivery is at-least-once: a record leaves the queue only after the
/// remote confirms it, and the remote absorbs repeats by idempotency token.
/// Only one pass runs at a time; overlapping triggers are folded into one
/// extra pass by whoever holds the gate.
pub struct SyncEngine {
    queue: PendingQueue,
    cache: UserCache,
    remote: Arc<dyn AttendanceRemote>,
    options: SyncOptions,
    gate: Mutex<()>,
    rerun: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        queue: PendingQueue,
        cache: UserCache,
        remote: Arc<dyn AttendanceRemote>,
        options: SyncOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue,
            cache,
            remote,
            options,
            gate: Mutex::new(()),
            rerun: AtomicBool::new(false),
            events,
        }
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn cache(&self) -> &UserCache {
        &self.cache
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ===== Drain =====

    /// Submit every deliverable record and remove the confirmed ones.
    ///
    /// Returns [`DrainOutcome::Coalesced`] without doing any work if another
    /// drain is running; that drain makes one more pass before it returns.
    /// Dropping the future at any await leaves unconfirmed records queued.
    pub async fn drain(&self) -> Result<DrainOutcome, SyncError> {
        let mut report: Option<DrainReport> = None;

        loop {
            let guard = match self.gate.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.rerun.store(true, Ordering::SeqCst);
                    // The holder may have released between our attempt and
                    // the flag store; if so, run the pass ourselves.
                    match self.gate.try_lock() {
                        Ok(guard) => guard,
                        Err(_) => {
                            debug!("Drain already running, coalesced");
                            break;
                        }
                    }
                }
            };

            self.rerun.store(false, Ordering::SeqCst);
            let pass = self.drain_pass().await;
            drop(guard);

            let pass = match pass {
                Ok(pass) => pass,
                Err(e) => {
                    // A trigger that arrived during the failed pass still
                    // gets its pass.
                    if self.rerun.swap(false, Ordering::SeqCst) {
                        warn!(error = %e, "Drain pass failed, running again for queued trigger");
                        continue;
                    }
                    return Err(e);
                }
            };
            match report.as_mut() {
                Some(report) => report.absorb(pass),
                None => report = Some(pass),
            }

            if !self.rerun.load(Ordering::SeqCst) {
                break;
            }
            debug!("Drain requested during pass, running again");
        }

        match report {
            Some(report) => {
                info!(
                    passes = report.passes,
                    confirmed = report.confirmed(),
                    retried = report.retried(),
                    rejected = report.rejected(),
                    deferred = report.deferred,
                    untried = report.untried,
                    "Drain completed"
                );
                self.emit(SyncEvent::DrainCompleted(report.clone()));
                Ok(DrainOutcome::Completed(report))
            }
            None => Ok(DrainOutcome::Coalesced),
        }
    }

    async fn drain_pass(&self) -> Result<DrainReport, SyncError> {
        let queued = self.queue.deliverable().await?;
        let now = self.queue.clock().now();
        let mut report = DrainReport {
            passes: 1,
            ..Default::default()
        };
        let mut consecutive_failures = 0u32;

        debug!(queued = queued.len(), "Drain pass started");

        for QueuedRecord { record, delivery } in queued {
            if report.aborted {
                report.untried += 1;
                continue;
            }
            if !self.options.is_due(&delivery, now) {
                debug!(id = record.id, attempts = delivery.attempts, "Record in backoff");
                report.deferred += 1;
                continue;
            }

            let request = ApplyRequest::from(&record);
            let outcome = match self.submit(&request).await {
                Ok(ApplyOutcome::Accepted) => self.confirm(&record, false).await,
                Ok(ApplyOutcome::AlreadyApplied) => self.confirm(&record, true).await,
                Ok(ApplyOutcome::Rejected { reason }) => self.dead_letter(&record, reason).await,
                Err(e) => {
                    let outcome = self.retry_later(&record, &e).await;
                    if e.is_systemic() {
                        warn!(error = %e, "Remote refused the session, stopping drain pass");
                        report.aborted = true;
                    }
                    outcome
                }
            };

            if matches!(outcome, RecordOutcome::Retried { .. }) {
                consecutive_failures += 1;
                let exhausted = consecutive_failures >= self.options.max_consecutive_failures;
                if exhausted && !report.aborted {
                    warn!(
                        consecutive_failures,
                        "Remote unreachable, stopping drain pass early"
                    );
                    report.aborted = true;
                }
            } else {
                consecutive_failures = 0;
            }
            report.outcomes.push(outcome);
        }

        Ok(report)
    }

    async fn submit(&self, request: &ApplyRequest) -> Result<ApplyOutcome, ApiError> {
        match tokio::time::timeout(self.options.submit_timeout, self.remote.apply(request)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(self.options.submit_timeout)),
        }
    }

    async fn confirm(&self, record: &PendingRecord, already_applied: bool) -> RecordOutcome {
        // If this fails the record is resubmitted next pass and the remote
        // answers AlreadyApplied.
        if let Err(e) = self.queue.remove(record.id).await {
            error!(id = record.id, error = %e, "Failed to remove confirmed record");
        } else {
            debug!(id = record.id, already_applied, "Record confirmed");
        }
        RecordOutcome::Confirmed {
            id: record.id,
            idempotency_token: record.idempotency_token.clone(),
            already_applied,
        }
    }

    async fn retry_later(&self, record: &PendingRecord, err: &ApiError) -> RecordOutcome {
        let error = err.to_string();
        warn!(id = record.id, error = %error, "Delivery failed, will retry");
        if let Err(e) = self.queue.record_retryable_failure(record.id, &error).await {
            error!(id = record.id, error = %e, "Failed to record delivery failure");
        }
        RecordOutcome::Retried {
            id: record.id,
            idempotency_token: record.idempotency_token.clone(),
            error,
        }
    }

    async fn dead_letter(&self, record: &PendingRecord, reason: String) -> RecordOutcome {
        warn!(
            id = record.id,
            token = %record.idempotency_token,
            reason = %reason,
            "Remote rejected attendance"
        );
        if let Err(e) = self.queue.mark_rejected(record.id, &reason).await {
            error!(id = record.id, error = %e, "Failed to dead-letter rejected record");
        }
        self.emit(SyncEvent::Rejected {
            id: record.id,
            idempotency_token: record.idempotency_token.clone(),
            reason: reason.clone(),
        });
        RecordOutcome::Rejected {
            id: record.id,
            idempotency_token: record.idempotency_token.clone(),
            reason,
        }
    }

    // ===== User Directory =====

    /// Replace the user cache with a fresh snapshot from `directory`.
    /// On any failure the existing cache is left untouched.
    pub async fn refresh_users(&self, directory: &dyn UserDirectory) -> Result<usize, SyncError> {
        let users = match tokio::time::timeout(self.options.submit_timeout, directory.fetch_users())
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ApiError::Timeout(self.options.submit_timeout).into()),
        };
        let count = self.cache.refresh(users).await?;
        self.emit(SyncEvent::UsersRefreshed { count });
        Ok(count)
    }

    // ===== Background Loop =====

    /// Drain on every Offline to Online transition and on each
    /// `drain_interval` tick while online, until `shutdown` resolves.
    pub async fn run<F>(&self, monitor: &dyn ConnectivityMonitor, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut connectivity = monitor.subscribe();
        let mut watching = true;
        let mut online = connectivity.borrow_and_update().is_online();

        let period = self.options.drain_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        info!(online, interval_secs = period.as_secs(), "Sync loop started");

        if online {
            self.drain_and_log().await;
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        warn!("Connectivity monitor closed, falling back to timer");
                        watching = false;
                        continue;
                    }
                    let now_online = connectivity.borrow_and_update().is_online();
                    let restored = now_online && !online;
                    online = now_online;
                    if restored {
                        info!("Connectivity restored, draining");
                        self.drain_and_log().await;
                    }
                }
                _ = ticker.tick() => {
                    if online || !watching {
                        self.drain_and_log().await;
                    }
                }
            }
        }

        info!("Sync loop stopped");
    }

    async fn drain_and_log(&self) {
        match self.drain().await {
            Ok(DrainOutcome::Completed(_)) | Ok(DrainOutcome::Coalesced) => {}
            Err(e) => error!(error = %e, "Drain failed"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
