/// What happened to one record during a drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The remote applied the entry, now or on an earlier delivery.
    Confirmed {
        id: i64,
        idempotency_token: String,
        already_applied: bool,
    },
    /// Transient failure; the record stays queued.
    Retried {
        id: i64,
        idempotency_token: String,
        error: String,
    },
    /// Terminal failure; the record is dead-lettered.
    Rejected {
        id: i64,
        idempotency_token: String,
        reason: String,
    },
}

impl RecordOutcome {
    pub fn id(&self) -> i64 {
        match self {
            RecordOutcome::Confirmed { id, .. }
            | RecordOutcome::Retried { id, .. }
            | RecordOutcome::Rejected { id, .. } => *id,
        }
    }
}

/// Summary of one drain call, across every pass it ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub passes: u32,
    pub outcomes: Vec<RecordOutcome>,
    /// Records skipped because their backoff window had not elapsed.
    pub deferred: usize,
    /// Records left untried after the pass stopped early.
    pub untried: usize,
    /// Whether any pass stopped early on consecutive failures.
    pub aborted: bool,
}

impl DrainReport {
    pub fn confirmed(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Confirmed { .. }))
    }

    pub fn retried(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Retried { .. }))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Rejected { .. }))
    }

    fn count(&self, pred: impl Fn(&RecordOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }

    /// Fold a later pass into this report. Deferred and untried counts
    /// describe the queue as the latest pass left it.
    pub(crate) fn absorb(&mut self, pass: DrainReport) {
        self.passes += pass.passes;
        self.outcomes.extend(pass.outcomes);
        self.deferred = pass.deferred;
        self.untried = pass.untried;
        self.aborted |= pass.aborted;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain was running; it will make one more pass on our behalf.
    Coalesced,
}

/// Notifications broadcast by the sync engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    DrainCompleted(DrainReport),
    Rejected {
        id: i64,
        idempotency_token: String,
        reason: String,
    },
    UsersRefreshed {
        count: usize,
    },
}
