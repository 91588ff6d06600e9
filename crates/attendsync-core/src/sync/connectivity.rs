use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

/// Source of connectivity transitions. The sync loop drains on every
/// Offline to Online edge it observes.
pub trait ConnectivityMonitor: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Connectivity>;
}

/// Connectivity driven by the host: a platform callback, a health probe, or
/// a test. Clones share the same state.
#[derive(Debug, Clone)]
pub struct ManualConnectivity {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl ManualConnectivity {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Report the current state. Returns `true` if it changed.
    pub fn set(&self, state: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(?state, "Connectivity changed");
        }
        changed
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}
