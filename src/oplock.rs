//! Per-instance operation locks.
//!
//! Start, stop and restart transitions on the same instance must never
//! overlap. The registry keeps at most one active lock per instance id; a
//! second attempt with a different action fails, while a matching attempt
//! on a `reusable` lock joins the existing one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::debug;

use crate::{Error, Result};

/// Lifecycle actions that are serialized per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start => write!(f, "start"),
            Action::Stop => write!(f, "stop"),
            Action::Restart => write!(f, "restart"),
        }
    }
}

/// An active lifecycle operation on one instance.
///
/// Dropped waiters are woken by `done()`, which also removes the lock from
/// the registry. `done()` is idempotent; only the first call records the
/// outcome.
#[derive(Debug)]
pub struct OperationLock {
    instance_id: i64,
    action: Action,
    reusable: bool,
    cancellable: bool,
    outcome: Mutex<Outcome>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    registry: Weak<Mutex<HashMap<i64, Arc<OperationLock>>>>,
}

#[derive(Debug)]
struct Outcome {
    finished: bool,
    error: Option<String>,
}

impl OperationLock {
    pub fn action(&self) -> Action {
        self.action
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    /// Mark the operation finished, wake all waiters and drop the registry
    /// entry. Subsequent calls are no-ops.
    pub fn done(&self, err: Option<&Error>) {
        {
            let mut outcome = self.outcome.lock().expect("oplock outcome poisoned");
            if outcome.finished {
                return;
            }
            outcome.finished = true;
            outcome.error = err.map(|e| e.to_string());
        }

        if let Some(registry) = self.registry.upgrade() {
            let mut locks = registry.lock().expect("oplock registry poisoned");
            // Only remove our own entry; a replacement lock may already exist.
            if let Some(current) = locks.get(&self.instance_id) {
                if std::ptr::eq(current.as_ref(), self) {
                    locks.remove(&self.instance_id);
                }
            }
        }

        debug!(instance = self.instance_id, action = %self.action, "operation lock released");
        let _ = self.done_tx.send(true);
    }

    /// Block until `done()` is called, returning the recorded outcome.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        let outcome = self.outcome.lock().expect("oplock outcome poisoned");
        match &outcome.error {
            Some(msg) => Err(Error::Internal(msg.clone())),
            None => Ok(()),
        }
    }
}

/// Process-wide mapping of instance id to its active operation lock.
pub struct OperationLockRegistry {
    locks: Arc<Mutex<HashMap<i64, Arc<OperationLock>>>>,
}

impl OperationLockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a lock for `instance_id`, or join an existing reusable lock
    /// with the same action.
    pub fn create(
        &self,
        instance_id: i64,
        action: Action,
        reusable: bool,
        cancellable: bool,
    ) -> Result<Arc<OperationLock>> {
        let mut locks = self.locks.lock().expect("oplock registry poisoned");

        if let Some(existing) = locks.get(&instance_id) {
            if existing.action == action && existing.reusable {
                return Ok(existing.clone());
            }
            return Err(Error::AlreadyRunningOperation(existing.action));
        }

        let (done_tx, done_rx) = watch::channel(false);
        let lock = Arc::new(OperationLock {
            instance_id,
            action,
            reusable,
            cancellable,
            outcome: Mutex::new(Outcome {
                finished: false,
                error: None,
            }),
            done_tx,
            done_rx,
            registry: Arc::downgrade(&self.locks),
        });

        locks.insert(instance_id, lock.clone());
        debug!(instance = instance_id, action = %action, "operation lock created");
        Ok(lock)
    }

    /// Return the active lock for an instance, if any.
    pub fn get(&self, instance_id: i64) -> Option<Arc<OperationLock>> {
        self.locks
            .lock()
            .expect("oplock registry poisoned")
            .get(&instance_id)
            .cloned()
    }
}

impl Default for OperationLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
