//! Outbound transactions: a caller thread blocks on a Lock until the engine
//! thread reports completion.
//!
//! ```text
//!   caller: begin() ─▶ initiate ─▶ wait(timeout) ◀── release ── on_complete: engine
//! ```
//!
//! The pending table keeps its own reference to every transaction until the
//! engine completes it, so a caller that gave up on its timeout never leaves
//! the engine writing into freed state.

use std::sync::{Arc, OnceLock};

use log::debug;

use super::arena::{Arena, Correlation};
use crate::engine::CompletionStatus;
use crate::error::{ActionError, LockError};
use crate::platform::{Reservation, ResourceKind, SharedPlatform};
use crate::sync::{Acquire, Guarded, Lock, Timeout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Completion {
    pub status: CompletionStatus,
    pub response: Vec<u8>,
}

pub(crate) struct Transaction {
    signal: Lock,
    outcome: OnceLock<Completion>,
    _reservation: Reservation,
}

impl Transaction {
    pub fn wait(&self, timeout: Timeout) -> Result<Completion, ActionError> {
        match self.signal.acquire(timeout) {
            Ok(Acquire::Acquired) => self.outcome.get().cloned().ok_or(ActionError::Cancelled),
            Ok(Acquire::TimedOut) => Err(ActionError::TimedOut),
            Err(_) => Err(ActionError::LockFailed),
        }
    }
}

pub(crate) struct TransactionTable {
    pending: Guarded<Arena<Arc<Transaction>>>,
}

impl TransactionTable {
    pub fn create(platform: &SharedPlatform) -> Result<Self, LockError> {
        Ok(Self {
            pending: Guarded::create(platform, Arena::default())?,
        })
    }

    pub fn begin(
        &self,
        platform: &SharedPlatform,
    ) -> Result<(Correlation, Arc<Transaction>), ActionError> {
        let reservation = Reservation::acquire(platform, ResourceKind::Transaction)
            .map_err(|_| ActionError::OutOfMemory)?;
        let signal = Lock::create(platform).map_err(|_| ActionError::LockFailed)?;
        let txn = Arc::new(Transaction {
            signal,
            outcome: OnceLock::new(),
            _reservation: reservation,
        });
        let id = self
            .pending
            .with(|p| p.insert(Arc::clone(&txn)))
            .map_err(|_| ActionError::NotRunning)?;
        Ok((id, txn))
    }

    /// Drop a transaction the engine never accepted.
    pub fn abandon(&self, id: Correlation) {
        let _ = self.pending.with(|p| p.remove(id));
    }

    pub fn complete(&self, id: Correlation, status: CompletionStatus, response: &[u8]) {
        let Ok(Some(txn)) = self.pending.with(|p| p.remove(id)) else {
            debug!("txn: completion for unknown handle {}", id);
            return;
        };
        let _ = txn.outcome.set(Completion {
            status,
            response: response.to_vec(),
        });
        if let Err(e) = txn.signal.release() {
            debug!("txn: signal {} failed: {}", id, e);
        }
    }

    /// Complete everything still pending as cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained = self.pending.with(Arena::drain).unwrap_or_default();
        let n = drained.len();
        for (id, txn) in drained {
            let _ = txn.outcome.set(Completion {
                status: CompletionStatus::Cancelled,
                response: Vec::new(),
            });
            if let Err(e) = txn.signal.release() {
                debug!("txn: cancel {} failed: {}", id, e);
            }
        }
        n
    }

    pub fn pending(&self) -> usize {
        self.pending.with(|p| p.len()).unwrap_or(0)
    }

    pub fn destroy(&self) {
        self.pending.destroy();
    }
}
