//! Record of what `start` acquired, in order, with how to give each back.
//!
//! Rollback after a failed start and teardown during stop both drain the
//! same record in reverse, so the two paths cannot disagree about order.

use core::fmt;

use log::info;

use crate::services::Service;
use crate::worker::WorkerRole;

/// One acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InstanceHandle,
    ServiceState(Service),
    FileSystem,
    ShortMessage,
    TransactionTable,
    TransportTable,
    InitiateLock,
    EngineOpened,
    Worker(WorkerRole),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceHandle => write!(f, "instance handle"),
            Self::ServiceState(s) => write!(f, "{s} service state"),
            Self::FileSystem => write!(f, "file-system state"),
            Self::ShortMessage => write!(f, "short-message state"),
            Self::TransactionTable => write!(f, "transaction table"),
            Self::TransportTable => write!(f, "transport table"),
            Self::InitiateLock => write!(f, "initiate lock"),
            Self::EngineOpened => write!(f, "engine"),
            Self::Worker(role) => write!(f, "worker {role}"),
        }
    }
}

type Undo = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct Ledger {
    entries: Vec<(Step, Undo)>,
}

impl Ledger {
    pub fn record(&mut self, step: Step, undo: impl FnOnce() + Send + 'static) {
        self.entries.push((step, Box::new(undo)));
    }

    pub fn steps(&self) -> Vec<Step> {
        self.entries.iter().map(|(s, _)| *s).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Release everything, newest first.
    pub fn unwind(&mut self) {
        while let Some((step, undo)) = self.entries.pop() {
            info!("lifecycle: releasing {}", step);
            undo();
        }
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        self.unwind();
    }
}
