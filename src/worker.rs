//! Worker thread supervisor.
//!
//! Every background thread the core runs (the engine driver and one worker
//! per inbound service) goes through the same start/stop handshake:
//!
//! ```text
//!   start:  record{StartRequested} ──spawn──▶ entry: mark_running()
//!           caller yields while status == StartRequested
//!
//!   stop:   Running ──▶ StopRequested, release wake lock
//!           caller yields while status != NotStarted, destroy lock, join
//! ```
//!
//! The trampoline around the entry function sets `NotStarted` when the entry
//! returns, also when it panics, so a stop request can never wait on a dead
//! thread.

use core::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;

use log::{error, info, warn};

use crate::config::RetryPolicy;
use crate::error::{LockError, StartError};
use crate::platform::{Platform, Reservation, ResourceKind, SharedPlatform};
use crate::sync::{Acquire, Lock, Timeout};

/// What a worker thread is for. Also names the OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    EngineDriver,
    RemoteConfig,
    DataReceive,
    CommandExecution,
    Firmware,
}

impl WorkerRole {
    pub const fn thread_name(self) -> &'static str {
        match self {
            Self::EngineDriver => "cl-engine",
            Self::RemoteConfig => "cl-rci",
            Self::DataReceive => "cl-receive",
            Self::CommandExecution => "cl-cli",
            Self::Firmware => "cl-firmware",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.thread_name())
    }
}

/// Lifecycle of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    NotStarted = 0,
    StartRequested = 1,
    Running = 2,
    StopRequested = 3,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::StartRequested,
            2 => Self::Running,
            3 => Self::StopRequested,
            _ => Self::NotStarted,
        }
    }
}

struct WorkerRecord {
    role: WorkerRole,
    status: AtomicU8,
    lock: Lock,
    _reservation: Reservation,
}

impl WorkerRecord {
    fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn transition(&self, from: WorkerStatus, to: WorkerStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ── Worker side ──────────────────────────────────────────────

/// The worker's view of its own record.
#[derive(Clone)]
pub struct WorkerContext {
    record: Arc<WorkerRecord>,
}

impl WorkerContext {
    pub fn role(&self) -> WorkerRole {
        self.record.role
    }

    pub fn status(&self) -> WorkerStatus {
        self.record.status()
    }

    /// Report initialization done. Must be called once before blocking.
    pub fn mark_running(&self) {
        if !self
            .record
            .transition(WorkerStatus::StartRequested, WorkerStatus::Running)
        {
            warn!(
                "worker[{}]: mark_running in state {:?}",
                self.record.role,
                self.record.status()
            );
        }
    }

    pub fn should_run(&self) -> bool {
        self.record.status() == WorkerStatus::Running
    }

    /// Ask the loop to wind down from inside the worker.
    pub fn request_stop(&self) {
        self.record
            .transition(WorkerStatus::Running, WorkerStatus::StopRequested);
    }

    /// Block until someone signals this worker, or until `timeout`.
    pub fn wait_signal(&self, timeout: Timeout) -> Result<Acquire, LockError> {
        self.record.lock.acquire(timeout)
    }

    pub fn waker(&self) -> WorkerWaker {
        WorkerWaker {
            lock: self.record.lock.clone(),
        }
    }
}

/// Handle other threads use to wake a worker blocked in `wait_signal`.
#[derive(Clone, Debug)]
pub struct WorkerWaker {
    lock: Lock,
}

impl WorkerWaker {
    pub fn wake(&self) -> Result<(), LockError> {
        self.lock.release()
    }
}

// ── Owner side ───────────────────────────────────────────────

/// A started worker. Dropping it stops the worker.
pub struct WorkerThread {
    record: Option<Arc<WorkerRecord>>,
    join: Option<JoinHandle<()>>,
    role: WorkerRole,
}

impl WorkerThread {
    pub fn status(&self) -> WorkerStatus {
        self.record
            .as_ref()
            .map_or(WorkerStatus::NotStarted, |r| r.status())
    }

    pub fn waker(&self) -> Option<WorkerWaker> {
        self.record.as_ref().map(|r| WorkerWaker {
            lock: r.lock.clone(),
        })
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.record.is_some() {
            warn!("worker[{}]: dropped while started, stopping", self.role);
            Supervisor::halt(self, &RetryPolicy::default(), None);
        }
    }
}

/// Starts and stops workers with the handshake described in the module docs.
#[derive(Clone)]
pub struct Supervisor {
    platform: SharedPlatform,
    retry: RetryPolicy,
}

impl Supervisor {
    pub fn new(platform: SharedPlatform, retry: RetryPolicy) -> Self {
        Self { platform, retry }
    }

    /// Start `entry` on a new thread and wait until it has left
    /// `StartRequested`.
    pub fn start<F>(&self, role: WorkerRole, entry: F) -> Result<WorkerThread, StartError>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        let reservation = Reservation::acquire(&self.platform, ResourceKind::Worker)
            .map_err(|e| StartError::OutOfMemory(e.0))?;
        let lock = Lock::create(&self.platform)?;
        let record = Arc::new(WorkerRecord {
            role,
            status: AtomicU8::new(WorkerStatus::StartRequested as u8),
            lock,
            _reservation: reservation,
        });

        let ctx = WorkerContext {
            record: Arc::clone(&record),
        };
        let trampoline = move || {
            let exit = Arc::clone(&ctx.record);
            if catch_unwind(AssertUnwindSafe(|| entry(ctx))).is_err() {
                error!("worker[{}]: entry panicked", exit.role);
            }
            exit.set(WorkerStatus::NotStarted);
        };

        let join = match self.platform.spawn(role.thread_name(), Box::new(trampoline)) {
            Ok(join) => join,
            Err(e) => {
                warn!("worker[{}]: spawn failed: {}", role, e);
                record.lock.destroy();
                return Err(StartError::ThreadCreationFailed(role));
            }
        };

        let mut attempt = 0;
        while record.status() == WorkerStatus::StartRequested {
            self.retry.pause(self.platform.as_ref(), attempt);
            attempt = attempt.saturating_add(1);
        }
        info!("worker[{}]: started", role);
        Ok(WorkerThread {
            record: Some(record),
            join: Some(join),
            role,
        })
    }

    /// Stop a worker and free its record. A second call is a no-op.
    pub fn stop(&self, worker: &mut WorkerThread) {
        Self::halt(worker, &self.retry, Some(self.platform.as_ref()));
    }

    fn halt(
        worker: &mut WorkerThread,
        retry: &RetryPolicy,
        platform: Option<&dyn Platform>,
    ) {
        let Some(record) = worker.record.take() else {
            return;
        };
        record.transition(WorkerStatus::Running, WorkerStatus::StopRequested);
        if let Err(e) = record.lock.release() {
            warn!("worker[{}]: wake on stop failed: {}", record.role, e);
        }

        let mut attempt = 0;
        while record.status() != WorkerStatus::NotStarted {
            match platform {
                Some(p) => retry.pause(p, attempt),
                None => std::thread::yield_now(),
            }
            attempt = attempt.saturating_add(1);
        }
        if let Some(join) = worker.join.take() {
            if join.join().is_err() {
                error!("worker[{}]: thread exited abnormally", record.role);
            }
        }
        record.lock.destroy();
        info!("worker[{}]: stopped", record.role);
    }
}
