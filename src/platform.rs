//! Platform port: the OS services the agent core is allowed to touch.
//!
//! ```text
//!   Instance / Supervisor / Lock ──▶ Platform ──▶ std::thread, allocator accounting
//! ```
//!
//! Every resource the core creates (instance handle, service state, Lock,
//! worker record, session buffer, transaction) is reserved here first and
//! released exactly once through a [`Reservation`] guard. Production code uses
//! [`StdPlatform`]; [`AuditPlatform`] counts live reservations and can fail
//! the Nth reservation or spawn, which is how start-up rollback is verified.

use core::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use log::debug;

/// Categories of resources the core accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Instance,
    ServiceState,
    Lock,
    Worker,
    SessionBuffer,
    Transaction,
}

impl ResourceKind {
    pub const ALL: [Self; 6] = [
        Self::Instance,
        Self::ServiceState,
        Self::Lock,
        Self::Worker,
        Self::SessionBuffer,
        Self::Transaction,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Instance => "instance",
            Self::ServiceState => "service state",
            Self::Lock => "lock",
            Self::Worker => "worker",
            Self::SessionBuffer => "session buffer",
            Self::Transaction => "transaction",
        };
        f.write_str(name)
    }
}

/// A reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted(pub ResourceKind);

/// Body handed to [`Platform::spawn`].
pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// OS services used by the core.
pub trait Platform: Send + Sync + 'static {
    /// Reserve one unit of `kind`. Refusal models allocation failure.
    fn reserve(&self, kind: ResourceKind) -> Result<(), Exhausted>;

    /// Return one unit of `kind` previously reserved.
    fn release(&self, kind: ResourceKind);

    /// Start an OS thread running `body`.
    fn spawn(&self, name: &str, body: ThreadBody) -> io::Result<JoinHandle<()>>;

    /// Give up the processor.
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

pub type SharedPlatform = Arc<dyn Platform>;

// ── Reservation guard ────────────────────────────────────────

/// One reserved unit. Released when dropped.
pub struct Reservation {
    kind: ResourceKind,
    platform: SharedPlatform,
}

impl Reservation {
    pub fn acquire(platform: &SharedPlatform, kind: ResourceKind) -> Result<Self, Exhausted> {
        platform.reserve(kind)?;
        Ok(Self {
            kind,
            platform: Arc::clone(platform),
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.platform.release(self.kind);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reservation").field(&self.kind).finish()
    }
}

// ── Production platform ──────────────────────────────────────

/// Plain `std::thread` platform. Reservations always succeed.
pub struct StdPlatform {
    stack_kb: usize,
}

impl StdPlatform {
    pub const DEFAULT_STACK_KB: usize = 64;

    pub fn new() -> Self {
        Self {
            stack_kb: Self::DEFAULT_STACK_KB,
        }
    }

    pub fn shared() -> SharedPlatform {
        Arc::new(Self::new())
    }
}

impl Default for StdPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for StdPlatform {
    fn reserve(&self, _kind: ResourceKind) -> Result<(), Exhausted> {
        Ok(())
    }

    fn release(&self, _kind: ResourceKind) {}

    fn spawn(&self, name: &str, body: ThreadBody) -> io::Result<JoinHandle<()>> {
        debug!("platform: spawning '{}' (stack={}KB)", name, self.stack_kb);
        std::thread::Builder::new()
            .name(name.to_owned())
            .stack_size(self.stack_kb * 1024)
            .spawn(body)
    }
}

// ── Auditing platform ────────────────────────────────────────

const NO_FAULT: usize = usize::MAX;

/// Counting platform with fault injection.
///
/// Reservations and spawns are numbered from zero in call order. Arming
/// `fail_reservation_at(n)` or `fail_spawn_at(n)` makes exactly that call
/// fail; every other call behaves like [`StdPlatform`].
pub struct AuditPlatform {
    inner: StdPlatform,
    live: [AtomicUsize; ResourceKind::ALL.len()],
    reservations: AtomicUsize,
    spawns: AtomicUsize,
    fail_reservation: AtomicUsize,
    fail_spawn: AtomicUsize,
}

impl AuditPlatform {
    pub fn new() -> Self {
        Self {
            inner: StdPlatform::new(),
            live: Default::default(),
            reservations: AtomicUsize::new(0),
            spawns: AtomicUsize::new(0),
            fail_reservation: AtomicUsize::new(NO_FAULT),
            fail_spawn: AtomicUsize::new(NO_FAULT),
        }
    }

    pub fn fail_reservation_at(&self, n: usize) {
        self.fail_reservation.store(n, Ordering::SeqCst);
    }

    pub fn fail_spawn_at(&self, n: usize) {
        self.fail_spawn.store(n, Ordering::SeqCst);
    }

    pub fn live(&self, kind: ResourceKind) -> usize {
        self.live[kind.index()].load(Ordering::SeqCst)
    }

    pub fn total_live(&self) -> usize {
        ResourceKind::ALL.iter().map(|k| self.live(*k)).sum()
    }

    /// Reservation attempts since the last reset, including refused ones.
    pub fn reservation_calls(&self) -> usize {
        self.reservations.load(Ordering::SeqCst)
    }

    pub fn spawn_calls(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl Default for AuditPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for AuditPlatform {
    fn reserve(&self, kind: ResourceKind) -> Result<(), Exhausted> {
        let n = self.reservations.fetch_add(1, Ordering::SeqCst);
        if n == self.fail_reservation.load(Ordering::SeqCst) {
            debug!("audit: refusing reservation #{} ({})", n, kind);
            return Err(Exhausted(kind));
        }
        self.live[kind.index()].fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, kind: ResourceKind) {
        let prev = self.live[kind.index()].fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "audit: {kind} released more often than reserved");
    }

    fn spawn(&self, name: &str, body: ThreadBody) -> io::Result<JoinHandle<()>> {
        let n = self.spawns.fetch_add(1, Ordering::SeqCst);
        if n == self.fail_spawn.load(Ordering::SeqCst) {
            debug!("audit: refusing spawn #{} ('{}')", n, name);
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "injected spawn failure"));
        }
        self.inner.spawn(name, body)
    }
}
