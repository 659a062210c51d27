//! Cross-thread transaction coordinator.
//!
//! Owns everything the engine driver, the service workers and application
//! threads share while an instance runs:
//!
//! ```text
//!                         ┌──────────────────────── Coordinator ───────────────────────┐
//!  engine thread ────────▶│ ServiceRuntime[svc]: admission slot ─wake─▶ service worker │
//!  (EngineCallbacks)      │ TransactionTable: pending outbound ─release─▶ caller       │
//!                         │ TransportTable, event queue                                │
//!  application threads ──▶│ engine (behind its initiate Lock)                          │
//!                         └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each shared structure sits behind its own [`Guarded`] Lock. No code path
//! holds two of them across a call into the engine or a handler.

mod arena;
pub(crate) mod driver;
pub(crate) mod session;
pub(crate) mod transaction;
pub(crate) mod transport;

pub use arena::Correlation;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, error, info, warn};

use self::arena::Arena;
use self::session::{Admission, Session, SessionState};
use self::transaction::TransactionTable;
use self::transport::TransportTable;
use crate::config::{FirmwareTarget, RetryPolicy, StartConfig};
use crate::engine::{
    Action, CompletionStatus, Delivery, EngineCallbacks, EngineError, Fragment, ReplyChunk,
    SessionStatus, Transport, TransportEngine, TransportState,
};
use crate::error::{HandlerError, RegisterError, SessionError, StartError};
use crate::events::{AgentEvent, EventQueue};
use crate::platform::{Reservation, ResourceKind, SharedPlatform};
use crate::services::filesystem::VirtualDirTable;
use crate::services::receive::TargetTable;
use crate::services::{Service, ServiceHandler, firmware};
use crate::sync::Guarded;
use crate::worker::WorkerWaker;

pub(crate) type EngineSlot = Guarded<Option<Box<dyn TransportEngine>>>;

// ═══════════════════════════════════════════════════════════════
// Per-service runtime
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct AdmissionSlot {
    active: Option<Correlation>,
    sessions: Arena<Session>,
}

impl AdmissionSlot {
    fn clear(&mut self, id: Correlation) -> Option<Session> {
        if self.active == Some(id) {
            self.active = None;
        }
        self.sessions.remove(id)
    }
}

/// State for one enabled inbound service.
pub(crate) struct ServiceRuntime {
    service: Service,
    max_request_size: usize,
    firmware: Vec<FirmwareTarget>,
    slot: Guarded<AdmissionSlot>,
    handler: Guarded<Option<Arc<dyn ServiceHandler>>>,
    targets: Option<Guarded<TargetTable>>,
    waker: OnceLock<WorkerWaker>,
    platform: SharedPlatform,
    _state: Reservation,
}

impl ServiceRuntime {
    pub fn create(
        platform: &SharedPlatform,
        service: Service,
        config: &StartConfig,
    ) -> Result<Self, StartError> {
        let state = Reservation::acquire(platform, ResourceKind::ServiceState)
            .map_err(|e| StartError::OutOfMemory(e.0))?;
        let services = &config.services;
        let (max_request_size, firmware) = match service {
            Service::Command => (services.command.as_ref().map(|c| c.max_request_size), Vec::new()),
            Service::DataReceive => (services.data.as_ref().map(|c| c.max_request_size), Vec::new()),
            Service::RemoteConfig => (
                services.remote_config.as_ref().map(|c| c.max_request_size),
                Vec::new(),
            ),
            Service::Firmware => {
                let targets = services
                    .firmware
                    .as_ref()
                    .map(|f| f.targets.clone())
                    .unwrap_or_default();
                for (i, t) in targets.iter().enumerate() {
                    info!(
                        "session[firmware]: target {} '{}' v{} (max {} bytes)",
                        i,
                        t.description,
                        firmware::format_version(t.version),
                        t.maximum_size
                    );
                }
                let largest = targets.iter().map(|t| t.maximum_size).max();
                (largest, targets)
            }
        };
        let slot = Guarded::create(platform, AdmissionSlot::default())?;
        let handler = Guarded::create(platform, None)?;
        let targets = match service {
            Service::DataReceive => Some(Guarded::create(platform, TargetTable::default())?),
            _ => None,
        };
        Ok(Self {
            service,
            max_request_size: max_request_size.unwrap_or(crate::config::DEFAULT_MAX_REQUEST_SIZE),
            firmware,
            slot,
            handler,
            targets,
            waker: OnceLock::new(),
            platform: Arc::clone(platform),
            _state: state,
        })
    }

    pub fn attach(&self, waker: WorkerWaker) {
        if self.waker.set(waker).is_err() {
            warn!("session[{}]: worker attached twice", self.service);
        }
    }

    pub fn register(&self, handler: Arc<dyn ServiceHandler>) -> Result<(), RegisterError> {
        self.handler
            .with(|h| *h = Some(handler))
            .map_err(|_| RegisterError::NotRunning)
    }

    pub fn targets(&self) -> Option<&Guarded<TargetTable>> {
        self.targets.as_ref()
    }

    /// Destroy every Lock this service owns.
    pub fn destroy(&self) {
        self.slot.destroy();
        self.handler.destroy();
        if let Some(targets) = &self.targets {
            targets.destroy();
        }
    }

    fn wake(&self) {
        match self.waker.get() {
            Some(w) => {
                if let Err(e) = w.wake() {
                    warn!("session[{}]: wake failed: {}", self.service, e);
                }
            }
            None => debug!("session[{}]: queued before the worker attached", self.service),
        }
    }

    /// Decide limits and handler for a new request, or refuse it.
    fn admit(&self, fragment: &Fragment<'_>) -> Result<Admission, SessionError> {
        let mut admission = Admission {
            service: self.service,
            transport: fragment.transport,
            target: fragment.target.map(str::to_owned),
            response_required: fragment.response_required,
            limit: self.max_request_size,
            handler: None,
            firmware_target: None,
            status: None,
        };
        match self.service {
            Service::DataReceive => {
                let name = fragment.target.unwrap_or_default();
                let (target, fallback_status) = self
                    .targets
                    .as_ref()
                    .and_then(|t| t.with(|t| (t.get(name).cloned(), t.fallback_status())).ok())
                    .unwrap_or_default();
                match target {
                    Some(t) => {
                        admission.limit = t.max_request_size;
                        admission.handler = Some(t.handler);
                        admission.status = t.status;
                    }
                    None => {
                        let fallback = self.handler.with(|h| h.is_some()).unwrap_or(false);
                        if !fallback {
                            return Err(SessionError::TargetNotFound);
                        }
                        admission.status = fallback_status;
                    }
                }
            }
            Service::Firmware => {
                let (index, target) = firmware::select_target(&self.firmware, fragment.target)?;
                admission.limit = target.maximum_size;
                admission.firmware_target = Some(index);
            }
            Service::Command | Service::RemoteConfig => {}
        }
        Ok(admission)
    }

    /// Engine thread: accept one fragment.
    pub fn deliver(&self, correlation: &mut Option<Correlation>, fragment: &Fragment<'_>) -> Delivery {
        let Ok(mut slot) = self.slot.lock() else {
            return Delivery::Error(SessionError::ServiceDisabled);
        };
        let id = match *correlation {
            Some(id) => {
                if slot.active != Some(id) {
                    return Delivery::Error(SessionError::UnknownSession);
                }
                id
            }
            None => {
                if slot.active.is_some() {
                    debug!("session[{}]: slot occupied, busy", self.service);
                    return Delivery::Busy;
                }
                let admission = match self.admit(fragment) {
                    Ok(a) => a,
                    Err(e) => return Delivery::Error(e),
                };
                let Ok(buffer) = Reservation::acquire(&self.platform, ResourceKind::SessionBuffer)
                else {
                    return Delivery::Error(SessionError::InsufficientMemory);
                };
                let id = slot.sessions.insert(Session::new(admission, buffer));
                slot.active = Some(id);
                *correlation = Some(id);
                debug!("session[{}]: admitted {}", self.service, id);
                id
            }
        };

        let Some(session) = slot.sessions.get_mut(id) else {
            return Delivery::Error(SessionError::UnknownSession);
        };
        let before = session.state();
        let delivery = session.accept(fragment.data, fragment.is_final);
        let queued = before == SessionState::Accumulating && session.state() == SessionState::Queued;
        let consumed =
            matches!(delivery, Delivery::Continue(Some(_))) && !session.response_required();
        let ended = if consumed { slot.clear(id) } else { None };
        drop(slot);

        self.report(ended);
        if queued {
            self.wake();
        }
        delivery
    }

    /// Engine thread: next reply piece of a completed session.
    pub fn reply(&self, id: Correlation, buf: &mut [u8]) -> ReplyChunk {
        let Ok(mut slot) = self.slot.lock() else {
            return ReplyChunk::Error(SessionError::UnknownSession);
        };
        if slot.active != Some(id) {
            return ReplyChunk::Error(SessionError::UnknownSession);
        }
        let Some(session) = slot.sessions.get_mut(id) else {
            return ReplyChunk::Error(SessionError::UnknownSession);
        };
        if session.state() != SessionState::Completed {
            return ReplyChunk::Busy;
        }
        let (len, is_final) = session.next_reply(buf);
        let ended = if is_final { slot.clear(id) } else { None };
        drop(slot);

        self.report(ended);
        ReplyChunk::Data { len, is_final }
    }

    /// Engine thread: the exchange is closed on the engine's side.
    pub fn close(&self, id: Correlation, status: SessionStatus) {
        let Ok(mut slot) = self.slot.lock() else {
            return;
        };
        if slot.active != Some(id) {
            debug!("session[{}]: close of stale handle {}", self.service, id);
            return;
        }
        let Some(session) = slot.sessions.get_mut(id) else {
            return;
        };
        let clear = match status {
            SessionStatus::Complete if session.state() == SessionState::Completed => true,
            _ => {
                debug!("session[{}]: {} closed with {:?}", self.service, id, status);
                session.cancel()
            }
        };
        let ended = if clear { slot.clear(id) } else { None };
        drop(slot);
        self.report(ended);
    }

    /// Run the status hook of a session that just left the slot.
    fn report(&self, ended: Option<Session>) {
        let Some((hook, status)) = ended.and_then(Session::into_status) else {
            return;
        };
        debug!(
            "session[{}]: reporting end of {:?}",
            self.service,
            status.target.as_deref().unwrap_or_default()
        );
        if catch_unwind(AssertUnwindSafe(|| hook.on_status(&status))).is_err() {
            error!("session[{}]: status hook panicked", self.service);
        }
    }

    /// Service worker: run the handler for a queued session, if any.
    pub fn process_queued(&self) {
        let claim = {
            let Ok(mut slot) = self.slot.lock() else {
                return;
            };
            let Some(id) = slot.active else {
                return;
            };
            slot.sessions
                .get_mut(id)
                .and_then(Session::claim)
                .map(|claim| (id, claim))
        };
        let Some((id, claim)) = claim else {
            return;
        };

        let mut request = claim.request;
        if let Some(target) = claim.firmware_target {
            request.firmware = Some(firmware::inspect(target, &request.payload));
        }
        let handler = claim
            .handler
            .or_else(|| self.handler.with(|h| h.clone()).ok().flatten());
        let outcome = match handler {
            Some(h) => match catch_unwind(AssertUnwindSafe(|| h.handle(&request))) {
                Ok(result) => result.map_err(SessionError::from),
                Err(_) => {
                    error!("session[{}]: handler panicked", self.service);
                    Err(HandlerError::new(u32::MAX, "handler panicked").into())
                }
            },
            None => Err(SessionError::NoHandler),
        };

        let Ok(mut slot) = self.slot.lock() else {
            return;
        };
        let mut ended = None;
        if let Some(session) = slot.sessions.get_mut(id) {
            session.complete(outcome);
            if session.is_cancelled() {
                debug!("session[{}]: {} cancelled while running", self.service, id);
                ended = slot.clear(id);
            }
        }
        drop(slot);
        self.report(ended);
    }

    /// Whether a session currently occupies the slot.
    pub fn is_busy(&self) -> bool {
        self.slot.with(|s| s.active.is_some()).unwrap_or(false)
    }
}

// ═══════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════

/// Shared runtime state of one started instance.
pub(crate) struct Coordinator {
    pub config: StartConfig,
    pub platform: SharedPlatform,
    pub retry: RetryPolicy,
    services: [Option<Arc<ServiceRuntime>>; 4],
    pub filesystem: Option<Arc<Guarded<VirtualDirTable>>>,
    pub transactions: Arc<TransactionTable>,
    pub transports: Arc<Guarded<TransportTable>>,
    pub engine: Arc<EngineSlot>,
    pub events: EventQueue,
    aborted: AtomicBool,
    driver_alive: AtomicBool,
}

/// Parts acquired during start, assembled into a [`Coordinator`]. The
/// lifecycle ledger holds its own references for teardown.
pub(crate) struct CoordinatorParts {
    pub services: [Option<Arc<ServiceRuntime>>; 4],
    pub filesystem: Option<Arc<Guarded<VirtualDirTable>>>,
    pub transactions: Arc<TransactionTable>,
    pub transports: Arc<Guarded<TransportTable>>,
    pub engine: Arc<EngineSlot>,
}

impl Coordinator {
    pub fn assemble(config: StartConfig, platform: SharedPlatform, parts: CoordinatorParts) -> Self {
        let retry = config.retry;
        Self {
            config,
            platform,
            retry,
            services: parts.services,
            filesystem: parts.filesystem,
            transactions: parts.transactions,
            transports: parts.transports,
            engine: parts.engine,
            events: EventQueue::new(),
            aborted: AtomicBool::new(false),
            driver_alive: AtomicBool::new(false),
        }
    }

    pub fn service(&self, service: Service) -> Option<&Arc<ServiceRuntime>> {
        self.services[service.index()].as_ref()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn driver_alive(&self) -> bool {
        self.driver_alive.load(Ordering::Acquire)
    }

    pub(crate) fn set_driver_alive(&self, alive: bool) {
        self.driver_alive.store(alive, Ordering::Release);
    }

    /// Hand `action` to the engine, retrying while it answers `Busy`.
    pub fn initiate(&self, action: &Action) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            let result = match self.engine.lock() {
                Ok(mut engine) => match engine.as_mut() {
                    Some(engine) => engine.initiate(action),
                    None => Err(EngineError::Unavailable),
                },
                Err(_) => Err(EngineError::Unavailable),
            };
            match result {
                Err(EngineError::Busy) if self.retry.allows(attempt) => {
                    self.retry.pause(self.platform.as_ref(), attempt);
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    debug!("coordinator: {} not initiated: {}", action.name(), e);
                    return Err(e);
                }
                Ok(()) => return Ok(()),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Engine callbacks
// ═══════════════════════════════════════════════════════════════

/// Routes engine callbacks into the coordinator. Lives for one `run_once`.
pub(crate) struct CallbackSink<'a> {
    coordinator: &'a Coordinator,
}

impl<'a> CallbackSink<'a> {
    pub fn new(coordinator: &'a Coordinator) -> Self {
        Self { coordinator }
    }
}

impl EngineCallbacks for CallbackSink<'_> {
    fn deliver_fragment(
        &mut self,
        correlation: &mut Option<Correlation>,
        fragment: Fragment<'_>,
    ) -> Delivery {
        let delivery = match self.coordinator.service(fragment.service) {
            Some(rt) => rt.deliver(correlation, &fragment),
            None => Delivery::Error(SessionError::ServiceDisabled),
        };
        if let Delivery::Error(reason) = &delivery {
            if correlation.is_none() {
                warn!("session[{}]: rejected: {}", fragment.service, reason);
                self.coordinator.events.emit(AgentEvent::SessionRejected {
                    service: fragment.service,
                    reason: reason.clone(),
                });
            }
        }
        delivery
    }

    fn reply_fragment(&mut self, service: Service, correlation: Correlation, buf: &mut [u8]) -> ReplyChunk {
        match self.coordinator.service(service) {
            Some(rt) => rt.reply(correlation, buf),
            None => ReplyChunk::Error(SessionError::ServiceDisabled),
        }
    }

    fn session_status(&mut self, service: Service, correlation: Correlation, status: SessionStatus) {
        if let Some(rt) = self.coordinator.service(service) {
            rt.close(correlation, status);
        }
    }

    fn on_complete(&mut self, handle: Correlation, status: CompletionStatus, response: &[u8]) {
        self.coordinator.transactions.complete(handle, status, response);
    }

    fn on_transport(&mut self, transport: Transport, state: TransportState) {
        transport::record_state(self.coordinator, transport, state);
    }
}
