//! Instance lifecycle manager.
//!
//! `start` acquires everything an instance needs, in a fixed order, and
//! records each acquisition in a [`Ledger`]:
//!
//! ```text
//!   validate ─▶ instance handle ─▶ service state (+ Locks) ─▶ tables / initiate Lock
//!            ─▶ engine.open() ─▶ engine driver worker ─▶ one worker per inbound service
//! ```
//!
//! A failure at any step drains the ledger in reverse and returns the step's
//! error, so a failed start leaves nothing behind. `stop` stops transports,
//! terminates the engine, waits for the driver to exit and then drains the
//! same ledger.

mod ledger;

pub use ledger::Step;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};

use self::ledger::Ledger;
use crate::actions::{BinaryDataPoint, DataPoints, Ping, Reply, Request, SendData, SendFile};
use crate::config::StartConfig;
use crate::datapoints::DataPointCollection;
use crate::coordinator::driver::{drive_engine, serve};
use crate::coordinator::transaction::TransactionTable;
use crate::coordinator::transport::{LinkState, TransportTable};
use crate::coordinator::{Coordinator, CoordinatorParts, EngineSlot, ServiceRuntime};
use crate::engine::{Action, EngineError, StopBehavior, Transport, TransportEngine};
use crate::error::{ActionError, FsError, RegisterError, StartError, StopError, TransportError};
use crate::events::AgentEvent;
use crate::platform::{Reservation, ResourceKind, SharedPlatform, StdPlatform};
use crate::services::filesystem::VirtualDirTable;
use crate::services::receive::{ReceiveStatusHandler, TargetTable};
use crate::services::{Service, ServiceHandler};
use crate::sync::{Guarded, Timeout};
use crate::worker::{Supervisor, WorkerRole};

struct Running {
    coordinator: Arc<Coordinator>,
    ledger: Ledger,
}

/// One started connectivity agent.
///
/// Several instances may run side by side in one process. Dropping a running
/// instance stops it with [`StopBehavior::Immediate`].
pub struct Instance {
    running: Mutex<Option<Running>>,
    steps: Vec<Step>,
}

fn service_enabled(config: &StartConfig, service: Service) -> bool {
    let s = &config.services;
    match service {
        Service::Command => s.command.is_some(),
        Service::DataReceive => s.data.is_some(),
        Service::RemoteConfig => s.remote_config.is_some(),
        Service::Firmware => s.firmware.is_some(),
    }
}

fn close_engine(slot: &EngineSlot) {
    let closed = slot.with(|engine| {
        if let Some(mut engine) = engine.take() {
            engine.close();
        }
    });
    if let Err(e) = closed {
        warn!("lifecycle: engine close skipped: {}", e);
    }
}

impl Instance {
    /// Start on the standard platform.
    pub fn start<E: TransportEngine>(config: StartConfig, engine: E) -> Result<Self, StartError> {
        Self::start_with(config, engine, StdPlatform::shared())
    }

    pub fn start_with<E: TransportEngine>(
        config: StartConfig,
        engine: E,
        platform: SharedPlatform,
    ) -> Result<Self, StartError> {
        config
            .validate()
            .map_err(StartError::InvalidConfiguration)?;

        let mut ledger = Ledger::default();
        match Self::acquire(config, Box::new(engine), platform, &mut ledger) {
            Ok(coordinator) => {
                info!("lifecycle: started ({} resources)", ledger.len());
                coordinator.events.emit(AgentEvent::Started);
                Ok(Self {
                    steps: ledger.steps(),
                    running: Mutex::new(Some(Running {
                        coordinator,
                        ledger,
                    })),
                })
            }
            Err(e) => {
                warn!("lifecycle: start failed: {}; rolling back {} step(s)", e, ledger.len());
                ledger.unwind();
                Err(e)
            }
        }
    }

    fn acquire(
        config: StartConfig,
        mut engine: Box<dyn TransportEngine>,
        platform: SharedPlatform,
        ledger: &mut Ledger,
    ) -> Result<Arc<Coordinator>, StartError> {
        let handle = Reservation::acquire(&platform, ResourceKind::Instance)
            .map_err(|e| StartError::OutOfMemory(e.0))?;
        ledger.record(Step::InstanceHandle, move || drop(handle));

        // ── Service state ────────────────────────────────────
        let mut services: [Option<Arc<ServiceRuntime>>; 4] = Default::default();
        for service in Service::ALL {
            if !service_enabled(&config, service) {
                continue;
            }
            let runtime = Arc::new(ServiceRuntime::create(&platform, service, &config)?);
            let undo = Arc::clone(&runtime);
            ledger.record(Step::ServiceState(service), move || undo.destroy());
            services[service.index()] = Some(runtime);
        }

        let filesystem = match &config.services.file_system {
            Some(fs) => {
                let state = Reservation::acquire(&platform, ResourceKind::ServiceState)
                    .map_err(|e| StartError::OutOfMemory(e.0))?;
                let mut table = VirtualDirTable::new();
                for dir in &fs.virtual_dirs {
                    if let Err(e) = table.add(&dir.name, &dir.local_dir) {
                        warn!("lifecycle: virtual dir '{}' not mapped: {}", dir.name, e);
                    }
                }
                let table = Arc::new(Guarded::create(&platform, table)?);
                let undo = Arc::clone(&table);
                ledger.record(Step::FileSystem, move || {
                    undo.destroy();
                    drop(state);
                });
                Some(table)
            }
            None => None,
        };

        if config.services.short_message.is_some() {
            let state = Reservation::acquire(&platform, ResourceKind::ServiceState)
                .map_err(|e| StartError::OutOfMemory(e.0))?;
            ledger.record(Step::ShortMessage, move || drop(state));
        }

        // ── Instance-wide Locks ──────────────────────────────
        let transactions = Arc::new(TransactionTable::create(&platform)?);
        let undo = Arc::clone(&transactions);
        ledger.record(Step::TransactionTable, move || {
            undo.cancel_all();
            undo.destroy();
        });

        let transports = Arc::new(Guarded::create(&platform, TransportTable::default())?);
        let undo = Arc::clone(&transports);
        ledger.record(Step::TransportTable, move || undo.destroy());

        let mut slot: EngineSlot = Guarded::create(&platform, None)?;

        // ── Engine ───────────────────────────────────────────
        if let Err(e) = engine.open(&config) {
            warn!("lifecycle: {}", e);
            slot.destroy();
            return Err(StartError::EngineInitFailed);
        }
        *slot.get_mut() = Some(engine);
        let engine_slot = Arc::new(slot);
        let undo = Arc::clone(&engine_slot);
        ledger.record(Step::InitiateLock, move || undo.destroy());
        let undo = Arc::clone(&engine_slot);
        ledger.record(Step::EngineOpened, move || close_engine(&undo));

        let supervisor = Supervisor::new(Arc::clone(&platform), config.retry);
        let coordinator = Arc::new(Coordinator::assemble(
            config,
            platform,
            CoordinatorParts {
                services,
                filesystem,
                transactions,
                transports,
                engine: engine_slot,
            },
        ));

        // ── Workers ──────────────────────────────────────────
        let driven = Arc::clone(&coordinator);
        let mut driver = supervisor.start(WorkerRole::EngineDriver, move |ctx| {
            drive_engine(ctx, driven);
        })?;
        let stopper = supervisor.clone();
        ledger.record(Step::Worker(WorkerRole::EngineDriver), move || {
            stopper.stop(&mut driver);
        });

        for service in Service::ALL {
            let Some(runtime) = coordinator.service(service).cloned() else {
                continue;
            };
            let role = service.worker_role();
            let mut worker = supervisor.start(role, move |ctx| serve(ctx, runtime))?;
            let stopper = supervisor.clone();
            ledger.record(Step::Worker(role), move || stopper.stop(&mut worker));
        }

        Ok(coordinator)
    }

    // ── Stop ─────────────────────────────────────────────────

    fn state(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.state().as_ref().map(|r| Arc::clone(&r.coordinator))
    }

    /// Stop transports, terminate the engine and release everything `start`
    /// acquired. A second call returns `NotStarted`.
    pub fn stop(&self, behavior: StopBehavior) -> Result<(), StopError> {
        let Some(mut running) = self.state().take() else {
            return Err(StopError::NotStarted);
        };
        let coordinator = Arc::clone(&running.coordinator);

        if coordinator.driver_alive() {
            let up: Vec<Transport> = coordinator
                .transports
                .with(|t| t.up().collect())
                .unwrap_or_default();
            for transport in up {
                if let Err(e) = coordinator.stop_transport(transport, behavior) {
                    warn!("lifecycle: stopping {} failed: {}", transport, e);
                }
            }

            let refused = match coordinator.initiate(&Action::Terminate) {
                Ok(()) | Err(EngineError::Unavailable) => None,
                Err(EngineError::Busy) => Some(StopError::EngineBusy),
                Err(EngineError::Rejected) => Some(StopError::TerminateRefused),
            };
            if let Some(e) = refused {
                warn!("lifecycle: terminate failed: {}; instance left running", e);
                *self.state() = Some(running);
                return Err(e);
            }

            let mut attempt = 0;
            while coordinator.driver_alive() {
                coordinator.retry.pause(coordinator.platform.as_ref(), attempt);
                attempt = attempt.saturating_add(1);
            }
        } else {
            info!("lifecycle: engine not running; skipping transport stop and terminate");
        }

        running.ledger.unwind();
        drop(running);
        info!("lifecycle: stopped");
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.coordinator().is_some_and(|c| c.driver_alive())
    }

    /// `start` succeeded and `stop` has not yet released the instance.
    /// An aborted instance is still started.
    pub fn is_started(&self) -> bool {
        self.state().is_some()
    }

    /// The engine aborted; only `stop` is meaningful now.
    pub fn is_aborted(&self) -> bool {
        self.coordinator().is_some_and(|c| c.is_aborted())
    }

    /// What `start` acquired, in acquisition order.
    pub fn acquired(&self) -> &[Step] {
        &self.steps
    }

    pub fn next_event(&self) -> Option<AgentEvent> {
        self.coordinator().and_then(|c| c.events.next())
    }

    pub fn link_state(&self, transport: Transport) -> LinkState {
        self.coordinator()
            .map_or(LinkState::Down, |c| c.link(transport))
    }

    /// Whether a session currently occupies the service's admission slot.
    pub fn service_busy(&self, service: Service) -> bool {
        self.coordinator()
            .and_then(|c| c.service(service).map(|rt| rt.is_busy()))
            .unwrap_or(false)
    }

    /// Outbound transactions still waiting for the engine.
    pub fn pending_transactions(&self) -> usize {
        self.coordinator().map_or(0, |c| c.transactions.pending())
    }

    // ── Handlers and targets ─────────────────────────────────

    pub fn register<H>(&self, service: Service, handler: H) -> Result<(), RegisterError>
    where
        H: ServiceHandler + 'static,
    {
        let coordinator = self.coordinator().ok_or(RegisterError::NotRunning)?;
        let runtime = coordinator
            .service(service)
            .ok_or(RegisterError::ServiceDisabled)?;
        runtime.register(Arc::new(handler))
    }

    pub fn add_receive_target<H>(
        &self,
        target: &str,
        handler: H,
        max_request_size: usize,
    ) -> Result<(), RegisterError>
    where
        H: ServiceHandler + 'static,
    {
        self.with_targets(|t| t.add(target, Arc::new(handler), None, max_request_size))
    }

    /// Like [`add_receive_target`](Self::add_receive_target), and `status`
    /// is told how each exchange for `target` ended.
    pub fn add_receive_target_with_status<H, S>(
        &self,
        target: &str,
        handler: H,
        status: S,
        max_request_size: usize,
    ) -> Result<(), RegisterError>
    where
        H: ServiceHandler + 'static,
        S: ReceiveStatusHandler + 'static,
    {
        self.with_targets(|t| {
            t.add(target, Arc::new(handler), Some(Arc::new(status)), max_request_size)
        })
    }

    /// Status hook for data requests served by the service-wide handler.
    pub fn set_receive_status<S>(&self, status: S) -> Result<(), RegisterError>
    where
        S: ReceiveStatusHandler + 'static,
    {
        self.with_targets(|t| {
            t.set_fallback_status(Some(Arc::new(status)));
            Ok(())
        })
    }

    pub fn remove_receive_target(&self, target: &str) -> Result<(), RegisterError> {
        self.with_targets(|t| t.remove(target))
    }

    fn with_targets<R>(
        &self,
        f: impl FnOnce(&mut TargetTable) -> Result<R, RegisterError>,
    ) -> Result<R, RegisterError> {
        let coordinator = self.coordinator().ok_or(RegisterError::NotRunning)?;
        let targets = coordinator
            .service(Service::DataReceive)
            .and_then(|rt| rt.targets())
            .ok_or(RegisterError::ServiceDisabled)?;
        targets.with(f).map_err(|_| RegisterError::LockFailed)?
    }

    // ── Transports ───────────────────────────────────────────

    pub fn start_transport(&self, transport: Transport, timeout: Timeout) -> Result<(), TransportError> {
        self.coordinator()
            .ok_or(TransportError::NotRunning)?
            .start_transport(transport, timeout)
    }

    pub fn stop_transport(&self, transport: Transport, behavior: StopBehavior) -> Result<(), TransportError> {
        let coordinator = self.coordinator().ok_or(TransportError::NotRunning)?;
        if !coordinator.driver_alive() {
            return Err(TransportError::NotRunning);
        }
        coordinator.stop_transport(transport, behavior)
    }

    // ── Outbound transactions ────────────────────────────────

    pub fn perform(&self, request: Request, timeout: Timeout) -> Result<Reply, ActionError> {
        self.coordinator()
            .ok_or(ActionError::NotRunning)?
            .perform(request, timeout)
    }

    pub fn send_data(&self, data: SendData, timeout: Timeout) -> Result<Reply, ActionError> {
        self.perform(Request::SendData(data), timeout)
    }

    pub fn send_file(&self, file: SendFile, timeout: Timeout) -> Result<Reply, ActionError> {
        self.perform(Request::SendFile(file), timeout)
    }

    pub fn send_binary_datapoint(&self, point: BinaryDataPoint, timeout: Timeout) -> Result<Reply, ActionError> {
        self.perform(Request::BinaryDataPoint(point), timeout)
    }

    /// Upload the collection's pending samples. They are cleared once the
    /// cloud accepted them and kept for a retry otherwise.
    pub fn send_datapoints(
        &self,
        transport: Transport,
        collection: &mut DataPointCollection,
        response_required: bool,
        timeout: Timeout,
    ) -> Result<Reply, ActionError> {
        let request = Request::DataPoints(DataPoints {
            transport,
            streams: collection.pending(),
            response_required,
        });
        let reply = self.perform(request, timeout)?;
        collection.clear();
        Ok(reply)
    }

    pub fn ping(&self, transport: Transport, response_required: bool, timeout: Timeout) -> Result<(), ActionError> {
        self.perform(
            Request::Ping(Ping {
                transport,
                response_required,
            }),
            timeout,
        )
        .map(|_| ())
    }

    // ── File-system virtualization ───────────────────────────

    fn with_dirs<R>(&self, f: impl FnOnce(&mut VirtualDirTable) -> R) -> Result<R, FsError> {
        let coordinator = self.coordinator().ok_or(FsError::NotRunning)?;
        let table = coordinator.filesystem.as_ref().ok_or(FsError::NoSupport)?;
        table.with(f).map_err(|_| FsError::LockFailed)
    }

    pub fn add_virtual_dir(&self, name: &str, local_dir: impl AsRef<std::path::Path>) -> Result<(), FsError> {
        self.with_dirs(|t| t.add(name, local_dir.as_ref()))?
    }

    pub fn remove_virtual_dir(&self, name: &str) -> Result<(), FsError> {
        self.with_dirs(|t| t.remove(name))?
    }

    pub fn resolve_virtual_path(&self, path: &str) -> Result<std::path::PathBuf, FsError> {
        self.with_dirs(|t| t.resolve(path))?
            .ok_or(FsError::NotMapped)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.state().is_some() {
            if let Err(e) = self.stop(StopBehavior::Immediate) {
                warn!("lifecycle: stop on drop failed: {}", e);
            }
        }
    }
}
