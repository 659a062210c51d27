//! In-process engine with a scriptable cloud side.
//!
//! [`LoopbackEngine`] implements [`TransportEngine`] without any network: the
//! paired [`LoopbackCloud`] handle pushes cloud requests, decides how outbound
//! actions complete and records what the device answered. The demo binary and
//! the integration tests drive the core through it.
//!
//! ```text
//!   LoopbackCloud ──push()──▶ ┌────────────┐ ──deliver_fragment──▶ core
//!        ▲                    │  Loopback  │ ◀──────reply──────────
//!        └──finished()─────── │   state    │ ──on_complete────────▶ core
//!                             └────────────┘ ◀──────initiate────────
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info};

use super::{
    Action, CompletionStatus, Delivery, EngineCallbacks, EngineError, EngineInitError, Fragment,
    OutboundData, ReplyChunk, RunStatus, SendBehavior, SessionStatus, Transport, TransportEngine,
    TransportState,
};
use crate::config::StartConfig;
use crate::coordinator::Correlation;
use crate::error::SessionError;
use crate::services::Service;

const REPLY_CHUNK: usize = 256;

// ── Cloud-side requests ──────────────────────────────────────

/// A request the cloud sends to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudRequest {
    pub service: Service,
    pub transport: Transport,
    pub target: Option<String>,
    pub fragments: Vec<Vec<u8>>,
    pub response_required: bool,
    /// Close the exchange with `Cancel` once the device has queued it.
    pub cancel_when_queued: bool,
}

impl CloudRequest {
    pub fn new(service: Service, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            service,
            transport: Transport::Tcp,
            target: None,
            fragments: vec![payload.into()],
            response_required: true,
            cancel_when_queued: false,
        }
    }

    pub fn command(text: &str) -> Self {
        Self::new(Service::Command, text.as_bytes())
    }

    pub fn remote_config(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Service::RemoteConfig, payload)
    }

    pub fn device_request(target: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target: Some(target.to_owned()),
            ..Self::new(Service::DataReceive, payload)
        }
    }

    pub fn firmware(target: u8, image: impl Into<Vec<u8>>) -> Self {
        Self {
            target: Some(target.to_string()),
            ..Self::new(Service::Firmware, image)
        }
    }

    /// Send the payload as the given pieces instead of one fragment.
    pub fn fragments<I, P>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.fragments = pieces.into_iter().map(Into::into).collect();
        self
    }

    /// Re-split the payload into pieces of at most `size` bytes.
    pub fn split(mut self, size: usize) -> Self {
        let whole: Vec<u8> = self.fragments.concat();
        self.fragments = if whole.is_empty() {
            vec![Vec::new()]
        } else {
            whole.chunks(size.max(1)).map(<[u8]>::to_vec).collect()
        };
        self
    }

    pub fn over(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn without_reply(mut self) -> Self {
        self.response_required = false;
        self
    }

    pub fn cancel_when_queued(mut self) -> Self {
        self.cancel_when_queued = true;
        self
    }
}

/// How one cloud request ended, as the cloud saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub service: Service,
    pub target: Option<String>,
    pub reply: Vec<u8>,
    /// Handler or admission failure reported by the device.
    pub error: Option<SessionError>,
    /// Refused while delivering; no reply was read.
    pub rejected: bool,
    pub cancelled: bool,
    /// `Busy` answers before the device admitted the request.
    pub busy_before_admission: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Delivering,
    Replying,
}

struct Exchange {
    request: CloudRequest,
    correlation: Option<Correlation>,
    next: usize,
    phase: Phase,
    busy_before_admission: u32,
    error: Option<SessionError>,
    reply: Vec<u8>,
}

impl Exchange {
    fn new(mut request: CloudRequest) -> Self {
        if request.fragments.is_empty() {
            request.fragments.push(Vec::new());
        }
        Self {
            request,
            correlation: None,
            next: 0,
            phase: Phase::Delivering,
            busy_before_admission: 0,
            error: None,
            reply: Vec::new(),
        }
    }

    fn finish(self, rejected: bool, cancelled: bool) -> Finished {
        Finished {
            service: self.request.service,
            target: self.request.target,
            reply: self.reply,
            error: self.error,
            rejected,
            cancelled,
            busy_before_admission: self.busy_before_admission,
        }
    }
}

enum Step {
    Pending(Exchange),
    Done(Finished),
}

struct PendingAction {
    handle: Correlation,
    response: Vec<u8>,
}

/// Cloud-side copy of an uploaded path.
#[derive(Default)]
struct StoredFile {
    content: Vec<u8>,
    archive: Vec<Vec<u8>>,
}

impl StoredFile {
    fn apply(&mut self, data: &OutboundData) {
        match data.behavior {
            SendBehavior::Overwrite => self.content.clone_from(&data.payload),
            SendBehavior::Append => self.content.extend_from_slice(&data.payload),
            SendBehavior::Archive => {
                let previous = core::mem::replace(&mut self.content, data.payload.clone());
                self.archive.push(previous);
            }
        }
    }
}

// ── Shared state ─────────────────────────────────────────────

#[derive(Default)]
struct Cloud {
    links: [bool; 3],
    link_changes: VecDeque<(Transport, TransportState)>,
    hold_links: bool,
    inbound: VecDeque<CloudRequest>,
    exchanges: Vec<Exchange>,
    finished: Vec<Finished>,
    outbound: VecDeque<PendingAction>,
    hold_completions: bool,
    completion: Option<CompletionStatus>,
    actions: Vec<Action>,
    files: BTreeMap<String, StoredFile>,
    busy_terminates: u32,
    refuse_terminate: bool,
    terminate_requested: bool,
    terminated: bool,
    abort: bool,
    fail_open: bool,
    opened: bool,
    closed: bool,
}

type Shared = Arc<Mutex<Cloud>>;

fn lock(shared: &Shared) -> MutexGuard<'_, Cloud> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected engine/cloud pair.
pub fn loopback() -> (LoopbackEngine, LoopbackCloud) {
    let shared: Shared = Arc::default();
    (
        LoopbackEngine {
            shared: Arc::clone(&shared),
        },
        LoopbackCloud { shared },
    )
}

// ── Engine side ──────────────────────────────────────────────

pub struct LoopbackEngine {
    shared: Shared,
}

impl LoopbackEngine {
    fn step(exchange: Exchange, callbacks: &mut dyn EngineCallbacks) -> Step {
        match exchange.phase {
            Phase::Delivering => Self::deliver(exchange, callbacks),
            Phase::Replying => Self::reply(exchange, callbacks),
        }
    }

    fn deliver(mut ex: Exchange, callbacks: &mut dyn EngineCallbacks) -> Step {
        let is_final = ex.next + 1 == ex.request.fragments.len();
        let fragment = Fragment {
            service: ex.request.service,
            transport: ex.request.transport,
            target: ex.request.target.as_deref(),
            response_required: ex.request.response_required,
            data: &ex.request.fragments[ex.next],
            is_final,
        };
        match callbacks.deliver_fragment(&mut ex.correlation, fragment) {
            Delivery::Continue(None) => {
                if !is_final {
                    ex.next += 1;
                }
                Step::Pending(ex)
            }
            Delivery::Continue(Some(result)) => {
                ex.error = result.error;
                if ex.request.response_required {
                    ex.phase = Phase::Replying;
                    Step::Pending(ex)
                } else {
                    Step::Done(ex.finish(false, false))
                }
            }
            Delivery::Busy => match ex.correlation {
                None => {
                    ex.busy_before_admission += 1;
                    Step::Pending(ex)
                }
                Some(id) if is_final && ex.request.cancel_when_queued => {
                    callbacks.session_status(ex.request.service, id, SessionStatus::Cancel);
                    Step::Done(ex.finish(false, true))
                }
                Some(_) => Step::Pending(ex),
            },
            Delivery::Error(e) => {
                if let Some(id) = ex.correlation {
                    callbacks.session_status(ex.request.service, id, SessionStatus::Error);
                }
                ex.error = Some(e);
                Step::Done(ex.finish(true, false))
            }
        }
    }

    fn reply(mut ex: Exchange, callbacks: &mut dyn EngineCallbacks) -> Step {
        let Some(id) = ex.correlation else {
            return Step::Done(ex.finish(true, false));
        };
        let mut buf = [0u8; REPLY_CHUNK];
        match callbacks.reply_fragment(ex.request.service, id, &mut buf) {
            ReplyChunk::Busy => Step::Pending(ex),
            ReplyChunk::Data { len, is_final } => {
                ex.reply.extend_from_slice(&buf[..len]);
                if is_final {
                    callbacks.session_status(ex.request.service, id, SessionStatus::Complete);
                    Step::Done(ex.finish(false, false))
                } else {
                    Step::Pending(ex)
                }
            }
            ReplyChunk::Error(e) => {
                callbacks.session_status(ex.request.service, id, SessionStatus::Error);
                ex.error = Some(e);
                Step::Done(ex.finish(false, false))
            }
        }
    }

    fn terminate(cloud: &mut Cloud, callbacks: &mut dyn EngineCallbacks) {
        for transport in Transport::ALL {
            if core::mem::take(&mut cloud.links[transport.index()]) {
                callbacks.on_transport(transport, TransportState::Down);
            }
        }
        for ex in core::mem::take(&mut cloud.exchanges) {
            if let Some(id) = ex.correlation {
                callbacks.session_status(ex.request.service, id, SessionStatus::Cancel);
            }
            cloud.finished.push(ex.finish(false, true));
        }
        for pending in core::mem::take(&mut cloud.outbound) {
            callbacks.on_complete(pending.handle, CompletionStatus::Cancelled, &[]);
        }
        cloud.terminated = true;
        info!("loopback: terminated");
    }
}

impl TransportEngine for LoopbackEngine {
    fn open(&mut self, _config: &StartConfig) -> Result<(), EngineInitError> {
        let mut cloud = lock(&self.shared);
        if cloud.fail_open {
            return Err(EngineInitError("loopback open refused"));
        }
        cloud.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.shared).closed = true;
    }

    fn run_once(&mut self, callbacks: &mut dyn EngineCallbacks) -> RunStatus {
        let mut cloud = lock(&self.shared);
        if cloud.abort {
            return RunStatus::Aborted;
        }
        if cloud.terminated {
            return RunStatus::Terminated;
        }
        if cloud.terminate_requested {
            Self::terminate(&mut cloud, callbacks);
            return RunStatus::Terminated;
        }

        let mut worked = false;
        if !cloud.hold_links {
            while let Some((transport, state)) = cloud.link_changes.pop_front() {
                cloud.links[transport.index()] = state == TransportState::Up;
                callbacks.on_transport(transport, state);
                worked = true;
            }
        }

        let mut waiting = VecDeque::new();
        while let Some(request) = cloud.inbound.pop_front() {
            if cloud.links[request.transport.index()] {
                cloud.exchanges.push(Exchange::new(request));
                worked = true;
            } else {
                waiting.push_back(request);
            }
        }
        cloud.inbound = waiting;

        for ex in core::mem::take(&mut cloud.exchanges) {
            match Self::step(ex, callbacks) {
                Step::Pending(ex) => cloud.exchanges.push(ex),
                Step::Done(done) => {
                    debug!("loopback: {} exchange finished", done.service);
                    cloud.finished.push(done);
                    worked = true;
                }
            }
        }

        if !cloud.hold_completions {
            let status = cloud.completion.unwrap_or(CompletionStatus::Success);
            while let Some(pending) = cloud.outbound.pop_front() {
                callbacks.on_complete(pending.handle, status, &pending.response);
                worked = true;
            }
        }

        if worked || !cloud.exchanges.is_empty() {
            RunStatus::Working
        } else {
            RunStatus::Idle
        }
    }

    fn initiate(&mut self, action: &Action) -> Result<(), EngineError> {
        let mut cloud = lock(&self.shared);
        if cloud.terminated || cloud.terminate_requested {
            return Err(EngineError::Unavailable);
        }
        match action {
            Action::StartTransport(t) => {
                cloud.link_changes.push_back((*t, TransportState::Up));
            }
            Action::StopTransport { transport, .. } => {
                cloud.link_changes.push_back((*transport, TransportState::Down));
            }
            Action::SendData(data) => {
                if !cloud.links[data.transport.index()] {
                    return Err(EngineError::Rejected);
                }
                let response = if data.response_required {
                    data.payload.clone()
                } else {
                    Vec::new()
                };
                cloud.files.entry(data.path.clone()).or_default().apply(data);
                cloud.outbound.push_back(PendingAction {
                    handle: data.handle,
                    response,
                });
            }
            Action::DataPoints(upload) => {
                if !cloud.links[upload.transport.index()] {
                    return Err(EngineError::Rejected);
                }
                let response = if upload.response_required {
                    serde_json::to_vec(&upload.streams).unwrap_or_default()
                } else {
                    Vec::new()
                };
                cloud.outbound.push_back(PendingAction {
                    handle: upload.handle,
                    response,
                });
            }
            Action::Ping {
                handle,
                transport,
                response_required,
            } => {
                if !cloud.links[transport.index()] {
                    return Err(EngineError::Rejected);
                }
                let response = if *response_required {
                    b"pong".to_vec()
                } else {
                    Vec::new()
                };
                cloud.outbound.push_back(PendingAction {
                    handle: *handle,
                    response,
                });
            }
            Action::Terminate => {
                if cloud.busy_terminates > 0 {
                    cloud.busy_terminates -= 1;
                    return Err(EngineError::Busy);
                }
                if cloud.refuse_terminate {
                    return Err(EngineError::Rejected);
                }
                cloud.terminate_requested = true;
            }
        }
        cloud.actions.push(action.clone());
        Ok(())
    }
}

// ── Cloud side ───────────────────────────────────────────────

/// Test and demo handle to the cloud end of a [`LoopbackEngine`].
#[derive(Clone)]
pub struct LoopbackCloud {
    shared: Shared,
}

impl LoopbackCloud {
    fn state(&self) -> MutexGuard<'_, Cloud> {
        lock(&self.shared)
    }

    /// Queue a request; it is delivered once its transport is up.
    pub fn push(&self, request: CloudRequest) {
        self.state().inbound.push_back(request);
    }

    /// Report `transport` up on the next `run_once`, without an initiate.
    pub fn connect(&self, transport: Transport) {
        self.state()
            .link_changes
            .push_back((transport, TransportState::Up));
    }

    pub fn finished(&self) -> Vec<Finished> {
        self.state().finished.clone()
    }

    /// Poll until `n` exchanges have finished or `timeout` passes.
    pub fn wait_for_finished(&self, n: usize, timeout: Duration) -> Vec<Finished> {
        let deadline = Instant::now() + timeout;
        loop {
            let finished = self.finished();
            if finished.len() >= n || Instant::now() >= deadline {
                return finished;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Every action the engine accepted, in order.
    pub fn actions(&self) -> Vec<Action> {
        self.state().actions.clone()
    }

    /// Current content of an uploaded path, as the cloud stores it.
    pub fn stored(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).map(|f| f.content.clone())
    }

    /// Earlier contents of `path` kept by archiving uploads, oldest first.
    pub fn archived(&self, path: &str) -> Vec<Vec<u8>> {
        self.state()
            .files
            .get(path)
            .map(|f| f.archive.clone())
            .unwrap_or_default()
    }

    pub fn is_link_up(&self, transport: Transport) -> bool {
        self.state().links[transport.index()]
    }

    /// Outbound actions accepted but not yet completed.
    pub fn pending_completions(&self) -> usize {
        self.state().outbound.len()
    }

    /// Keep outbound actions pending until [`release_held`](Self::release_held).
    pub fn hold_completions(&self) {
        self.state().hold_completions = true;
    }

    /// Complete held and future actions with `status`.
    pub fn release_held(&self, status: CompletionStatus) {
        let mut cloud = self.state();
        cloud.completion = Some(status);
        cloud.hold_completions = false;
    }

    /// Stop reporting transport changes until called with `false`.
    pub fn hold_links(&self, hold: bool) {
        self.state().hold_links = hold;
    }

    /// Answer the next `n` terminate requests with `Busy`.
    pub fn set_busy_terminates(&self, n: u32) {
        self.state().busy_terminates = n;
    }

    pub fn refuse_terminate(&self, refuse: bool) {
        self.state().refuse_terminate = refuse;
    }

    /// Make the next `run_once` report an unrecoverable failure.
    pub fn trigger_abort(&self) {
        self.state().abort = true;
    }

    pub fn fail_open(&self) {
        self.state().fail_open = true;
    }

    pub fn was_opened(&self) -> bool {
        self.state().opened
    }

    pub fn was_closed(&self) -> bool {
        self.state().closed
    }
}
