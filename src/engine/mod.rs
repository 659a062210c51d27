//! Transport Engine boundary.
//!
//! The engine owns the wire protocol and the network. The core drives it from
//! one dedicated worker and talks to it through two traits:
//!
//! ```text
//!   ┌──────────────┐  run_once / initiate   ┌───────────────────┐
//!   │  Agent core  │───────────────────────▶│  TransportEngine  │
//!   │              │◀───────────────────────│                   │
//!   └──────────────┘    EngineCallbacks     └───────────────────┘
//! ```
//!
//! Callbacks are only ever invoked from inside `run_once`, i.e. on the engine
//! driver thread. `initiate` may be called from any thread; the core
//! serializes those calls itself.

pub mod loopback;

use core::fmt;

use crate::config::StartConfig;
use crate::coordinator::Correlation;
use crate::datapoints::DataStream;
use crate::error::SessionError;
use crate::services::Service;

/// Network paths the engine can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    Sms,
}

impl Transport {
    pub const ALL: [Self; 3] = [Self::Tcp, Self::Udp, Self::Sms];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// UDP and SMS ride on the short-message service.
    pub const fn is_short_message(self) -> bool {
        matches!(self, Self::Udp | Self::Sms)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Sms => write!(f, "sms"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBehavior {
    /// Let in-flight exchanges finish first.
    #[default]
    Graceful,
    Immediate,
}

/// What the cloud does with an upload whose path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendBehavior {
    #[default]
    Overwrite,
    Append,
    /// Keep the previous content as history.
    Archive,
}

impl fmt::Display for SendBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overwrite => write!(f, "overwrite"),
            Self::Append => write!(f, "append"),
            Self::Archive => write!(f, "archive"),
        }
    }
}

/// An outbound data transfer, as handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundData {
    pub handle: Correlation,
    pub transport: Transport,
    pub path: String,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
    pub behavior: SendBehavior,
    pub response_required: bool,
    /// `payload` is raw DEFLATE.
    pub compressed: bool,
}

/// A data point upload, as handed to the engine. Only streams with samples
/// are included.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPointUpload {
    pub handle: Correlation,
    pub transport: Transport,
    pub streams: Vec<DataStream>,
    pub response_required: bool,
}

/// Work the core asks the engine to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartTransport(Transport),
    StopTransport {
        transport: Transport,
        behavior: StopBehavior,
    },
    SendData(OutboundData),
    DataPoints(DataPointUpload),
    Ping {
        handle: Correlation,
        transport: Transport,
        response_required: bool,
    },
    Terminate,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartTransport(_) => "start_transport",
            Self::StopTransport { .. } => "stop_transport",
            Self::SendData(_) => "send_data",
            Self::DataPoints(_) => "send_datapoints",
            Self::Ping { .. } => "ping",
            Self::Terminate => "terminate",
        }
    }
}

/// Why `initiate` did not accept an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// Temporarily unable; retry later.
    Busy,
    /// The engine is terminated or gone.
    Unavailable,
    /// The action is not acceptable in the engine's current state.
    Rejected,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "busy"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// `open` failed; the instance cannot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInitError(pub &'static str);

impl fmt::Display for EngineInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine init: {}", self.0)
    }
}

impl std::error::Error for EngineInitError {}

/// Result of one `run_once` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Nothing to do right now.
    Idle,
    /// Progress was made; call again soon.
    Working,
    /// The engine honoured a terminate request.
    Terminated,
    /// Unrecoverable engine failure.
    Aborted,
}

/// Final status of an outbound transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Cancelled,
    /// The cloud did not answer in time.
    TimedOut,
    /// Protocol or cloud-side failure code.
    Error(u32),
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Error(code) => write!(f, "error {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Up,
    Down,
}

/// One piece of an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub service: Service,
    pub transport: Transport,
    /// Receive target name, or firmware target index in decimal.
    pub target: Option<&'a str>,
    pub response_required: bool,
    pub data: &'a [u8],
    pub is_final: bool,
}

/// What the handler produced, reported once the session completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub error: Option<SessionError>,
    /// Bytes available through `reply_fragment`.
    pub reply_len: usize,
}

/// Answer to `deliver_fragment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Fragment accepted. `Some` once the handler has finished.
    Continue(Option<SessionResult>),
    /// Not ready; call again with the same fragment later.
    Busy,
    /// Rejected; no handler runs for this request.
    Error(SessionError),
}

/// Answer to `reply_fragment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyChunk {
    Busy,
    /// `len` bytes were written to the buffer.
    Data { len: usize, is_final: bool },
    Error(SessionError),
}

/// How the engine closes an inbound exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Complete,
    Cancel,
    Error,
}

/// Hooks the engine calls from inside `run_once`.
pub trait EngineCallbacks {
    /// Offer one inbound fragment. `correlation` is `None` for the first
    /// fragment of a request; the core fills it in and the engine passes it
    /// back unchanged for every later fragment and retry.
    fn deliver_fragment(
        &mut self,
        correlation: &mut Option<Correlation>,
        fragment: Fragment<'_>,
    ) -> Delivery;

    /// Copy the next piece of a completed session's reply into `buf`.
    fn reply_fragment(
        &mut self,
        service: Service,
        correlation: Correlation,
        buf: &mut [u8],
    ) -> ReplyChunk;

    /// The exchange is over from the engine's side.
    fn session_status(&mut self, service: Service, correlation: Correlation, status: SessionStatus);

    /// An outbound action finished.
    fn on_complete(&mut self, handle: Correlation, status: CompletionStatus, response: &[u8]);

    fn on_transport(&mut self, transport: Transport, state: TransportState);
}

/// The protocol engine the core drives.
pub trait TransportEngine: Send + 'static {
    /// Called once during start, before any worker exists.
    fn open(&mut self, config: &StartConfig) -> Result<(), EngineInitError> {
        let _ = config;
        Ok(())
    }

    /// Release what `open` acquired. Called on rollback and on stop.
    fn close(&mut self) {}

    /// Perform one bounded unit of work, invoking callbacks as needed.
    fn run_once(&mut self, callbacks: &mut dyn EngineCallbacks) -> RunStatus;

    fn initiate(&mut self, action: &Action) -> Result<(), EngineError>;
}
