//! Application-facing service types.
//!
//! Inbound requests from the cloud are routed to one of four services, each
//! with its own worker thread and at most one request in flight. The
//! application plugs in a [`ServiceHandler`] per service (and, for data
//! receive, per target).

pub mod filesystem;
pub mod firmware;
pub mod receive;

use core::fmt;

use crate::engine::Transport;
use crate::error::HandlerError;
use crate::worker::WorkerRole;

/// Services that accept cloud-initiated requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Command,
    DataReceive,
    RemoteConfig,
    Firmware,
}

impl Service {
    /// Worker start order.
    pub const ALL: [Self; 4] = [
        Self::RemoteConfig,
        Self::DataReceive,
        Self::Command,
        Self::Firmware,
    ];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    pub const fn worker_role(self) -> WorkerRole {
        match self {
            Self::Command => WorkerRole::CommandExecution,
            Self::DataReceive => WorkerRole::DataReceive,
            Self::RemoteConfig => WorkerRole::RemoteConfig,
            Self::Firmware => WorkerRole::Firmware,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::DataReceive => write!(f, "data-receive"),
            Self::RemoteConfig => write!(f, "remote-config"),
            Self::Firmware => write!(f, "firmware"),
        }
    }
}

/// Firmware-specific details attached to firmware requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareImage {
    pub target: u8,
    pub sha256: [u8; 32],
}

/// A fully reassembled request, as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub service: Service,
    pub transport: Transport,
    pub target: Option<String>,
    pub payload: Vec<u8>,
    pub response_required: bool,
    pub firmware: Option<FirmwareImage>,
}

impl InboundRequest {
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }
}

pub type HandlerResult = Result<Vec<u8>, HandlerError>;

/// Application code that answers inbound requests. Runs on the service's
/// worker thread, never on the engine thread.
pub trait ServiceHandler: Send + Sync {
    fn handle(&self, request: &InboundRequest) -> HandlerResult;
}

impl<F> ServiceHandler for F
where
    F: Fn(&InboundRequest) -> HandlerResult + Send + Sync,
{
    fn handle(&self, request: &InboundRequest) -> HandlerResult {
        self(request)
    }
}
