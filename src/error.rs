//! Unified error types for the CloudLink agent core.
//!
//! Every public operation family has its own small error enum so callers can
//! match on exactly the failures that operation can produce. All of them
//! convert into the top-level [`Error`], which keeps application-side error
//! handling uniform. Most variants are `Copy`; only handler failures carry an
//! owned message.

use core::fmt;

use crate::config::ConfigField;
use crate::engine::CompletionStatus;
use crate::platform::ResourceKind;
use crate::worker::WorkerRole;

// ---------------------------------------------------------------------------
// Top-level agent error
// ---------------------------------------------------------------------------

/// Every fallible agent operation funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Start(StartError),
    Stop(StopError),
    Action(ActionError),
    Transport(TransportError),
    Register(RegisterError),
    Fs(FsError),
    Lock(LockError),
    DataPoint(DataPointError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(e) => write!(f, "start: {e}"),
            Self::Stop(e) => write!(f, "stop: {e}"),
            Self::Action(e) => write!(f, "action: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Register(e) => write!(f, "register: {e}"),
            Self::Fs(e) => write!(f, "file system: {e}"),
            Self::Lock(e) => write!(f, "lock: {e}"),
            Self::DataPoint(e) => write!(f, "data point: {e}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Why `Instance::start` refused or failed. Every variant except
/// `InvalidConfiguration` and `AlreadyStarted` is produced after a rollback of
/// all resources acquired up to the failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    /// A configuration field failed validation; nothing was allocated.
    InvalidConfiguration(ConfigField),
    /// The single-instance slot is already occupied.
    AlreadyStarted,
    /// The platform refused a reservation.
    OutOfMemory(ResourceKind),
    /// A Lock could not be created.
    LockCreationFailed,
    /// The platform could not spawn a worker thread.
    ThreadCreationFailed(WorkerRole),
    /// The Transport Engine refused to initialise.
    EngineInitFailed,
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration(field) => write!(f, "invalid configuration: {field}"),
            Self::AlreadyStarted => write!(f, "already started"),
            Self::OutOfMemory(kind) => write!(f, "out of memory ({kind})"),
            Self::LockCreationFailed => write!(f, "lock creation failed"),
            Self::ThreadCreationFailed(role) => write!(f, "thread creation failed ({role})"),
            Self::EngineInitFailed => write!(f, "engine init failed"),
        }
    }
}

impl std::error::Error for StartError {}

impl From<StartError> for Error {
    fn from(e: StartError) -> Self {
        Self::Start(e)
    }
}

impl From<LockError> for StartError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::ResourceExhausted => Self::LockCreationFailed,
            LockError::Destroyed => Self::LockCreationFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopError {
    /// The instance was never started or has already been stopped.
    NotStarted,
    /// The engine kept answering `Busy` to the terminate request past the
    /// configured retry budget. The instance is left running.
    EngineBusy,
    /// The engine rejected the terminate request. The instance is left running.
    TerminateRefused,
}

impl fmt::Display for StopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::EngineBusy => write!(f, "engine busy"),
            Self::TerminateRefused => write!(f, "terminate refused"),
        }
    }
}

impl std::error::Error for StopError {}

impl From<StopError> for Error {
    fn from(e: StopError) -> Self {
        Self::Stop(e)
    }
}

// ---------------------------------------------------------------------------
// Outbound transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionError {
    NotRunning,
    /// The service the action belongs to is not enabled.
    ServiceDisabled,
    /// File uploads need the file-system service.
    FileSystemNotSupported,
    InvalidCloudPath,
    /// Empty or longer than 255 bytes.
    InvalidContentType,
    /// Nothing to upload.
    InvalidData,
    InvalidLocalPath,
    /// The local path does not name a regular file.
    NotAFile,
    /// The local file could not be read.
    AccessingFile,
    InvalidStreamId,
    /// The collection holds no samples.
    EmptyCollection,
    /// The transport cannot carry this action.
    TransportNotValid,
    /// The transport has not been started.
    TransportNotStarted,
    /// The platform refused a transaction reservation.
    OutOfMemory,
    /// The transaction's completion Lock could not be created.
    LockFailed,
    /// The engine refused the action or stayed busy past the retry budget.
    InitiateFailed,
    /// The caller's wait expired. The transaction stays registered until the
    /// engine completes it.
    TimedOut,
    /// The engine cancelled the transaction.
    Cancelled,
    /// The engine completed the transaction with a failure status.
    Failed(CompletionStatus),
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "not running"),
            Self::ServiceDisabled => write!(f, "service disabled"),
            Self::FileSystemNotSupported => write!(f, "file system not supported"),
            Self::InvalidCloudPath => write!(f, "invalid cloud path"),
            Self::InvalidContentType => write!(f, "invalid content type"),
            Self::InvalidData => write!(f, "invalid data"),
            Self::InvalidLocalPath => write!(f, "invalid local path"),
            Self::NotAFile => write!(f, "not a file"),
            Self::AccessingFile => write!(f, "error accessing file"),
            Self::InvalidStreamId => write!(f, "invalid stream id"),
            Self::EmptyCollection => write!(f, "empty collection"),
            Self::TransportNotValid => write!(f, "transport not valid"),
            Self::TransportNotStarted => write!(f, "transport not started"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::LockFailed => write!(f, "lock failed"),
            Self::InitiateFailed => write!(f, "initiate failed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(status) => write!(f, "failed: {status}"),
        }
    }
}

impl std::error::Error for ActionError {}

impl From<ActionError> for Error {
    fn from(e: ActionError) -> Self {
        Self::Action(e)
    }
}

// ---------------------------------------------------------------------------
// Data point collections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPointError {
    /// The sample does not match its stream's format.
    InvalidArgument,
    /// Malformed, duplicate or unknown stream id.
    InvalidStreamId,
    InvalidFormat,
    InvalidUnits,
    InvalidForwardTo,
}

impl fmt::Display for DataPointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidStreamId => write!(f, "invalid stream id"),
            Self::InvalidFormat => write!(f, "invalid format"),
            Self::InvalidUnits => write!(f, "invalid units"),
            Self::InvalidForwardTo => write!(f, "invalid forward_to"),
        }
    }
}

impl std::error::Error for DataPointError {}

impl From<DataPointError> for Error {
    fn from(e: DataPointError) -> Self {
        Self::DataPoint(e)
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    NotRunning,
    /// UDP and SMS need the short-message service.
    NotValid,
    AlreadyStarted,
    NotStarted,
    InitiateFailed,
    TimedOut,
    LockFailed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "not running"),
            Self::NotValid => write!(f, "transport not valid"),
            Self::AlreadyStarted => write!(f, "already started"),
            Self::NotStarted => write!(f, "not started"),
            Self::InitiateFailed => write!(f, "initiate failed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::LockFailed => write!(f, "lock failed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Handler and receive-target registration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    NotRunning,
    ServiceDisabled,
    InvalidTarget,
    TargetAlreadyAdded,
    TargetNotAdded,
    LockFailed,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "not running"),
            Self::ServiceDisabled => write!(f, "service disabled"),
            Self::InvalidTarget => write!(f, "invalid target"),
            Self::TargetAlreadyAdded => write!(f, "target already added"),
            Self::TargetNotAdded => write!(f, "target not added"),
            Self::LockFailed => write!(f, "lock failed"),
        }
    }
}

impl std::error::Error for RegisterError {}

impl From<RegisterError> for Error {
    fn from(e: RegisterError) -> Self {
        Self::Register(e)
    }
}

// ---------------------------------------------------------------------------
// File-system virtualization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotRunning,
    NoSupport,
    InvalidPath,
    NotADir,
    AlreadyMapped,
    NotMapped,
    TableFull,
    LockFailed,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "not running"),
            Self::NoSupport => write!(f, "file system service disabled"),
            Self::InvalidPath => write!(f, "invalid path"),
            Self::NotADir => write!(f, "not a directory"),
            Self::AlreadyMapped => write!(f, "already mapped"),
            Self::NotMapped => write!(f, "not mapped"),
            Self::TableFull => write!(f, "virtual directory table full"),
            Self::LockFailed => write!(f, "lock failed"),
        }
    }
}

impl std::error::Error for FsError {}

impl From<FsError> for Error {
    fn from(e: FsError) -> Self {
        Self::Fs(e)
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The platform refused the Lock's reservation.
    ResourceExhausted,
    /// The Lock has been destroyed.
    Destroyed,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<LockError> for Error {
    fn from(e: LockError) -> Self {
        Self::Lock(e)
    }
}

// ---------------------------------------------------------------------------
// Inbound sessions
// ---------------------------------------------------------------------------

/// Why an inbound request was rejected or how its processing failed.
/// Reported to the engine through the delivery/reply callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    ServiceDisabled,
    /// No handler is registered for the service or target.
    NoHandler,
    InsufficientMemory,
    TargetNotFound,
    RequestTooLarge,
    InvalidFirmwareTarget,
    /// The correlation handle does not name the service's live session.
    UnknownSession,
    Cancelled,
    Handler(HandlerError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceDisabled => write!(f, "service disabled"),
            Self::NoHandler => write!(f, "no handler registered"),
            Self::InsufficientMemory => write!(f, "insufficient memory"),
            Self::TargetNotFound => write!(f, "target not found"),
            Self::RequestTooLarge => write!(f, "request too large"),
            Self::InvalidFirmwareTarget => write!(f, "invalid firmware target"),
            Self::UnknownSession => write!(f, "unknown session"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Handler(e) => write!(f, "handler: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Failure reported by an application handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: u32,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<HandlerError> for SessionError {
    fn from(e: HandlerError) -> Self {
        Self::Handler(e)
    }
}
