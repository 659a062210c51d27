//! Device-initiated actions: uploads of data, files and data points, and
//! connectivity checks. Each call blocks the calling thread on its own
//! transaction until the engine completes it or the caller's timeout
//! expires.
//!
//! ```text
//!   SendData ─────────────┐
//!   SendFile ── read ─────┼──▶ Action::SendData ──┐
//!   BinaryDataPoint ──────┘                       ├──▶ initiate ─▶ wait
//!   DataPoints ──────────────▶ Action::DataPoints ┤
//!   Ping ────────────────────▶ Action::Ping ──────┘
//! ```

use std::path::PathBuf;

use log::debug;
use miniz_oxide::deflate::compress_to_vec;

use crate::coordinator::Coordinator;
use crate::coordinator::transport::LinkState;
use crate::datapoints::{self, DataStream};
use crate::engine::{
    Action, CompletionStatus, DataPointUpload, OutboundData, SendBehavior, Transport,
};
use crate::error::ActionError;
use crate::sync::Timeout;

/// DEFLATE level used for compressed uploads.
const COMPRESSION_LEVEL: u8 = 6;

const MAX_CONTENT_TYPE_LEN: usize = 255;

/// Upload `payload` to a cloud-side path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendData {
    pub transport: Transport,
    pub path: String,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
    pub behavior: SendBehavior,
    pub response_required: bool,
    pub compress: bool,
}

impl SendData {
    pub fn new(path: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            transport: Transport::Tcp,
            path: path.into(),
            content_type: None,
            payload: payload.into(),
            behavior: SendBehavior::Overwrite,
            response_required: true,
            compress: false,
        }
    }
}

/// Upload the content of a local file. The file is read when the request
/// is performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFile {
    pub transport: Transport,
    pub local_path: PathBuf,
    pub path: String,
    pub content_type: Option<String>,
    pub behavior: SendBehavior,
    pub response_required: bool,
    pub compress: bool,
}

impl SendFile {
    pub fn new(local_path: impl Into<PathBuf>, path: impl Into<String>) -> Self {
        Self {
            transport: Transport::Tcp,
            local_path: local_path.into(),
            path: path.into(),
            content_type: None,
            behavior: SendBehavior::Overwrite,
            response_required: true,
            compress: false,
        }
    }
}

/// Where a binary data point's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinarySource {
    Data(Vec<u8>),
    File(PathBuf),
}

/// One opaque sample, stored as the stream's `.bin` resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDataPoint {
    pub transport: Transport,
    pub stream_id: String,
    pub source: BinarySource,
    pub response_required: bool,
}

impl BinaryDataPoint {
    pub fn new(stream_id: impl Into<String>, source: BinarySource) -> Self {
        Self {
            transport: Transport::Tcp,
            stream_id: stream_id.into(),
            source,
            response_required: false,
        }
    }

    /// Cloud path the sample is written to.
    pub fn cloud_path(&self) -> String {
        format!("DataPoint/{}.bin", self.stream_id)
    }
}

/// Upload the pending samples of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoints {
    pub transport: Transport,
    pub streams: Vec<DataStream>,
    pub response_required: bool,
}

/// Check connectivity over a short-message transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub transport: Transport,
    pub response_required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    SendData(SendData),
    SendFile(SendFile),
    BinaryDataPoint(BinaryDataPoint),
    DataPoints(DataPoints),
    Ping(Ping),
}

impl Request {
    pub fn transport(&self) -> Transport {
        match self {
            Self::SendData(d) => d.transport,
            Self::SendFile(f) => f.transport,
            Self::BinaryDataPoint(b) => b.transport,
            Self::DataPoints(d) => d.transport,
            Self::Ping(p) => p.transport,
        }
    }

    fn needs_file_system(&self) -> bool {
        matches!(
            self,
            Self::SendFile(_)
                | Self::BinaryDataPoint(BinaryDataPoint {
                    source: BinarySource::File(_),
                    ..
                })
        )
    }
}

/// What the cloud answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub response: Vec<u8>,
}

fn check_upload(path: &str, content_type: Option<&str>) -> Result<(), ActionError> {
    if path.is_empty() {
        return Err(ActionError::InvalidCloudPath);
    }
    if content_type.is_some_and(|c| c.is_empty() || c.len() > MAX_CONTENT_TYPE_LEN) {
        return Err(ActionError::InvalidContentType);
    }
    Ok(())
}

fn check_arguments(request: &Request) -> Result<(), ActionError> {
    match request {
        Request::SendData(d) => {
            check_upload(&d.path, d.content_type.as_deref())?;
            if d.payload.is_empty() {
                return Err(ActionError::InvalidData);
            }
        }
        Request::SendFile(f) => {
            check_upload(&f.path, f.content_type.as_deref())?;
            if f.local_path.as_os_str().is_empty() {
                return Err(ActionError::InvalidLocalPath);
            }
        }
        Request::BinaryDataPoint(b) => {
            if !datapoints::is_valid_stream_id(&b.stream_id) {
                return Err(ActionError::InvalidStreamId);
            }
            match &b.source {
                BinarySource::Data(data) if data.is_empty() => return Err(ActionError::InvalidData),
                BinarySource::File(path) if path.as_os_str().is_empty() => {
                    return Err(ActionError::InvalidLocalPath);
                }
                _ => {}
            }
        }
        Request::DataPoints(d) => {
            if d.streams.iter().all(|s| s.points.is_empty()) {
                return Err(ActionError::EmptyCollection);
            }
        }
        Request::Ping(_) => {}
    }
    Ok(())
}

/// Read a local file for upload.
fn read_file(path: &std::path::Path) -> Result<Vec<u8>, ActionError> {
    let meta = std::fs::metadata(path).map_err(|_| ActionError::NotAFile)?;
    if !meta.is_file() {
        return Err(ActionError::NotAFile);
    }
    std::fs::read(path).map_err(|e| {
        debug!("txn: reading {} failed: {}", path.display(), e);
        ActionError::AccessingFile
    })
}

/// A request reduced to what the engine is handed.
enum Lowered {
    Data(SendData),
    DataPoints(DataPoints),
    Ping(Ping),
}

/// Read local files and turn file and binary uploads into plain data
/// uploads.
fn lower(request: Request) -> Result<Lowered, ActionError> {
    Ok(match request {
        Request::SendData(d) => Lowered::Data(d),
        Request::SendFile(f) => Lowered::Data(SendData {
            transport: f.transport,
            payload: read_file(&f.local_path)?,
            path: f.path,
            content_type: f.content_type,
            behavior: f.behavior,
            response_required: f.response_required,
            compress: f.compress,
        }),
        Request::BinaryDataPoint(b) => {
            let path = b.cloud_path();
            let payload = match b.source {
                BinarySource::Data(data) => data,
                BinarySource::File(local) => read_file(&local)?,
            };
            Lowered::Data(SendData {
                transport: b.transport,
                path,
                content_type: None,
                payload,
                behavior: SendBehavior::Overwrite,
                response_required: b.response_required,
                compress: false,
            })
        }
        Request::DataPoints(d) => Lowered::DataPoints(d),
        Request::Ping(p) => Lowered::Ping(p),
    })
}

impl Coordinator {
    fn check_request(&self, request: &Request) -> Result<(), ActionError> {
        check_arguments(request)?;
        match request {
            Request::Ping(p) if !p.transport.is_short_message() => {
                return Err(ActionError::TransportNotValid);
            }
            Request::Ping(_) => {}
            _ if self.config.services.data.is_none() => {
                return Err(ActionError::ServiceDisabled);
            }
            _ if request.needs_file_system() && self.config.services.file_system.is_none() => {
                return Err(ActionError::FileSystemNotSupported);
            }
            _ => {}
        }
        let transport = request.transport();
        if !self.transport_allowed(transport) {
            return Err(ActionError::TransportNotValid);
        }
        if self.link(transport) != LinkState::Up {
            return Err(ActionError::TransportNotStarted);
        }
        Ok(())
    }

    pub fn perform(&self, request: Request, timeout: Timeout) -> Result<Reply, ActionError> {
        if !self.driver_alive() {
            return Err(ActionError::NotRunning);
        }
        self.check_request(&request)?;

        let lowered = lower(request)?;

        let (handle, txn) = self.transactions.begin(&self.platform)?;
        let action = match lowered {
            Lowered::Data(d) => {
                let (payload, compressed) = if d.compress {
                    (compress_to_vec(&d.payload, COMPRESSION_LEVEL), true)
                } else {
                    (d.payload, false)
                };
                Action::SendData(OutboundData {
                    handle,
                    transport: d.transport,
                    path: d.path,
                    content_type: d.content_type,
                    payload,
                    behavior: d.behavior,
                    response_required: d.response_required,
                    compressed,
                })
            }
            Lowered::DataPoints(d) => Action::DataPoints(DataPointUpload {
                handle,
                transport: d.transport,
                streams: d.streams,
                response_required: d.response_required,
            }),
            Lowered::Ping(p) => Action::Ping {
                handle,
                transport: p.transport,
                response_required: p.response_required,
            },
        };

        if self.initiate(&action).is_err() {
            self.transactions.abandon(handle);
            return Err(ActionError::InitiateFailed);
        }
        debug!("txn: {} {} initiated", action.name(), handle);

        let done = txn.wait(timeout)?;
        match done.status {
            CompletionStatus::Success => Ok(Reply {
                response: done.response,
            }),
            CompletionStatus::Cancelled => Err(ActionError::Cancelled),
            status => Err(ActionError::Failed(status)),
        }
    }
}
