//! One inbound request's state, from first fragment to last reply byte.
//!
//! ```text
//!   Accumulating ──final fragment──▶ Queued ──worker ran handler──▶ Completed
//!        │                              │                                │
//!        └──── error / cancel ──────────┴──────────────▶ Completed ◀────┘
//! ```
//!
//! Only the engine thread feeds fragments; only the service worker runs the
//! handler. Both reach the session through the service's admission slot.

use std::sync::Arc;

use crate::engine::{Delivery, SessionResult, Transport};
use crate::error::SessionError;
use crate::platform::Reservation;
use crate::services::receive::{ReceiveStatus, ReceiveStatusHandler};
use crate::services::{InboundRequest, Service, ServiceHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Accumulating,
    Queued,
    Completed,
}

/// Fixed facts about a request, decided at admission.
pub(crate) struct Admission {
    pub service: Service,
    pub transport: Transport,
    pub target: Option<String>,
    pub response_required: bool,
    pub limit: usize,
    /// Target-specific handler overriding the service-wide one.
    pub handler: Option<Arc<dyn ServiceHandler>>,
    pub firmware_target: Option<u8>,
    /// Told how the exchange ended.
    pub status: Option<Arc<dyn ReceiveStatusHandler>>,
}

/// Work handed to the service worker.
pub(crate) struct Claim {
    pub request: InboundRequest,
    pub handler: Option<Arc<dyn ServiceHandler>>,
    pub firmware_target: Option<u8>,
}

pub(crate) struct Session {
    admission: Admission,
    state: SessionState,
    input: Vec<u8>,
    claimed: bool,
    cancelled: bool,
    error: Option<SessionError>,
    reply: Vec<u8>,
    reply_offset: usize,
    _buffer: Reservation,
}

impl Session {
    pub fn new(admission: Admission, buffer: Reservation) -> Self {
        Self {
            admission,
            state: SessionState::Accumulating,
            input: Vec::new(),
            claimed: false,
            cancelled: false,
            error: None,
            reply: Vec::new(),
            reply_offset: 0,
            _buffer: buffer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn response_required(&self) -> bool {
        self.admission.response_required
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Feed one fragment. Retries of the final fragment land in `Queued` or
    /// `Completed` and never append again.
    pub fn accept(&mut self, data: &[u8], is_final: bool) -> Delivery {
        match self.state {
            SessionState::Accumulating => {
                if self.input.len() + data.len() > self.admission.limit {
                    self.fail(SessionError::RequestTooLarge);
                    return Delivery::Error(SessionError::RequestTooLarge);
                }
                self.input.extend_from_slice(data);
                if is_final {
                    self.state = SessionState::Queued;
                    Delivery::Busy
                } else {
                    Delivery::Continue(None)
                }
            }
            SessionState::Queued => Delivery::Busy,
            SessionState::Completed => Delivery::Continue(Some(self.result())),
        }
    }

    /// Take the reassembled request for handler invocation. At most once.
    pub fn claim(&mut self) -> Option<Claim> {
        if self.state != SessionState::Queued || self.claimed {
            return None;
        }
        self.claimed = true;
        Some(Claim {
            request: InboundRequest {
                service: self.admission.service,
                transport: self.admission.transport,
                target: self.admission.target.clone(),
                payload: core::mem::take(&mut self.input),
                response_required: self.admission.response_required,
                firmware: None,
            },
            handler: self.admission.handler.take(),
            firmware_target: self.admission.firmware_target,
        })
    }

    /// Record the handler's outcome.
    pub fn complete(&mut self, outcome: Result<Vec<u8>, SessionError>) {
        match outcome {
            Ok(reply) => {
                if self.admission.response_required {
                    self.reply = reply;
                }
            }
            Err(e) => {
                if self.admission.response_required {
                    self.reply = e.to_string().into_bytes();
                }
                self.error = Some(e);
            }
        }
        self.state = SessionState::Completed;
    }

    fn fail(&mut self, e: SessionError) {
        self.input.clear();
        self.error = Some(e);
        self.state = SessionState::Completed;
    }

    /// Cancel the session. Returns whether the slot may be cleared now; a
    /// session whose handler is running is cleared by its worker instead.
    pub fn cancel(&mut self) -> bool {
        self.cancelled = true;
        if self.state == SessionState::Queued && self.claimed {
            return false;
        }
        if self.state != SessionState::Completed {
            self.fail(SessionError::Cancelled);
        }
        true
    }

    pub fn result(&self) -> SessionResult {
        SessionResult {
            error: self.error.clone(),
            reply_len: self.reply.len(),
        }
    }

    /// Copy the next reply piece into `buf`. Returns bytes written and
    /// whether that was the last piece.
    pub fn next_reply(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let remaining = &self.reply[self.reply_offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.reply_offset += n;
        (n, self.reply_offset == self.reply.len())
    }

    /// The end-of-exchange report for a cleared session, if anyone asked
    /// for one.
    pub fn into_status(self) -> Option<(Arc<dyn ReceiveStatusHandler>, ReceiveStatus)> {
        let hook = self.admission.status?;
        Some((
            hook,
            ReceiveStatus {
                target: self.admission.target,
                transport: self.admission.transport,
                reply_len: self.reply_offset,
                error: self.error,
            },
        ))
    }
}
