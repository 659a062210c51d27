//! Agent status events.
//!
//! Produced on the engine driver thread (transport changes, rejected
//! requests, aborts) and by the lifecycle manager; consumed by the
//! application whenever it polls `Instance::next_event()`.
//!
//! ```text
//! ┌───────────────┐   AgentEvent   ┌──────────────┐   next_event()   ┌─────────────┐
//! │ Engine driver │───────────────▶│ Bounded chan │─────────────────▶│ Application │
//! │ Lifecycle     │───────────────▶│  (depth 16)  │                  │             │
//! └───────────────┘                └──────────────┘                  └─────────────┘
//! ```
//!
//! When the application does not drain the queue, newest events are dropped
//! and a warning is logged.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::warn;

use crate::engine::Transport;
use crate::error::SessionError;
use crate::services::Service;

/// Queue depth per instance.
const EVENT_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Start completed; all workers are running.
    Started,
    TransportUp(Transport),
    TransportDown(Transport),
    /// An inbound request was refused before reaching a handler.
    SessionRejected {
        service: Service,
        reason: SessionError,
    },
    /// The engine honoured the terminate request.
    EngineTerminated,
    /// The engine failed; call `Instance::stop` to release the instance.
    EngineAborted,
}

pub(crate) struct EventQueue {
    channel: Channel<CriticalSectionRawMutex, AgentEvent, EVENT_DEPTH>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Err(e) = self.channel.try_send(event) {
            warn!("events: queue full, dropping {:?}", e);
        }
    }

    pub fn next(&self) -> Option<AgentEvent> {
        self.channel.try_receive().ok()
    }
}
