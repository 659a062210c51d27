//! Transport start/stop on behalf of application threads.
//!
//! Application threads only request changes; the link state moves to `Up` or
//! `Down` when the engine reports it through `on_transport`. A start whose
//! wait expires leaves the link `Starting` until that report arrives.

use std::time::Instant;

use log::{info, warn};

use super::Coordinator;
use crate::engine::{Action, StopBehavior, Transport, TransportState};
use crate::error::TransportError;
use crate::events::AgentEvent;
use crate::sync::Timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Down,
    Starting,
    Up,
    Stopping,
}

#[derive(Debug, Default)]
pub(crate) struct TransportTable {
    links: [LinkState; 3],
}

impl TransportTable {
    pub fn get(&self, transport: Transport) -> LinkState {
        self.links[transport.index()]
    }

    fn set(&mut self, transport: Transport, state: LinkState) -> LinkState {
        core::mem::replace(&mut self.links[transport.index()], state)
    }

    pub fn up(&self) -> impl Iterator<Item = Transport> + '_ {
        Transport::ALL
            .into_iter()
            .filter(|t| self.get(*t) == LinkState::Up)
    }
}

/// Engine thread: apply a reported link change.
pub(crate) fn record_state(coordinator: &Coordinator, transport: Transport, state: TransportState) {
    let next = match state {
        TransportState::Up => LinkState::Up,
        TransportState::Down => LinkState::Down,
    };
    let Ok(prev) = coordinator.transports.with(|t| t.set(transport, next)) else {
        return;
    };
    if prev == next {
        return;
    }
    info!("transport: {} {:?} -> {:?}", transport, prev, next);
    coordinator.events.emit(match state {
        TransportState::Up => AgentEvent::TransportUp(transport),
        TransportState::Down => AgentEvent::TransportDown(transport),
    });
}

impl Coordinator {
    pub fn link(&self, transport: Transport) -> LinkState {
        self.transports
            .with(|t| t.get(transport))
            .unwrap_or(LinkState::Down)
    }

    pub(crate) fn transport_allowed(&self, transport: Transport) -> bool {
        match transport {
            Transport::Tcp => true,
            Transport::Udp => self
                .config
                .services
                .short_message
                .as_ref()
                .is_some_and(|sm| sm.udp),
            Transport::Sms => self
                .config
                .services
                .short_message
                .as_ref()
                .is_some_and(|sm| sm.sms),
        }
    }

    /// Move `transport` from `from` to `to`; report what was there instead
    /// when it was not `from`.
    fn swap_link(
        &self,
        transport: Transport,
        from: LinkState,
        to: LinkState,
    ) -> Result<(), LinkState> {
        self.transports
            .with(|t| {
                let current = t.get(transport);
                if current == from {
                    t.set(transport, to);
                    Ok(())
                } else {
                    Err(current)
                }
            })
            .unwrap_or(Err(LinkState::Down))
    }

    pub fn start_transport(&self, transport: Transport, timeout: Timeout) -> Result<(), TransportError> {
        if !self.transport_allowed(transport) {
            return Err(TransportError::NotValid);
        }
        if !self.driver_alive() {
            return Err(TransportError::NotRunning);
        }
        self.swap_link(transport, LinkState::Down, LinkState::Starting)
            .map_err(|_| TransportError::AlreadyStarted)?;
        if self.initiate(&Action::StartTransport(transport)).is_err() {
            let _ = self.swap_link(transport, LinkState::Starting, LinkState::Down);
            return Err(TransportError::InitiateFailed);
        }

        let deadline = match timeout {
            Timeout::NoWait => Some(Instant::now()),
            Timeout::Bounded(d) => Some(Instant::now() + d),
            Timeout::Infinite => None,
        };
        let mut attempt = 0;
        loop {
            match self.link(transport) {
                LinkState::Up => {
                    info!("transport: {} started", transport);
                    return Ok(());
                }
                LinkState::Down => return Err(TransportError::InitiateFailed),
                LinkState::Starting | LinkState::Stopping => {}
            }
            if !self.driver_alive() {
                let _ = self.swap_link(transport, LinkState::Starting, LinkState::Down);
                return Err(TransportError::NotRunning);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                // The engine still owns the start; its report settles the link.
                warn!("transport: {} start timed out, still starting", transport);
                return Err(TransportError::TimedOut);
            }
            self.retry.pause(self.platform.as_ref(), attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    pub fn stop_transport(&self, transport: Transport, behavior: StopBehavior) -> Result<(), TransportError> {
        self.swap_link(transport, LinkState::Up, LinkState::Stopping)
            .map_err(|_| TransportError::NotStarted)?;
        let action = Action::StopTransport {
            transport,
            behavior,
        };
        if self.initiate(&action).is_err() {
            let _ = self.swap_link(transport, LinkState::Stopping, LinkState::Up);
            return Err(TransportError::InitiateFailed);
        }

        let mut attempt = 0;
        while self.link(transport) != LinkState::Down {
            if !self.driver_alive() {
                let _ = self.swap_link(transport, LinkState::Stopping, LinkState::Down);
                break;
            }
            self.retry.pause(self.platform.as_ref(), attempt);
            attempt = attempt.saturating_add(1);
        }
        info!("transport: {} stopped", transport);
        Ok(())
    }
}
