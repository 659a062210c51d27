//! Data-receive targets.
//!
//! Cloud-to-device data requests name a target. Each registered target has
//! its own handler and request size limit; requests for unknown targets fall
//! back to the service-wide handler.
//!
//! A target may also carry a status hook. It runs once when the exchange
//! ends, after the last reply byte went out or after the exchange failed,
//! on the engine driver thread and with no Lock held.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::Transport;
use crate::error::{RegisterError, SessionError};
use crate::services::ServiceHandler;

/// Longest accepted target name.
pub const MAX_TARGET_LEN: usize = 64;

/// How a data-receive exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveStatus {
    pub target: Option<String>,
    pub transport: Transport,
    /// Reply bytes handed to the engine.
    pub reply_len: usize,
    pub error: Option<SessionError>,
}

/// End-of-exchange notification for data-receive targets.
pub trait ReceiveStatusHandler: Send + Sync {
    fn on_status(&self, status: &ReceiveStatus);
}

impl<F> ReceiveStatusHandler for F
where
    F: Fn(&ReceiveStatus) + Send + Sync,
{
    fn on_status(&self, status: &ReceiveStatus) {
        self(status);
    }
}

#[derive(Clone)]
pub(crate) struct ReceiveTarget {
    pub handler: Arc<dyn ServiceHandler>,
    pub status: Option<Arc<dyn ReceiveStatusHandler>>,
    pub max_request_size: usize,
}

#[derive(Default)]
pub(crate) struct TargetTable {
    targets: BTreeMap<String, ReceiveTarget>,
    /// Hook for requests served by the service-wide handler.
    fallback_status: Option<Arc<dyn ReceiveStatusHandler>>,
}

impl TargetTable {
    pub fn add(
        &mut self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
        status: Option<Arc<dyn ReceiveStatusHandler>>,
        max_request_size: usize,
    ) -> Result<(), RegisterError> {
        if name.is_empty() || name.len() > MAX_TARGET_LEN {
            return Err(RegisterError::InvalidTarget);
        }
        if self.targets.contains_key(name) {
            return Err(RegisterError::TargetAlreadyAdded);
        }
        self.targets.insert(
            name.to_owned(),
            ReceiveTarget {
                handler,
                status,
                max_request_size,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), RegisterError> {
        if name.is_empty() {
            return Err(RegisterError::InvalidTarget);
        }
        self.targets
            .remove(name)
            .map(|_| ())
            .ok_or(RegisterError::TargetNotAdded)
    }

    pub fn get(&self, name: &str) -> Option<&ReceiveTarget> {
        self.targets.get(name)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn set_fallback_status(&mut self, status: Option<Arc<dyn ReceiveStatusHandler>>) {
        self.fallback_status = status;
    }

    pub fn fallback_status(&self) -> Option<Arc<dyn ReceiveStatusHandler>> {
        self.fallback_status.clone()
    }
}
