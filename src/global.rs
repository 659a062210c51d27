//! Process-wide single instance, for applications that want one agent
//! reachable from anywhere instead of passing an [`Instance`] around.

use std::sync::{Arc, PoisonError, RwLock};

use log::info;

use crate::config::StartConfig;
use crate::engine::{StopBehavior, TransportEngine};
use crate::error::{StartError, StopError};
use crate::lifecycle::Instance;

static INSTANCE: RwLock<Option<Arc<Instance>>> = RwLock::new(None);

/// Start the process-wide instance. Fails with `AlreadyStarted` while one
/// is started. An installed instance that was stopped through its own handle
/// is replaced.
pub fn start<E: TransportEngine>(config: StartConfig, engine: E) -> Result<Arc<Instance>, StartError> {
    let mut slot = INSTANCE.write().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|i| i.is_started()) {
        return Err(StartError::AlreadyStarted);
    }
    if slot.take().is_some() {
        info!("global: discarding stopped instance");
    }
    let instance = Arc::new(Instance::start(config, engine)?);
    *slot = Some(Arc::clone(&instance));
    info!("global: instance installed");
    Ok(instance)
}

/// The running process-wide instance, if any.
pub fn instance() -> Option<Arc<Instance>> {
    INSTANCE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Stop and uninstall the process-wide instance. If the engine refuses to
/// terminate it stays installed and running; an instance that was already
/// stopped is uninstalled and reported as `NotStarted`.
pub fn stop(behavior: StopBehavior) -> Result<(), StopError> {
    let Some(instance) = instance() else {
        return Err(StopError::NotStarted);
    };
    let result = instance.stop(behavior);
    if instance.is_started() {
        return result;
    }
    let mut slot = INSTANCE.write().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|i| Arc::ptr_eq(i, &instance)) {
        *slot = None;
    }
    info!("global: instance removed");
    result
}
