//! Worker entry points: the engine driver loop and the service worker loop.

use std::sync::Arc;

use log::{error, info, warn};

use super::{CallbackSink, Coordinator, ServiceRuntime};
use crate::engine::RunStatus;
use crate::events::AgentEvent;
use crate::sync::{Acquire, Timeout};
use crate::worker::WorkerContext;

/// Clears the driver-alive flag however the loop exits.
struct Alive<'a>(&'a Coordinator);

impl Drop for Alive<'_> {
    fn drop(&mut self) {
        self.0.set_driver_alive(false);
    }
}

/// Engine driver: call `run_once` until stopped, terminated or aborted.
pub(crate) fn drive_engine(ctx: WorkerContext, coordinator: Arc<Coordinator>) {
    coordinator.set_driver_alive(true);
    let _alive = Alive(&coordinator);
    ctx.mark_running();

    let mut idle = 0u32;
    while ctx.should_run() {
        let status = match coordinator.engine.lock() {
            Ok(mut engine) => match engine.as_mut() {
                Some(engine) => engine.run_once(&mut CallbackSink::new(&coordinator)),
                None => RunStatus::Terminated,
            },
            Err(_) => RunStatus::Terminated,
        };
        match status {
            RunStatus::Working => {
                idle = 0;
                coordinator.platform.yield_now();
            }
            RunStatus::Idle => {
                coordinator.retry.pause(coordinator.platform.as_ref(), idle);
                idle = idle.saturating_add(1);
            }
            RunStatus::Terminated => {
                info!("worker[{}]: engine terminated", ctx.role());
                coordinator.events.emit(AgentEvent::EngineTerminated);
                ctx.request_stop();
            }
            RunStatus::Aborted => {
                error!("worker[{}]: engine aborted", ctx.role());
                coordinator.mark_aborted();
                coordinator.events.emit(AgentEvent::EngineAborted);
                ctx.request_stop();
            }
        }
    }
}

/// Service worker: sleep until the engine thread queues a session, then run
/// its handler.
pub(crate) fn serve(ctx: WorkerContext, runtime: Arc<ServiceRuntime>) {
    runtime.attach(ctx.waker());
    ctx.mark_running();
    // Sessions queued before the waker was attached were never signalled.
    runtime.process_queued();

    while ctx.should_run() {
        match ctx.wait_signal(Timeout::Infinite) {
            Ok(Acquire::Acquired) => {}
            Ok(Acquire::TimedOut) => continue,
            Err(e) => {
                warn!("worker[{}]: wait failed: {}", ctx.role(), e);
                break;
            }
        }
        if !ctx.should_run() {
            break;
        }
        runtime.process_queued();
    }
}
