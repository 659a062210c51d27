//! CloudLink agent core.
//!
//! Device-side runtime that drives a cloud Transport Engine on a dedicated
//! worker thread and connects it to application handlers and callers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Application threads                       │
//! │   Instance::start / stop    perform / send_* / ping              │
//! │                                                                  │
//! │  ───────────────────── Instance (lifecycle) ──────────────────   │
//! │                                                                  │
//! │  ┌──────────────────────── Coordinator ──────────────────────┐   │
//! │  │ admission slots · transactions · transports · events       │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │        ▲ callbacks                        │ wake                 │
//! │  ┌─────┴──────────┐              ┌────────▼─────────────────┐    │
//! │  │ engine driver  │              │ service workers          │    │
//! │  │ (cl-engine)    │              │ cl-rci · cl-receive ·    │    │
//! │  └─────┬──────────┘              │ cl-cli · cl-firmware     │    │
//! │        │ run_once / initiate     └──────────────────────────┘    │
//! │  ──────┴──────────── TransportEngine port ─────────────────────  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every shared structure is guarded by one binary [`Lock`]; OS services go
//! through the [`Platform`] port so start-up rollback can be audited.

#![deny(unused_must_use)]

pub mod actions;
pub mod config;
pub mod datapoints;
pub mod engine;
pub mod error;
pub mod events;
pub mod global;
pub mod lifecycle;
pub mod platform;
pub mod services;
pub mod sync;
pub mod worker;

mod coordinator;

pub use actions::{BinaryDataPoint, BinarySource, DataPoints, Ping, Reply, Request, SendData, SendFile};
pub use config::{RetryPolicy, StartConfig};
pub use coordinator::Correlation;
pub use coordinator::transport::LinkState;
pub use engine::loopback::{CloudRequest, Finished, LoopbackCloud, LoopbackEngine, loopback};
pub use datapoints::{DataPoint, DataPointCollection, Value};
pub use engine::{SendBehavior, StopBehavior, Transport, TransportEngine};
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use lifecycle::{Instance, Step};
pub use platform::{AuditPlatform, Platform, ResourceKind, SharedPlatform, StdPlatform};
pub use services::receive::{ReceiveStatus, ReceiveStatusHandler};
pub use services::{FirmwareImage, HandlerResult, InboundRequest, Service, ServiceHandler};
pub use sync::{Lock, Timeout};
