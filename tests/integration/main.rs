//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below exercises one subsystem of a started instance against
//! the in-process loopback engine. Resource balance is checked through
//! `AuditPlatform`.

mod session_tests;
mod support;
mod transaction_tests;
mod transport_tests;
mod upload_tests;
