//! KILN build daemon library.
//!
//! The binary (`kilnd`) wires a [`kiln_core::BuildService`] to the
//! WebSocket channel implemented here: connection pumps, hub, job registry
//! and the business handler.

pub mod conn;
pub mod handler;
pub mod hub;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod telemetry;
