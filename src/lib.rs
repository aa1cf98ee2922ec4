//! WT9011 Session Bridge
//!
//! Drives a single WT9011 BLE motion sensor from synchronous callers:
//! discovery, connection with bounded retries, telemetry streaming to a
//! registered handler and device commands. Everything asynchronous runs on
//! a runtime owned by the session.
//!
//! ## Layers
//!
//! - [`domain`] - samples, commands, session states, the telemetry window
//! - [`infrastructure`] - BLE transport, WT9011 protocol, runtime, logging
//! - [`session`] - lifecycle, telemetry pipeline, command dispatch
//! - [`ffi`] - C ABI over a process-wide session

pub mod domain;
pub mod error;
pub mod ffi;
pub mod infrastructure;
pub mod session;

pub use domain::models::{Command, CommandIntent, DeviceDescriptor, SensorSample, SessionState};
pub use error::BridgeError;
pub use session::{CommandDispatcher, SampleHandler, Session, WindowFeeder};

pub type Result<T> = std::result::Result<T, BridgeError>;
