//! Session Layer
//!
//! - [`manager`] - the lifecycle state machine
//! - [`telemetry`] - frame stream to handler delivery
//! - [`dispatcher`] - named device commands

pub mod dispatcher;
pub mod manager;
pub mod telemetry;

pub use dispatcher::CommandDispatcher;
pub use manager::{CollaboratorLoader, Session};
pub use telemetry::{PipelineStats, SampleHandler, TelemetryPipeline, WindowFeeder};
