//! Transport Capability
//!
//! The narrow interface the session drives the radio through, and the
//! bundle of collaborators loaded by `init`.

use crate::domain::models::DeviceDescriptor;
use crate::domain::settings::SessionSettings;
use crate::infrastructure::bluetooth::protocol::{
    CommandBuilder, FrameParser, Wt9011Commands, Wt9011Parser,
};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Raw frames in arrival order. Closed when the subscription ends.
pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<u8>>;
pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

/// BLE link to a single device.
///
/// Implementations hold at most one connection. Methods are called from the
/// session's executor, never concurrently for lifecycle operations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover advertising devices for `timeout`, in discovery order.
    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>>;

    /// Open a connection and locate the notify and write characteristics.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Enable notifications and hand back the frame stream.
    async fn subscribe(&self) -> Result<FrameReceiver>;

    /// Stop notifications. The frame stream closes.
    async fn unsubscribe(&self) -> Result<()>;

    /// Write one command payload.
    async fn write(&self, payload: &[u8]) -> Result<()>;

    /// Release the connection. No-op when not connected.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// External capabilities the session is built from
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub parser: Arc<dyn FrameParser>,
    pub commands: Arc<dyn CommandBuilder>,
}

impl Collaborators {
    /// WT9011 parser and command builder over the given transport
    pub fn wt9011(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            parser: Arc::new(Wt9011Parser),
            commands: Arc::new(Wt9011Commands),
        }
    }

    /// Collaborators backed by this platform's BLE stack
    pub fn platform_default(settings: &SessionSettings) -> Result<Self> {
        let transport = platform_transport(settings)?;
        Ok(Self::wt9011(transport))
    }
}

#[cfg(windows)]
fn platform_transport(settings: &SessionSettings) -> Result<Arc<dyn Transport>> {
    let transport = super::service::WinRtTransport::new(settings)?;
    Ok(Arc::new(transport))
}

#[cfg(all(not(windows), feature = "mock-transport"))]
fn platform_transport(_settings: &SessionSettings) -> Result<Arc<dyn Transport>> {
    tracing::warn!("No native BLE backend; using simulated WT9011");
    Ok(Arc::new(super::mock_transport::MockTransport::simulated()))
}

#[cfg(all(not(windows), not(feature = "mock-transport")))]
fn platform_transport(_settings: &SessionSettings) -> Result<Arc<dyn Transport>> {
    Err(crate::error::BridgeError::Init(
        "no BLE backend available on this platform".to_string(),
    ))
}
