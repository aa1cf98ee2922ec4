//! WinRT Transport
//!
//! Ties the scanner and the connection together behind `Transport`.

use crate::domain::models::DeviceDescriptor;
use crate::domain::settings::SessionSettings;
use crate::error::BridgeError;
use crate::infrastructure::bluetooth::{
    connection::{BleLink, ConnectionConfig},
    protocol,
    scanner::BleScanner,
    transport::{FrameReceiver, Transport},
};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Default)]
struct LinkState {
    link: Option<BleLink>,
    notify_token: Option<i64>,
}

/// Windows Bluetooth LE transport
pub struct WinRtTransport {
    scanner: BleScanner,
    config: ConnectionConfig,
    state: Mutex<LinkState>,
}

impl WinRtTransport {
    pub fn new(settings: &SessionSettings) -> Result<Self> {
        Ok(Self {
            scanner: BleScanner::new(settings.service_uuid.as_deref())?,
            config: ConnectionConfig::from_settings(settings)?,
            state: Mutex::new(LinkState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn link(&self) -> Result<BleLink> {
        self.state().link.clone().ok_or(BridgeError::NotConnected)
    }
}

#[async_trait]
impl Transport for WinRtTransport {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        self.scanner.scan(timeout).await
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let raw = protocol::parse_address(address)?;
        let link = BleLink::open(raw, &self.config).await?;

        let previous = self.state().link.replace(link);
        if let Some(previous) = previous {
            previous.close();
        }
        info!("Connected to {}", address);
        Ok(())
    }

    async fn subscribe(&self) -> Result<FrameReceiver> {
        let link = self.link()?;
        let stale = self.state().notify_token.take();
        if let Some(token) = stale {
            let _ = link.disable_notifications(token).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let token = link.enable_notifications(tx).await?;
        self.state().notify_token = Some(token);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<()> {
        let (link, token) = {
            let mut state = self.state();
            (state.link.clone(), state.notify_token.take())
        };
        if let (Some(link), Some(token)) = (link, token) {
            link.disable_notifications(token).await?;
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.link()?.write(payload).await
    }

    async fn disconnect(&self) -> Result<()> {
        let (link, token) = {
            let mut state = self.state();
            (state.link.take(), state.notify_token.take())
        };
        let Some(link) = link else {
            return Ok(());
        };

        if let Some(token) = token {
            if let Err(e) = link.disable_notifications(token).await {
                warn!("Failed to disable notifications during disconnect: {}", e);
            }
        }
        link.close();
        info!("Disconnected from device");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state()
            .link
            .as_ref()
            .map(BleLink::is_connected)
            .unwrap_or(false)
    }
}
