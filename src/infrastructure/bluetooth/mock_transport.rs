//! Mock Transport
//!
//! Scripted stand-in for the BLE stack. Tests script scan results and
//! connect failures and inject frames; the `mock-transport` feature also
//! uses it to simulate a sensor streaming synthetic motion.

use crate::domain::models::DeviceDescriptor;
use crate::error::BridgeError;
use crate::infrastructure::bluetooth::protocol::{FRAME_HEADER, FRAME_KIND_IMU};
use crate::infrastructure::bluetooth::transport::{FrameReceiver, FrameSender, Transport};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Interval between synthetic frames (50 Hz)
const SIMULATED_FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceDescriptor>,
    scan_delay: Duration,
    scan_error: Option<String>,
    /// Connect attempts that fail before one succeeds
    connect_failures: u32,
    connect_attempts: u32,
    connected_address: Option<String>,
    frame_tx: Option<FrameSender>,
    written: Vec<Vec<u8>>,
    write_error: Option<String>,
    simulate: bool,
    simulator: Option<JoinHandle<()>>,
}

impl MockState {
    fn end_stream(&mut self) {
        self.frame_tx = None;
        if let Some(simulator) = self.simulator.take() {
            simulator.abort();
        }
    }
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single WT9011 that streams synthetic frames once subscribed
    pub fn simulated() -> Self {
        let transport = Self::new()
            .with_devices(vec![DeviceDescriptor::new("WT901BLE67", "C0:FF:EE:00:90:11")])
            .with_scan_delay(Duration::from_millis(500));
        transport.state().simulate = true;
        transport
    }

    pub fn with_devices(self, devices: Vec<DeviceDescriptor>) -> Self {
        self.state().devices = devices;
        self
    }

    pub fn with_scan_delay(self, delay: Duration) -> Self {
        self.state().scan_delay = delay;
        self
    }

    pub fn with_scan_error(self, message: &str) -> Self {
        self.state().scan_error = Some(message.to_string());
        self
    }

    /// Fail the first `failures` connect attempts
    pub fn failing_connects(self, failures: u32) -> Self {
        self.state().connect_failures = failures;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_connects(u32::MAX)
    }

    pub fn with_write_error(self, message: &str) -> Self {
        self.state().write_error = Some(message.to_string());
        self
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn connected_address(&self) -> Option<String> {
        self.state().connected_address.clone()
    }

    /// Payloads written so far, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state().frame_tx.is_some()
    }

    /// Deliver a frame to the active subscription. False when none exists.
    pub fn push_frame(&self, frame: Vec<u8>) -> bool {
        match &self.state().frame_tx {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// End the stream from the device side
    pub fn close_stream(&self) {
        self.state().end_stream();
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        let delay = {
            let state = self.state();
            if let Some(message) = &state.scan_error {
                return Err(BridgeError::Scan(message.clone()));
            }
            state.scan_delay
        };
        debug!("Mock scan for {:?} (responds after {:?})", timeout, delay);
        tokio::time::sleep(delay).await;
        Ok(self.state().devices.clone())
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if state.connect_attempts <= state.connect_failures {
            return Err(BridgeError::transport(format!(
                "{} did not respond",
                address
            )));
        }
        state.connected_address = Some(address.to_string());
        info!("Mock connected to {}", address);
        Ok(())
    }

    async fn subscribe(&self) -> Result<FrameReceiver> {
        let mut state = self.state();
        if state.connected_address.is_none() {
            return Err(BridgeError::NotConnected);
        }
        state.end_stream();

        let (tx, rx) = mpsc::unbounded_channel();
        if state.simulate {
            state.simulator = Some(tokio::spawn(simulate_frames(tx.clone())));
        }
        state.frame_tx = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.state().end_stream();
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.connected_address.is_none() {
            return Err(BridgeError::NotConnected);
        }
        if let Some(message) = &state.write_error {
            return Err(BridgeError::Transport(message.clone()));
        }
        state.written.push(payload.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state();
        state.end_stream();
        state.connected_address = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected_address.is_some()
    }
}

async fn simulate_frames(tx: FrameSender) {
    let mut ticker = tokio::time::interval(SIMULATED_FRAME_INTERVAL);
    let mut t = 0.0f32;
    loop {
        ticker.tick().await;
        if tx.send(synthetic_frame(t)).is_err() {
            break;
        }
        t += SIMULATED_FRAME_INTERVAL.as_secs_f32();
    }
}

/// Slow rotation about Z with gravity on the Z axis
fn synthetic_frame(t: f32) -> Vec<u8> {
    let phase = t * std::f32::consts::TAU * 0.25;
    let readings: [i16; 9] = [
        (phase.sin() * 1024.0) as i16,
        (phase.cos() * 1024.0) as i16,
        2048,
        0,
        0,
        (phase.cos() * 1474.0) as i16,
        (phase.sin() * 2730.0) as i16,
        0,
        ((phase % std::f32::consts::TAU) / std::f32::consts::TAU * 32767.0) as i16,
    ];

    let mut frame = vec![FRAME_HEADER, FRAME_KIND_IMU];
    for value in readings {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame
}
