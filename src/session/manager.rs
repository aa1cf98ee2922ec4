//! Session Manager
//!
//! Lifecycle state machine for one sensor. Public operations block the
//! calling thread; the transport work runs on the session's own runtime.
//!
//! ```text
//! Uninitialized --init--> Ready --connect--> Connecting --ok--> Streaming
//!                           ^  \--scan--> Scanning --/            |
//!                           |                     Faulted <-fail--/ (connect)
//!                           \------- Disconnected <--disconnect---/
//! ```

use crate::domain::models::{hex_dump, Command, DeviceDescriptor, SessionState};
use crate::domain::settings::SessionSettings;
use crate::error::BridgeError;
use crate::infrastructure::bluetooth::{CommandBuilder, Collaborators, Transport};
use crate::infrastructure::runtime::AsyncBridge;
use crate::session::dispatcher::CommandDispatcher;
use crate::session::telemetry::{PipelineStats, SampleHandler, TelemetryPipeline};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Set while a `Session` exists in this process
static SESSION_LIVE: AtomicBool = AtomicBool::new(false);

/// Produces the collaborators on `init`
pub type CollaboratorLoader = Box<dyn Fn() -> Result<Collaborators> + Send + Sync>;

struct SessionInner {
    state: SessionState,
    collaborators: Option<Collaborators>,
    address: Option<String>,
}

impl SessionInner {
    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session state: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.collaborators
            .as_ref()
            .map(|c| c.transport.clone())
            .ok_or(BridgeError::NotInitialized)
    }
}

/// Clears the busy flag when the lifecycle operation ends
struct LifecycleGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct Session {
    settings: SessionSettings,
    loader: CollaboratorLoader,
    bridge: AsyncBridge,
    pipeline: TelemetryPipeline,
    inner: Mutex<SessionInner>,
    busy: AtomicBool,
}

impl Session {
    /// Session over this platform's BLE stack
    pub fn new(settings: SessionSettings) -> Result<Self> {
        let loader_settings = settings.clone();
        Self::with_loader(settings, move || {
            Collaborators::platform_default(&loader_settings)
        })
    }

    /// Session whose collaborators come from `loader`.
    ///
    /// Only one session may exist per process; a second one fails with
    /// `SessionExists` until the first is dropped.
    pub fn with_loader<L>(settings: SessionSettings, loader: L) -> Result<Self>
    where
        L: Fn() -> Result<Collaborators> + Send + Sync + 'static,
    {
        if SESSION_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::SessionExists);
        }

        Ok(Self {
            settings,
            loader: Box::new(loader),
            bridge: AsyncBridge::new(),
            pipeline: TelemetryPipeline::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                collaborators: None,
                address: None,
            }),
            busy: AtomicBool::new(false),
        })
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        self.inner().transition(next);
    }

    fn begin(&self, operation: &'static str) -> Result<LifecycleGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                warn!("Rejected {}: another operation is in progress", operation);
                BridgeError::Busy { operation }
            })?;
        Ok(LifecycleGuard { busy: &self.busy })
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Address of the live connection
    pub fn connected_address(&self) -> Option<String> {
        self.inner().address.clone()
    }

    pub fn is_receiving(&self) -> bool {
        self.pipeline.is_running()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Named device commands sent through this session
    pub fn commands(&self) -> CommandDispatcher<'_> {
        CommandDispatcher::new(self)
    }

    pub(crate) fn command_builder(&self) -> Result<Arc<dyn CommandBuilder>> {
        self.inner()
            .collaborators
            .as_ref()
            .map(|c| c.commands.clone())
            .ok_or(BridgeError::NotInitialized)
    }

    /// Load collaborators. A no-op once initialized.
    pub fn init(&self) -> Result<()> {
        let _guard = self.begin("init")?;

        if self.state() != SessionState::Uninitialized {
            debug!("Session already initialized");
            return Ok(());
        }

        match (self.loader)() {
            Ok(collaborators) => {
                let mut inner = self.inner();
                inner.collaborators = Some(collaborators);
                inner.transition(SessionState::Ready);
                info!("Session initialized");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize session: {}", e);
                Err(match e {
                    BridgeError::Init(_) => e,
                    other => BridgeError::Init(other.to_string()),
                })
            }
        }
    }

    /// Discover devices for `timeout_secs` and return at most `max_results`
    /// of them in discovery order.
    ///
    /// A transport that does not answer within the timeout plus the grace
    /// period yields an empty list rather than an error.
    pub fn scan(&self, timeout_secs: f32, max_results: usize) -> Result<Vec<DeviceDescriptor>> {
        let _guard = self.begin("scan")?;

        let transport = {
            let mut inner = self.inner();
            match inner.state {
                SessionState::Ready | SessionState::Disconnected | SessionState::Faulted => {}
                SessionState::Uninitialized => return Err(BridgeError::NotInitialized),
                state => {
                    return Err(BridgeError::InvalidState {
                        operation: "scan",
                        state,
                    })
                }
            }
            let transport = inner.transport()?;
            inner.transition(SessionState::Scanning);
            transport
        };

        let timeout = Duration::try_from_secs_f32(timeout_secs.max(0.0))
            .or_else(|_| Duration::try_from_secs_f32(self.settings.scan_timeout_secs))
            .unwrap_or_default();
        let deadline = timeout.saturating_add(self.settings.scan_grace());
        info!("Scanning for {:?}", timeout);

        let outcome = self.bridge.run_blocking(async move {
            tokio::time::timeout(deadline, transport.scan(timeout)).await
        });
        self.set_state(SessionState::Ready);

        match outcome? {
            Err(_) => {
                warn!("Scan gave no answer within {:?}", deadline);
                Ok(Vec::new())
            }
            Ok(Err(e)) => {
                error!("Scan failed: {}", e);
                Err(match e {
                    BridgeError::Scan(_) => e,
                    other => BridgeError::scan(other),
                })
            }
            Ok(Ok(mut devices)) => {
                let found = devices.len();
                devices.truncate(max_results);
                info!("Scan found {} device(s), returning {}", found, devices.len());
                Ok(devices)
            }
        }
    }

    /// Connect to `address`, retrying per the configured policy.
    ///
    /// Blocks for the whole retry sequence. Leaves the session `Streaming`
    /// on success and `Faulted` once every attempt has failed.
    pub fn connect(&self, address: &str) -> Result<()> {
        let _guard = self.begin("connect")?;

        let transport = {
            let mut inner = self.inner();
            match inner.state {
                SessionState::Ready | SessionState::Disconnected | SessionState::Faulted => {}
                SessionState::Uninitialized => return Err(BridgeError::NotInitialized),
                state => {
                    return Err(BridgeError::InvalidState {
                        operation: "connect",
                        state,
                    })
                }
            }
            let transport = inner.transport()?;
            inner.transition(SessionState::Connecting);
            transport
        };

        let policy = self.settings.connect_retry();
        info!(
            "Connecting to {} (up to {} attempts)",
            address, policy.max_attempts
        );

        let target = address.to_string();
        let outcome = self.bridge.run_blocking(async move {
            policy
                .run("Connect", |attempt| {
                    let transport = transport.clone();
                    let target = target.clone();
                    async move {
                        debug!("Connect attempt {} to {}", attempt, target);
                        transport.connect(&target).await
                    }
                })
                .await
        });

        match outcome {
            Ok(Ok(((), attempts))) => {
                let mut inner = self.inner();
                inner.address = Some(address.to_string());
                inner.transition(SessionState::Streaming);
                info!("Connected to {} on attempt {}", address, attempts);
                Ok(())
            }
            Ok(Err(exhausted)) => {
                self.set_state(SessionState::Faulted);
                error!(
                    "Giving up on {} after {} attempts",
                    address, exhausted.attempts
                );
                Err(BridgeError::Connect {
                    address: address.to_string(),
                    attempts: exhausted.attempts,
                    reason: exhausted.last_error.to_string(),
                })
            }
            Err(e) => {
                self.set_state(SessionState::Faulted);
                Err(e)
            }
        }
    }

    /// Subscribe to telemetry and deliver every parsed sample to `handler`.
    ///
    /// Calling again while receiving swaps the handler without touching the
    /// subscription.
    pub fn start_receiving(&self, handler: Arc<dyn SampleHandler>) -> Result<()> {
        let _guard = self.begin("receive")?;

        let (transport, parser) = {
            let inner = self.inner();
            if !inner.state.is_connected() {
                return Err(BridgeError::NotConnected);
            }
            let collaborators = inner
                .collaborators
                .as_ref()
                .ok_or(BridgeError::NotInitialized)?;
            (collaborators.transport.clone(), collaborators.parser.clone())
        };

        self.pipeline.register(handler);
        if self.pipeline.is_running() {
            info!("Telemetry handler replaced");
            return Ok(());
        }

        let subscribed = self
            .bridge
            .run_blocking(async move { transport.subscribe().await })
            .and_then(|frames| frames);
        match subscribed {
            Ok(frames) => {
                self.pipeline.start(&self.bridge, frames, parser)?;
                info!("Receiving telemetry");
                Ok(())
            }
            Err(e) => {
                self.pipeline.unregister();
                error!("Failed to subscribe to telemetry: {}", e);
                Err(e)
            }
        }
    }

    /// Stop delivery and drop the handler. The connection stays open.
    pub fn stop_receiving(&self) -> Result<()> {
        let _guard = self.begin("stop_receiving")?;

        let transport = self.inner().transport();
        self.pipeline.stop();
        self.pipeline.unregister();

        if let Ok(transport) = transport {
            if transport.is_connected() {
                self.bridge
                    .run_blocking(async move { transport.unsubscribe().await })??;
            }
        }
        info!("Stopped receiving telemetry");
        Ok(())
    }

    /// Write a command to the device
    pub fn send(&self, command: &Command) -> Result<()> {
        let transport = {
            let inner = self.inner();
            if !inner.state.is_connected() {
                return Err(BridgeError::NotConnected);
            }
            inner.transport()?
        };

        let payload = command.as_bytes().to_vec();
        self.bridge
            .run_blocking(async move { transport.write(&payload).await })?
            .map_err(|e| {
                warn!("Write of {} failed: {}", hex_dump(command.as_bytes()), e);
                e
            })?;
        debug!("Sent {}", hex_dump(command.as_bytes()));
        Ok(())
    }

    /// Tear down the live connection. Succeeds without effect when there is
    /// none.
    pub fn disconnect(&self) -> Result<()> {
        let _guard = self.begin("disconnect")?;
        self.disconnect_locked()
    }

    fn disconnect_locked(&self) -> Result<()> {
        let transport = {
            let inner = self.inner();
            if !inner.state.is_connected() {
                debug!("Disconnect while {}; nothing to do", inner.state);
                return Ok(());
            }
            inner.transport()?
        };

        self.pipeline.stop();
        self.pipeline.unregister();

        let outcome = self.bridge.run_blocking(async move {
            if let Err(e) = transport.unsubscribe().await {
                warn!("Failed to stop notifications: {}", e);
            }
            transport.disconnect().await
        });

        let address = {
            let mut inner = self.inner();
            inner.transition(SessionState::Disconnected);
            inner.address.take()
        };

        match outcome.and_then(|result| result) {
            Ok(()) => {
                info!("Disconnected from {}", address.unwrap_or_default());
                Ok(())
            }
            Err(e) => {
                warn!("Disconnect reported an error: {}", e);
                Err(e)
            }
        }
    }

    /// Release everything. Idempotent; a later `init` starts over.
    ///
    /// Fails with `Busy` while another lifecycle operation runs, in which
    /// case nothing has been released.
    pub fn cleanup(&self) -> Result<()> {
        let _guard = self.begin("cleanup")?;

        if self.state() == SessionState::Uninitialized && !self.bridge.is_running() {
            return Ok(());
        }

        if let Err(e) = self.disconnect_locked() {
            warn!("Ignoring disconnect error during cleanup: {}", e);
        }
        self.pipeline.stop();
        self.pipeline.unregister();

        {
            let mut inner = self.inner();
            inner.collaborators = None;
            inner.address = None;
            inner.transition(SessionState::Uninitialized);
        }
        self.bridge.shutdown();
        info!("Session cleaned up");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Exclusive access; cannot be busy
        let _ = self.cleanup();
        SESSION_LIVE.store(false, Ordering::Release);
    }
}
