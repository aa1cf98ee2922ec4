//! Turns named device commands into payloads and sends them through the
//! session.

use crate::domain::models::{hex_dump, CommandIntent};
use crate::session::manager::Session;
use crate::Result;
use tracing::{debug, warn};

pub struct CommandDispatcher<'a> {
    session: &'a Session,
}

impl<'a> CommandDispatcher<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Build the payload for `intent` and write it to the device.
    ///
    /// An invalid parameter is rejected before anything is written.
    pub fn dispatch(&self, intent: CommandIntent) -> Result<()> {
        let builder = self.session.command_builder()?;
        let command = builder.build(&intent).map_err(|e| {
            warn!("Cannot build {} command: {}", intent.name(), e);
            e
        })?;

        debug!("Dispatching {}: {}", intent.name(), hex_dump(command.as_bytes()));
        self.session.send(&command)
    }

    pub fn zeroing(&self) -> Result<()> {
        self.dispatch(CommandIntent::Zeroing)
    }

    pub fn calibration(&self) -> Result<()> {
        self.dispatch(CommandIntent::Calibration)
    }

    pub fn save_settings(&self) -> Result<()> {
        self.dispatch(CommandIntent::SaveSettings)
    }

    pub fn factory_reset(&self) -> Result<()> {
        self.dispatch(CommandIntent::FactoryReset)
    }

    pub fn sleep(&self) -> Result<()> {
        self.dispatch(CommandIntent::Sleep)
    }

    pub fn wakeup(&self) -> Result<()> {
        self.dispatch(CommandIntent::Wakeup)
    }

    pub fn set_return_rate(&self, rate_hz: i32) -> Result<()> {
        self.dispatch(CommandIntent::SetReturnRate(rate_hz))
    }

    pub fn set_accel_enabled(&self, enabled: bool) -> Result<()> {
        self.dispatch(CommandIntent::SetAccelEnabled(enabled))
    }

    pub fn set_gyro_enabled(&self, enabled: bool) -> Result<()> {
        self.dispatch(CommandIntent::SetGyroEnabled(enabled))
    }
}
