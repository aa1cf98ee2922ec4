//! BLE Connection Module
//!
//! Opens the device, keeps the GATT session alive and locates the
//! characteristics used for telemetry and commands.

use crate::error::BridgeError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::FrameSender;
use crate::Result;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus, GattSession,
    GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

/// Characteristic selection for a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub service_uuid: Option<GUID>,
    pub notify_char_uuid: Option<GUID>,
    pub write_char_uuid: Option<GUID>,
}

impl ConnectionConfig {
    pub fn from_settings(settings: &crate::domain::settings::SessionSettings) -> Result<Self> {
        let parse = |uuid: &Option<String>| -> Result<Option<GUID>> {
            uuid.as_deref()
                .map(|s| protocol::parse_uuid(s).map(GUID::from_u128))
                .transpose()
        };
        Ok(Self {
            service_uuid: parse(&settings.service_uuid)?,
            notify_char_uuid: parse(&settings.notify_char_uuid)?,
            write_char_uuid: parse(&settings.write_char_uuid)?,
        })
    }
}

/// A connected device and the characteristics in use
#[derive(Clone)]
pub struct BleLink {
    pub device: BluetoothLEDevice,
    /// Kept so Windows maintains the connection between writes
    pub session: Option<GattSession>,
    pub notify_characteristic: GattCharacteristic,
    pub write_characteristic: GattCharacteristic,
}

fn has_property(props: GattCharacteristicProperties, flag: GattCharacteristicProperties) -> bool {
    props.0 & flag.0 != 0
}

impl BleLink {
    /// Connect to a device by Bluetooth address
    pub async fn open(address: u64, config: &ConnectionConfig) -> Result<Self> {
        info!("Connecting to Bluetooth device: {:#X}", address);

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(BridgeError::transport)?
            .await
            .map_err(BridgeError::transport)?;
        info!("Device opened: {:?}", device.Name().map(|n| n.to_string()));

        let session = match Self::create_gatt_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let (notify, write) = Self::find_characteristics(&device, config).await?;

        Ok(Self {
            device,
            session,
            notify_characteristic: notify,
            write_characteristic: write,
        })
    }

    async fn create_gatt_session(device: &BluetoothLEDevice) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    /// First notify characteristic and first writable characteristic,
    /// narrowed by any configured UUIDs
    async fn find_characteristics(
        device: &BluetoothLEDevice,
        config: &ConnectionConfig,
    ) -> Result<(GattCharacteristic, GattCharacteristic)> {
        let services_result = device
            .GetGattServicesAsync()
            .map_err(BridgeError::transport)?
            .await
            .map_err(BridgeError::transport)?;
        let status = services_result.Status().map_err(BridgeError::transport)?;
        if status != GattCommunicationStatus::Success {
            return Err(BridgeError::Transport(format!(
                "Failed to get GATT services: {:?}",
                status
            )));
        }

        let services = services_result.Services().map_err(BridgeError::transport)?;
        let mut notify = None;
        let mut write = None;

        for i in 0..services.Size().map_err(BridgeError::transport)? {
            let service = services.GetAt(i).map_err(BridgeError::transport)?;
            if let Some(wanted) = config.service_uuid {
                if service.Uuid().map_err(BridgeError::transport)? != wanted {
                    continue;
                }
            }

            let chars_result = service
                .GetCharacteristicsAsync()
                .map_err(BridgeError::transport)?
                .await
                .map_err(BridgeError::transport)?;
            if chars_result.Status().map_err(BridgeError::transport)?
                != GattCommunicationStatus::Success
            {
                debug!("Skipping service {} (characteristics unavailable)", i);
                continue;
            }

            let characteristics = chars_result
                .Characteristics()
                .map_err(BridgeError::transport)?;
            for j in 0..characteristics.Size().map_err(BridgeError::transport)? {
                let c = characteristics.GetAt(j).map_err(BridgeError::transport)?;
                let uuid = c.Uuid().map_err(BridgeError::transport)?;
                let props = c
                    .CharacteristicProperties()
                    .map_err(BridgeError::transport)?;

                if notify.is_none()
                    && config.notify_char_uuid.map_or(true, |u| u == uuid)
                    && has_property(props, GattCharacteristicProperties::Notify)
                {
                    info!("Found notify characteristic {:?}", uuid);
                    notify = Some(c.clone());
                }
                if write.is_none()
                    && config.write_char_uuid.map_or(true, |u| u == uuid)
                    && (has_property(props, GattCharacteristicProperties::Write)
                        || has_property(props, GattCharacteristicProperties::WriteWithoutResponse))
                {
                    info!("Found write characteristic {:?}", uuid);
                    write = Some(c);
                }
            }
        }

        let notify = notify
            .ok_or_else(|| BridgeError::Transport("Notify characteristic not found".to_string()))?;
        let write = write
            .ok_or_else(|| BridgeError::Transport("Write characteristic not found".to_string()))?;
        Ok((notify, write))
    }

    /// Forward every notification's bytes into `sink`. Returns the
    /// registration token.
    pub async fn enable_notifications(&self, sink: FrameSender) -> Result<i64> {
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&value)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;
                    let _ = sink.send(bytes);
                }
                Ok(())
            },
        );
        let token = self
            .notify_characteristic
            .ValueChanged(&handler)
            .map_err(BridgeError::transport)?;
        drop(handler);

        let status = self
            .notify_characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(BridgeError::transport)?
            .await
            .map_err(BridgeError::transport)?;

        if status != GattCommunicationStatus::Success {
            let _ = self.notify_characteristic.RemoveValueChanged(token);
            return Err(BridgeError::Transport(format!(
                "Notification subscription returned status: {:?}",
                status
            )));
        }

        info!("Notifications enabled");
        Ok(token)
    }

    pub async fn disable_notifications(&self, token: i64) -> Result<()> {
        let _ = self.notify_characteristic.RemoveValueChanged(token);
        let status = self
            .notify_characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )
            .map_err(BridgeError::transport)?
            .await
            .map_err(BridgeError::transport)?;
        if status != GattCommunicationStatus::Success {
            warn!("Disabling notifications returned status: {:?}", status);
        }
        Ok(())
    }

    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        let buffer = {
            let writer = DataWriter::new().map_err(BridgeError::transport)?;
            writer.WriteBytes(payload).map_err(BridgeError::transport)?;
            writer.DetachBuffer().map_err(BridgeError::transport)?
        };

        let status = self
            .write_characteristic
            .WriteValueAsync(&buffer)
            .map_err(BridgeError::transport)?
            .await
            .map_err(BridgeError::transport)?;
        if status != GattCommunicationStatus::Success {
            return Err(BridgeError::Transport(format!(
                "Write returned status: {:?}",
                status
            )));
        }
        Ok(())
    }

    pub fn close(&self) {
        if let Some(session) = &self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
    }

    pub fn is_connected(&self) -> bool {
        self.device
            .ConnectionStatus()
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }
}
