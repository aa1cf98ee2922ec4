//! BLE Scanner Module
//!
//! Timed Bluetooth LE advertisement scan.

use crate::domain::models::DeviceDescriptor;
use crate::error::BridgeError;
use crate::infrastructure::bluetooth::protocol;
use crate::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// BLE Scanner collecting advertisements for a fixed period
pub struct BleScanner {
    /// Only report devices advertising this service (None = all devices)
    service_filter: Option<GUID>,
}

impl BleScanner {
    pub fn new(service_uuid: Option<&str>) -> Result<Self> {
        let service_filter = service_uuid
            .map(protocol::parse_uuid)
            .transpose()?
            .map(GUID::from_u128);
        Ok(Self { service_filter })
    }

    /// Scan for `timeout`, returning devices in the order first seen
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        info!("Starting BLE scan for {:?}", timeout);

        let found: Arc<Mutex<Vec<DeviceDescriptor>>> = Arc::new(Mutex::new(Vec::new()));
        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(BridgeError::scan)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(BridgeError::scan)?;

        let sink = found.clone();
        let service_filter = self.service_filter;
        // The handler is dropped before awaiting; the watcher keeps its own reference
        let token = {
            let handler = TypedEventHandler::new(
                move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                      args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let adv = args.Advertisement()?;

                        if let Some(target) = service_filter {
                            let service_uuids = adv.ServiceUuids()?;
                            let mut matched = false;
                            for i in 0..service_uuids.Size()? {
                                if service_uuids.GetAt(i)? == target {
                                    matched = true;
                                    break;
                                }
                            }
                            if !matched {
                                return Ok(());
                            }
                        }

                        let name = adv.LocalName()?.to_string();
                        let address = protocol::format_address(args.BluetoothAddress()?);

                        if let Ok(mut devices) = sink.lock() {
                            match devices.iter_mut().find(|d| d.address == address) {
                                // Scan responses often carry the name the first advertisement lacked
                                Some(known) if known.name == "Unknown" && !name.is_empty() => {
                                    known.name = name;
                                }
                                Some(_) => {}
                                None => {
                                    debug!("Discovered {} ({})", name, address);
                                    devices.push(DeviceDescriptor {
                                        name: if name.is_empty() {
                                            "Unknown".to_string()
                                        } else {
                                            name
                                        },
                                        address,
                                    });
                                }
                            }
                        }
                    }
                    Ok(())
                },
            );
            watcher.Received(&handler).map_err(BridgeError::scan)?
        };
        watcher.Start().map_err(BridgeError::scan)?;

        tokio::time::sleep(timeout).await;

        let _ = watcher.Stop();
        let _ = watcher.RemoveReceived(token);

        let devices = found
            .lock()
            .map_err(|_| BridgeError::Scan("Lock error".to_string()))?
            .clone();
        info!("Scan finished, {} device(s) found", devices.len());
        Ok(devices)
    }
}
