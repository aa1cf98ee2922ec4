//! C FFI layer for the session bridge.
//!
//! Flat, process-wide API for C/C++ hosts. Every call returns a success
//! flag; failures are logged with the operation name and never unwind
//! into the caller.

use crate::domain::models::{Command, CommandIntent, SensorSample};
use crate::domain::settings::{LogSettings, SessionSettings, Settings, SettingsService};
use crate::error::BridgeError;
use crate::infrastructure::logging::{init_logger, LoggingGuard};
use crate::session::{SampleHandler, Session};
use crate::Result;
use std::ffi::{c_char, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Once};
use tracing::{error, info};

static SESSION: Mutex<Option<Arc<Session>>> = Mutex::new(None);

static LOGGING: Once = Once::new();
static LOG_GUARD: Mutex<Option<LoggingGuard>> = Mutex::new(None);

/// Discovered device in C-compatible layout.
#[repr(C)]
pub struct Wt9011DeviceInfo {
    /// Null-terminated advertised name.
    pub name: [c_char; 64],
    /// Null-terminated `AA:BB:CC:DD:EE:FF` address.
    pub address: [c_char; 32],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wt9011Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wt9011Angles {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// One sample: accel (g), gyro (°/s), angle (°).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wt9011SensorData {
    pub accel: Wt9011Vec3,
    pub gyro: Wt9011Vec3,
    pub angle: Wt9011Angles,
}

impl From<&SensorSample> for Wt9011SensorData {
    fn from(sample: &SensorSample) -> Self {
        Self {
            accel: Wt9011Vec3 {
                x: sample.accel.x,
                y: sample.accel.y,
                z: sample.accel.z,
            },
            gyro: Wt9011Vec3 {
                x: sample.gyro.x,
                y: sample.gyro.y,
                z: sample.gyro.z,
            },
            angle: Wt9011Angles {
                roll: sample.angle.roll,
                pitch: sample.angle.pitch,
                yaw: sample.angle.yaw,
            },
        }
    }
}

/// Invoked on an executor thread for every sample.
pub type Wt9011DataCallback = extern "C" fn(data: *const Wt9011SensorData);

struct CallbackHandler(Wt9011DataCallback);

impl SampleHandler for CallbackHandler {
    fn on_sample(&self, sample: &SensorSample) {
        let data = Wt9011SensorData::from(sample);
        (self.0)(&data);
    }
}

fn str_to_fixed<const N: usize>(s: &str) -> [c_char; N] {
    let mut buf = [0 as c_char; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N - 1);
    for (i, &b) in bytes[..len].iter().enumerate() {
        buf[i] = b as c_char;
    }
    buf
}

fn init_logging(settings: &LogSettings) {
    LOGGING.call_once(|| match init_logger(settings) {
        Ok(guard) => {
            if let Ok(mut slot) = LOG_GUARD.lock() {
                *slot = Some(guard);
            }
        }
        // The host already installed a subscriber; log through it
        Err(_) => {}
    });
}

fn load_settings() -> Settings {
    SettingsService::new()
        .map(|service| service.get().clone())
        .unwrap_or_default()
}

fn current_session() -> Option<Arc<Session>> {
    SESSION.lock().ok().and_then(|slot| slot.clone())
}

/// Run `f` and turn its outcome into a flag, logging failures and panics.
fn guarded(operation: &str, f: impl FnOnce() -> Result<()>) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("wt9011_{} failed: {}", operation, e);
            false
        }
        Err(_) => {
            error!("wt9011_{} panicked", operation);
            false
        }
    }
}

fn with_session(operation: &str, f: impl FnOnce(&Session) -> Result<()>) -> bool {
    guarded(operation, || {
        let session = current_session().ok_or(BridgeError::NotInitialized)?;
        f(&session)
    })
}

fn dispatch(operation: &str, intent: CommandIntent) -> bool {
    with_session(operation, |session| session.commands().dispatch(intent))
}

/// Install a session built by `create` unless one exists, then init it.
fn init_session(
    settings: SessionSettings,
    create: impl FnOnce(SessionSettings) -> Result<Session>,
) -> Result<()> {
    let session = {
        let mut slot = SESSION
            .lock()
            .map_err(|_| BridgeError::Runtime("Lock error".to_string()))?;
        match slot.as_ref() {
            Some(session) => session.clone(),
            None => {
                let session = Arc::new(create(settings)?);
                *slot = Some(session.clone());
                session
            }
        }
    };
    session.init()
}

/// Create the process-wide session and load its collaborators.
#[no_mangle]
pub extern "C" fn wt9011_init() -> bool {
    guarded("init", || {
        let settings = load_settings();
        init_logging(&settings.log_settings);
        init_session(settings.session, Session::new)
    })
}

/// Scan for `timeout` seconds.
///
/// On entry `*count` is the capacity of `devices`; on return it holds the
/// number of entries written. Zero devices found is still success.
///
/// # Safety
/// `count` must be valid for reads and writes. `devices` must point to at
/// least `*count` `Wt9011DeviceInfo` elements, or be null.
#[no_mangle]
pub unsafe extern "C" fn wt9011_scan(
    devices: *mut Wt9011DeviceInfo,
    count: *mut c_int,
    timeout: f32,
) -> bool {
    if count.is_null() {
        error!("wt9011_scan failed: null count");
        return false;
    }
    let capacity = if devices.is_null() {
        0
    } else {
        (*count).max(0) as usize
    };

    let mut written = 0usize;
    let ok = with_session("scan", |session| {
        let found = session.scan(timeout, capacity)?;
        for (i, device) in found.iter().enumerate() {
            let info = Wt9011DeviceInfo {
                name: str_to_fixed(&device.name),
                address: str_to_fixed(&device.address),
            };
            unsafe { devices.add(i).write(info) };
        }
        written = found.len();
        Ok(())
    });
    *count = written as c_int;
    ok
}

/// Connect with retries. Blocks until connected or retries are exhausted.
///
/// # Safety
/// `address` must be a valid null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn wt9011_connect(address: *const c_char) -> bool {
    if address.is_null() {
        error!("wt9011_connect failed: null address");
        return false;
    }
    let address = match CStr::from_ptr(address).to_str() {
        Ok(address) => address.to_string(),
        Err(_) => {
            error!("wt9011_connect failed: address is not UTF-8");
            return false;
        }
    };

    let ok = with_session("connect", |session| session.connect(&address));
    if ok && cfg!(not(test)) {
        remember_address(&address);
    }
    ok
}

fn remember_address(address: &str) {
    let saved = SettingsService::new().and_then(|mut service| service.remember_address(address));
    if let Err(e) = saved {
        info!("Could not persist last address: {}", e);
    }
}

/// Register `callback` for every parsed sample. A second call replaces the
/// previous callback; null stops delivery.
#[no_mangle]
pub extern "C" fn wt9011_receive(callback: Option<Wt9011DataCallback>) -> bool {
    with_session("receive", |session| match callback {
        Some(callback) => session.start_receiving(Arc::new(CallbackHandler(callback))),
        None => session.stop_receiving(),
    })
}

/// Write a raw command payload.
///
/// # Safety
/// `command` must point to at least `length` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn wt9011_send(command: *const u8, length: c_int) -> bool {
    if command.is_null() || length <= 0 {
        error!("wt9011_send failed: empty command");
        return false;
    }
    let payload = Command::from(std::slice::from_raw_parts(command, length as usize));
    with_session("send", |session| session.send(&payload))
}

#[no_mangle]
pub extern "C" fn wt9011_disconnect() -> bool {
    with_session("disconnect", |session| session.disconnect())
}

#[no_mangle]
pub extern "C" fn wt9011_zeroing() -> bool {
    dispatch("zeroing", CommandIntent::Zeroing)
}

#[no_mangle]
pub extern "C" fn wt9011_calibration() -> bool {
    dispatch("calibration", CommandIntent::Calibration)
}

#[no_mangle]
pub extern "C" fn wt9011_save_settings() -> bool {
    dispatch("save_settings", CommandIntent::SaveSettings)
}

#[no_mangle]
pub extern "C" fn wt9011_factory_reset() -> bool {
    dispatch("factory_reset", CommandIntent::FactoryReset)
}

#[no_mangle]
pub extern "C" fn wt9011_sleep() -> bool {
    dispatch("sleep", CommandIntent::Sleep)
}

#[no_mangle]
pub extern "C" fn wt9011_wakeup() -> bool {
    dispatch("wakeup", CommandIntent::Wakeup)
}

#[no_mangle]
pub extern "C" fn wt9011_set_return_rate(rate_hz: c_int) -> bool {
    dispatch("set_return_rate", CommandIntent::SetReturnRate(rate_hz))
}

#[no_mangle]
pub extern "C" fn wt9011_accel_enable(enable: bool) -> bool {
    dispatch("accel_enable", CommandIntent::SetAccelEnabled(enable))
}

#[no_mangle]
pub extern "C" fn wt9011_gyro_enable(enable: bool) -> bool {
    dispatch("gyro_enable", CommandIntent::SetGyroEnabled(enable))
}

/// Tear everything down. Safe to call repeatedly; `wt9011_init` may follow.
///
/// While another call is in progress the session is left in place and the
/// failure is logged; call again once that call returns.
#[no_mangle]
pub extern "C" fn wt9011_cleanup() {
    let Some(session) = current_session() else {
        return;
    };
    if !guarded("cleanup", || session.cleanup()) {
        return;
    }
    if let Ok(mut slot) = SESSION.lock() {
        if slot.as_ref().map_or(false, |current| Arc::ptr_eq(current, &session)) {
            *slot = None;
        }
    }
    info!("Session released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Angles, DeviceDescriptor, Vec3};
    use crate::infrastructure::bluetooth::mock_transport::MockTransport;
    use crate::infrastructure::bluetooth::protocol::tests::frame;
    use crate::infrastructure::bluetooth::Collaborators;
    use serial_test::serial;
    use std::ffi::CString;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    static RECEIVED: AtomicUsize = AtomicUsize::new(0);
    static LAST_ACCEL_X_BITS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_samples(data: *const Wt9011SensorData) {
        if let Some(data) = unsafe { data.as_ref() } {
            LAST_ACCEL_X_BITS.store(data.accel.x.to_bits() as usize, Ordering::SeqCst);
            RECEIVED.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn init_with(mock: Arc<MockTransport>) -> bool {
        let settings = SessionSettings {
            scan_grace_ms: 50,
            connect_retry_delay_ms: 30,
            ..Default::default()
        };
        guarded("init", || {
            init_session(settings, |settings| {
                Session::with_loader(settings, move || {
                    Ok(Collaborators::wt9011(mock.clone()))
                })
            })
        })
    }

    fn devices(count: usize) -> Vec<DeviceDescriptor> {
        (0..count)
            .map(|i| {
                DeviceDescriptor::new(
                    format!("WT901BLE{:02}", i),
                    format!("00:00:00:00:00:{:02X}", i),
                )
            })
            .collect()
    }

    fn fixed_to_string(buf: &[c_char]) -> String {
        let bytes: Vec<u8> = buf.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_str_to_fixed_truncates_and_terminates() {
        let short: [c_char; 8] = str_to_fixed("WT901");
        assert_eq!(fixed_to_string(&short), "WT901");

        let long: [c_char; 8] = str_to_fixed("WT901BLE67");
        assert_eq!(fixed_to_string(&long), "WT901BL");
        assert_eq!(long[7], 0);
    }

    #[test]
    fn test_sensor_data_field_order() {
        let sample = SensorSample {
            accel: Vec3::new(1.0, 2.0, 3.0),
            gyro: Vec3::new(4.0, 5.0, 6.0),
            angle: Angles {
                roll: 7.0,
                pitch: 8.0,
                yaw: 9.0,
            },
        };
        let data = Wt9011SensorData::from(&sample);

        // Nine contiguous floats in accel, gyro, angle order
        assert_eq!(std::mem::size_of::<Wt9011SensorData>(), 9 * 4);
        let flat: [f32; 9] = unsafe { std::mem::transmute(data) };
        assert_eq!(flat, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    #[serial]
    fn test_calls_without_session_fail_cleanly() {
        wt9011_cleanup();

        assert!(!wt9011_disconnect());
        assert!(!wt9011_zeroing());
        assert!(!wt9011_receive(None));

        let mut count: c_int = 4;
        let ok = unsafe { wt9011_scan(std::ptr::null_mut(), &mut count, 0.1) };
        assert!(!ok);
        assert_eq!(count, 0);

        assert!(unsafe { !wt9011_connect(std::ptr::null()) });
        assert!(unsafe { !wt9011_send(std::ptr::null(), 4) });

        // Repeated cleanup is harmless
        wt9011_cleanup();
        wt9011_cleanup();
    }

    #[test]
    #[serial]
    fn test_full_session_through_c_api() {
        wt9011_cleanup();
        let mock = Arc::new(MockTransport::new().with_devices(devices(3)));
        assert!(init_with(mock.clone()));

        let mut found: [Wt9011DeviceInfo; 2] = unsafe { std::mem::zeroed() };
        let mut count: c_int = 2;
        assert!(unsafe { wt9011_scan(found.as_mut_ptr(), &mut count, 0.1) });
        assert_eq!(count, 2);
        assert_eq!(fixed_to_string(&found[0].name), "WT901BLE00");
        assert_eq!(fixed_to_string(&found[1].address), "00:00:00:00:00:01");

        let address = CString::new("00:00:00:00:00:01").unwrap();
        assert!(unsafe { wt9011_connect(address.as_ptr()) });
        assert_eq!(mock.connected_address().as_deref(), Some("00:00:00:00:00:01"));

        RECEIVED.store(0, Ordering::SeqCst);
        assert!(wt9011_receive(Some(count_samples)));
        assert!(mock.push_frame(frame([2048, 0, 0], [0; 3], [0; 3])));
        let deadline = Instant::now() + Duration::from_secs(2);
        while RECEIVED.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 1);
        assert_eq!(LAST_ACCEL_X_BITS.load(Ordering::SeqCst), 1.0f32.to_bits() as usize);

        assert!(wt9011_zeroing());
        assert!(!mock.written().is_empty());
        assert!(wt9011_receive(None));

        assert!(wt9011_disconnect());
        assert!(wt9011_disconnect());

        wt9011_cleanup();
        wt9011_cleanup();
        assert!(!wt9011_disconnect());
    }

    #[test]
    #[serial]
    fn test_cleanup_during_scan_keeps_session() {
        wt9011_cleanup();
        let mock = Arc::new(
            MockTransport::new()
                .with_devices(devices(1))
                .with_scan_delay(Duration::from_millis(400)),
        );
        assert!(init_with(mock));

        let scanner = std::thread::spawn(|| {
            let mut found: [Wt9011DeviceInfo; 1] = unsafe { std::mem::zeroed() };
            let mut count: c_int = 1;
            let ok = unsafe { wt9011_scan(found.as_mut_ptr(), &mut count, 1.0) };
            (ok, count)
        });
        std::thread::sleep(Duration::from_millis(100));

        wt9011_cleanup();
        assert_eq!(scanner.join().unwrap(), (true, 1));

        // Still installed, so a later call reaches it
        assert!(wt9011_disconnect());
        wt9011_cleanup();
        assert!(!wt9011_disconnect());
    }
}
