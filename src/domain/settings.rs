use crate::domain::retry::RetryPolicy;
use crate::domain::window::Channel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "wt9011_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Scan and connection behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: f32,
    #[serde(default = "default_scan_max_results")]
    pub scan_max_results: usize,
    /// Extra time granted to the transport beyond the scan timeout
    #[serde(default = "default_scan_grace_ms")]
    pub scan_grace_ms: u64,
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    // Advanced BLE Settings. When unset the first matching characteristic wins.
    #[serde(default)]
    pub service_uuid: Option<String>,
    #[serde(default)]
    pub notify_char_uuid: Option<String>,
    #[serde(default)]
    pub write_char_uuid: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scan_timeout_secs: default_scan_timeout_secs(),
            scan_max_results: default_scan_max_results(),
            scan_grace_ms: default_scan_grace_ms(),
            connect_max_attempts: default_connect_max_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            service_uuid: None,
            notify_char_uuid: None,
            write_char_uuid: None,
        }
    }
}

impl SessionSettings {
    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_max_attempts,
            Duration::from_millis(self.connect_retry_delay_ms),
        )
    }

    pub fn scan_grace(&self) -> Duration {
        Duration::from_millis(self.scan_grace_ms)
    }
}

fn default_scan_timeout_secs() -> f32 {
    5.0
}
fn default_scan_max_results() -> usize {
    100
}
fn default_scan_grace_ms() -> u64 {
    2000
}
fn default_connect_max_attempts() -> u32 {
    3
}
fn default_connect_retry_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowSettings {
    #[serde(default)]
    pub channel: Channel,
}

/// Headless monitor behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_stream_secs")]
    pub stream_secs: u64,
    /// Preferred device name substring when no address is given
    #[serde(default = "default_name_filter")]
    pub device_name_filter: String,
    #[serde(default)]
    pub return_rate_hz: Option<i32>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            stream_secs: default_stream_secs(),
            device_name_filter: default_name_filter(),
            return_rate_hz: None,
        }
    }
}

fn default_stream_secs() -> u64 {
    10
}
fn default_name_filter() -> String {
    "WT".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub window: WindowSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// Last address a connection succeeded with
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is
    /// missing or unreadable.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("WT9011Bridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_address.as_deref() != Some(address) {
            self.settings.last_connected_address = Some(address.to_string());
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "session": { "scan_timeout_secs": 2.5 }, "window": { "channel": "gyro" } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.session.scan_timeout_secs, 2.5);
        assert_eq!(settings.session.connect_max_attempts, 3);
        assert_eq!(settings.session.connect_retry_delay_ms, 2000);
        assert_eq!(settings.window.channel, Channel::Gyro);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_connect_retry_policy_from_settings() {
        let policy = SessionSettings::default().connect_retry();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_missing_file_uses_defaults_and_save_round_trips() {
        let path = std::env::temp_dir().join(format!(
            "wt9011_settings_{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        let mut service = SettingsService::from_path(path.clone());
        assert!(service.get().last_connected_address.is_none());

        service.remember_address("AA:BB:CC:DD:EE:FF").unwrap();
        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );

        let _ = fs::remove_file(&path);
    }
}
