use crate::domain::models::DeviceHandle;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
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
    "ble_led_panel".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// A device the user has authorized through the picker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<&KnownDevice> for DeviceHandle {
    fn from(known: &KnownDevice) -> Self {
        DeviceHandle::new(known.id.clone(), known.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub known_devices: Vec<KnownDevice>,
    #[serde(default)]
    pub last_connected_device: Option<String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_control_uuid")]
    pub ble_control_char_uuid: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            known_devices: Vec::new(),
            last_connected_device: None,
            auto_reconnect: default_true(),
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_control_char_uuid: default_control_uuid(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            command_queue_depth: default_command_queue_depth(),
        }
    }
}

fn default_service_uuid() -> String {
    "4fafc201-1fb5-459e-8fcc-c5c9c331914b".to_string()
}
fn default_control_uuid() -> String {
    "beb5483e-36e1-4688-b7f5-ea07361b26a8".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_command_queue_depth() -> usize {
    32
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load_from(settings_path: PathBuf) -> Self {
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
        path.push("BleLedPanel");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn known_device_handles(&self) -> Vec<DeviceHandle> {
        self.settings.known_devices.iter().map(Into::into).collect()
    }

    pub fn add_known_device(&mut self, device: &DeviceHandle) -> anyhow::Result<()> {
        let id = device.id.as_str();
        match self.settings.known_devices.iter_mut().find(|d| d.id == id) {
            Some(known) if known.name == device.name => return Ok(()),
            Some(known) => known.name = device.name.clone(),
            None => self.settings.known_devices.push(KnownDevice {
                id: id.to_string(),
                name: device.name.clone(),
            }),
        }
        self.save()
    }

    pub fn set_last_connected(&mut self, device: &DeviceHandle) -> anyhow::Result<()> {
        self.settings.last_connected_device = Some(device.id.to_string());
        self.save()
    }
}
