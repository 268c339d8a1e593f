use crate::domain::imu::DEFAULT_GRAVITY_ALPHA;
use crate::domain::models::{self, SamplingRate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

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
    "motion_peripheral".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// GATT identity and notification pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralSettings {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_true")]
    pub include_device_name: bool,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_accel_uuid")]
    pub accel_char_uuid: Uuid,
    #[serde(default = "default_gyro_uuid")]
    pub gyro_char_uuid: Uuid,
    #[serde(default = "default_notify_interval_ms")]
    pub notify_interval_ms: u64,
}

impl Default for PeripheralSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            include_device_name: default_true(),
            service_uuid: default_service_uuid(),
            accel_char_uuid: default_accel_uuid(),
            gyro_char_uuid: default_gyro_uuid(),
            notify_interval_ms: default_notify_interval_ms(),
        }
    }
}

fn default_device_name() -> String {
    "MotionV".to_string()
}
fn default_service_uuid() -> Uuid {
    models::MOTION_SERVICE_UUID
}
fn default_accel_uuid() -> Uuid {
    models::ACCEL_CHAR_UUID
}
fn default_gyro_uuid() -> Uuid {
    models::GYRO_CHAR_UUID
}
fn default_notify_interval_ms() -> u64 {
    models::DEFAULT_NOTIFY_INTERVAL_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSettings {
    #[serde(default)]
    pub rate: SamplingRate,
    #[serde(default = "default_gravity_alpha")]
    pub gravity_filter_alpha: f32,
    /// Feed the sampler from the built-in simulated IMU. There is no hardware
    /// driver for desktop hosts, so `false` makes startup fail.
    #[serde(default = "default_true")]
    pub simulated: bool,
}

impl SensorSettings {
    /// Filter alpha, falling back to the default when outside `[0, 1)`.
    pub fn gravity_alpha(&self) -> f32 {
        let alpha = self.gravity_filter_alpha;
        if (0.0..1.0).contains(&alpha) {
            alpha
        } else {
            tracing::warn!(
                "Invalid gravity filter alpha {}, using {}",
                alpha,
                DEFAULT_GRAVITY_ALPHA
            );
            DEFAULT_GRAVITY_ALPHA
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            rate: SamplingRate::default(),
            gravity_filter_alpha: default_gravity_alpha(),
            simulated: default_true(),
        }
    }
}

fn default_gravity_alpha() -> f32 {
    DEFAULT_GRAVITY_ALPHA
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub peripheral: PeripheralSettings,
    #[serde(default)]
    pub sensors: SensorSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Loads settings from the per-user config directory.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Loads settings from an explicit file, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
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
        path.push("MotionPeripheral");
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

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
