use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ReminderError, SettingsError},
    policy,
};

pub const DEFAULT_LEAD_MINUTES: i64 = 15;

/// Lead times offered by the settings screen.
pub const LEAD_MINUTE_CHOICES: [i64; 5] = [1, 5, 15, 30, 60];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderSetting {
    pub lead_minutes: i64,
    pub enabled: bool,
}

impl Default for ReminderSetting {
    fn default() -> Self {
        Self {
            lead_minutes: DEFAULT_LEAD_MINUTES,
            enabled: true,
        }
    }
}

impl ReminderSetting {
    pub fn validate(&self) -> Result<(), ReminderError> {
        policy::validate_lead_minutes(self.lead_minutes)
    }
}

/// Single authoritative source for the reminder setting. Read on every scheduling call.
pub trait SettingsStore: Send + Sync {
    fn reminder_setting(&self) -> Result<ReminderSetting, SettingsError>;
    fn save_reminder_setting(&self, setting: ReminderSetting) -> Result<(), SettingsError>;
}

#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    setting: Mutex<ReminderSetting>,
}

impl InMemorySettingsStore {
    pub fn new(setting: ReminderSetting) -> Self {
        Self {
            setting: Mutex::new(setting),
        }
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn reminder_setting(&self) -> Result<ReminderSetting, SettingsError> {
        Ok(*self.setting.lock())
    }

    fn save_reminder_setting(&self, setting: ReminderSetting) -> Result<(), SettingsError> {
        setting.validate()?;
        *self.setting.lock() = setting;
        Ok(())
    }
}

/// The notification settings document written by the settings screen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    #[serde(default = "enabled_by_default")]
    pub push_notifications: bool,
    #[serde(default = "enabled_by_default")]
    pub appointment_reminders: bool,
    #[serde(default = "default_reminder_time")]
    pub reminder_time: i64,
    #[serde(default)]
    pub weekly_digest: bool,
    #[serde(default)]
    pub marketing_notifications: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            push_notifications: true,
            appointment_reminders: true,
            reminder_time: DEFAULT_LEAD_MINUTES,
            weekly_digest: false,
            marketing_notifications: false,
        }
    }
}

impl NotificationPreferences {
    pub fn reminder_setting(&self) -> ReminderSetting {
        ReminderSetting {
            lead_minutes: self.reminder_time,
            enabled: self.push_notifications && self.appointment_reminders,
        }
    }

    pub fn apply(&mut self, setting: ReminderSetting) {
        self.reminder_time = setting.lead_minutes;
        self.appointment_reminders = setting.enabled;
        if setting.enabled {
            self.push_notifications = true;
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

fn default_reminder_time() -> i64 {
    DEFAULT_LEAD_MINUTES
}

/// Settings persisted as a JSON document on disk. A missing file yields defaults.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn preferences(&self) -> Result<NotificationPreferences, SettingsError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(NotificationPreferences::default())
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save_preferences(&self, prefs: &NotificationPreferences) -> Result<(), SettingsError> {
        prefs.reminder_setting().validate()?;
        let _guard = self.write_lock.lock();
        self.write(prefs)
    }

    fn write(&self, prefs: &NotificationPreferences) -> Result<(), SettingsError> {
        let io_err = |source: std::io::Error| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let payload = serde_json::to_string_pretty(prefs).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, payload).map_err(io_err)?;
        fs::rename(&staging, &self.path).map_err(io_err)?;
        tracing::debug!(path = %self.path.display(), "notification settings saved");
        Ok(())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn reminder_setting(&self) -> Result<ReminderSetting, SettingsError> {
        Ok(self.preferences()?.reminder_setting())
    }

    fn save_reminder_setting(&self, setting: ReminderSetting) -> Result<(), SettingsError> {
        setting.validate()?;
        let _guard = self.write_lock.lock();
        let mut prefs = self.preferences()?;
        prefs.apply(setting);
        self.write(&prefs)
    }
}
