use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppointmentId(String);

impl AppointmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppointmentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    #[default]
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    /// Only pending and confirmed appointments may hold a reminder.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentCategory {
    #[default]
    Medical,
    Dental,
    Therapy,
    Consultation,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: AppointmentId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub date: NaiveDate,
    #[serde(with = "hour_minute")]
    pub time: NaiveTime,
    #[serde(default = "default_duration")]
    pub duration_minutes: u32,
    #[serde(default)]
    pub status: AppointmentStatus,
    #[serde(default)]
    pub category: AppointmentCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Appointment {
    pub fn new(
        id: impl Into<AppointmentId>,
        title: impl Into<String>,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            date,
            time,
            duration_minutes: default_duration(),
            status: AppointmentStatus::default(),
            category: AppointmentCategory::default(),
            doctor: None,
            location: None,
            notes: None,
        }
    }

    pub fn with_doctor(mut self, doctor: impl Into<String>) -> Self {
        self.doctor = Some(doctor.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Local wall-clock instant of the appointment. Seconds are always zero.
    pub fn appointment_instant(&self) -> NaiveDateTime {
        let time = NaiveTime::from_hms_opt(self.time.hour(), self.time.minute(), 0)
            .unwrap_or(self.time);
        self.date.and_time(time)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    fn apply(&mut self, update: AppointmentUpdate) -> bool {
        let before = self.appointment_instant();
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(date) = update.date {
            self.date = date;
        }
        if let Some(time) = update.time {
            self.time = time;
        }
        if let Some(duration) = update.duration_minutes {
            self.duration_minutes = duration;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(category) = update.category {
            self.category = category;
        }
        if let Some(doctor) = update.doctor {
            self.doctor = doctor;
        }
        if let Some(location) = update.location {
            self.location = location;
        }
        if let Some(notes) = update.notes {
            self.notes = notes;
        }
        before != self.appointment_instant()
    }
}

fn default_duration() -> u32 {
    30
}

/// Fields supplied by the booking form; the id is assigned on creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub date: NaiveDate,
    #[serde(with = "hour_minute")]
    pub time: NaiveTime,
    #[serde(default = "default_duration")]
    pub duration_minutes: u32,
    #[serde(default)]
    pub category: AppointmentCategory,
    #[serde(default)]
    pub doctor: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl AppointmentDraft {
    pub fn new(title: impl Into<String>, date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            date,
            time,
            duration_minutes: default_duration(),
            category: AppointmentCategory::default(),
            doctor: None,
            location: None,
            notes: None,
        }
    }

    pub fn into_appointment(self, id: AppointmentId) -> Appointment {
        Appointment {
            id,
            title: self.title,
            description: self.description,
            date: self.date,
            time: self.time,
            duration_minutes: self.duration_minutes,
            status: AppointmentStatus::Pending,
            category: self.category,
            doctor: self.doctor,
            location: self.location,
            notes: self.notes,
        }
    }
}

/// Partial edit. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    pub status: Option<AppointmentStatus>,
    pub category: Option<AppointmentCategory>,
    pub doctor: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

impl AppointmentUpdate {
    pub fn reschedule(date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            date: Some(date),
            time: Some(time),
            ..Self::default()
        }
    }

    pub fn status(status: AppointmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Applies the edit, returning whether the appointment instant moved.
    pub fn apply_to(self, appointment: &mut Appointment) -> bool {
        appointment.apply(self)
    }
}

mod hour_minute {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
            .map_err(de::Error::custom)
    }
}
