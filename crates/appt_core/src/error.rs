use std::path::PathBuf;

use thiserror::Error;

use crate::appointment::AppointmentId;
use crate::notifications::SinkError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReminderError {
    #[error("reminder lead time must be non-negative, got {0} minutes")]
    InvalidLeadTime(i64),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("unable to access settings at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings document at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ReminderError),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("appointment `{0}` not found")]
    NotFound(AppointmentId),
    #[error(transparent)]
    Reminder(#[from] ReminderError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
