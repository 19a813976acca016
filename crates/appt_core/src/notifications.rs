use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    pub scheduled_for: NaiveDateTime,
}

/// Identifier handed back by the platform for a scheduled notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkHandle(String);

impl SinkHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("notification permission denied")]
    PermissionDenied,
    #[error("platform notification quota exceeded")]
    QuotaExceeded,
    #[error("no scheduled notification with handle `{0}`")]
    UnknownHandle(SinkHandle),
    #[error("notification platform error: {0}")]
    Platform(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledNotification {
    pub handle: SinkHandle,
    pub request: NotificationRequest,
}

/// Platform-specific notification adapters will implement this trait.
pub trait NotificationSink: Send + Sync {
    fn schedule(&self, request: NotificationRequest) -> Result<SinkHandle, SinkError>;
    fn cancel(&self, handle: &SinkHandle) -> Result<(), SinkError>;
    fn cancel_all(&self) -> Result<(), SinkError>;
    /// Diagnostics only; scheduling decisions never consult this list.
    fn list_scheduled(&self) -> Vec<ScheduledNotification>;
}

/// Sink that keeps schedules in memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemorySink {
    state: Mutex<InMemorySinkState>,
}

#[derive(Debug, Default)]
struct InMemorySinkState {
    next_id: u64,
    scheduled: Vec<ScheduledNotification>,
    delivered: Vec<ScheduledNotification>,
    schedule_failure: Option<SinkError>,
    cancel_failure: Option<SinkError>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `schedule` call fails with `err` until cleared.
    pub fn fail_schedules_with(&self, err: Option<SinkError>) {
        self.state.lock().schedule_failure = err;
    }

    /// Every subsequent `cancel`/`cancel_all` call fails with `err` until cleared.
    pub fn fail_cancels_with(&self, err: Option<SinkError>) {
        self.state.lock().cancel_failure = err;
    }

    /// Delivers every notification due at or before `now`, as the OS would.
    pub fn fire_due(&self, now: NaiveDateTime) -> Vec<ScheduledNotification> {
        let mut state = self.state.lock();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
            .into_iter()
            .partition(|entry| entry.request.scheduled_for <= now);
        state.scheduled = pending;
        state.delivered.extend(due.iter().cloned());
        due
    }

    pub fn delivered(&self) -> Vec<ScheduledNotification> {
        self.state.lock().delivered.clone()
    }
}

impl NotificationSink for InMemorySink {
    fn schedule(&self, request: NotificationRequest) -> Result<SinkHandle, SinkError> {
        let mut state = self.state.lock();
        if let Some(err) = state.schedule_failure.clone() {
            return Err(err);
        }
        state.next_id += 1;
        let handle = SinkHandle::new(format!("local-{}", state.next_id));
        state.scheduled.push(ScheduledNotification {
            handle: handle.clone(),
            request,
        });
        Ok(handle)
    }

    fn cancel(&self, handle: &SinkHandle) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if let Some(err) = state.cancel_failure.clone() {
            return Err(err);
        }
        let before = state.scheduled.len();
        state.scheduled.retain(|entry| &entry.handle != handle);
        if state.scheduled.len() == before {
            return Err(SinkError::UnknownHandle(handle.clone()));
        }
        Ok(())
    }

    fn cancel_all(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if let Some(err) = state.cancel_failure.clone() {
            return Err(err);
        }
        state.scheduled.clear();
        Ok(())
    }

    fn list_scheduled(&self) -> Vec<ScheduledNotification> {
        let mut entries = self.state.lock().scheduled.clone();
        entries.sort_by(|a, b| a.request.scheduled_for.cmp(&b.request.scheduled_for));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn request(when: NaiveDateTime) -> NotificationRequest {
        NotificationRequest {
            title: "Appointment Reminder".into(),
            body: "body".into(),
            data: BTreeMap::new(),
            scheduled_for: when,
        }
    }

    #[test]
    fn cancelling_unknown_handle_reports_it() {
        let sink = InMemorySink::new();
        let handle = sink.schedule(request(at(8, 45))).expect("schedule");
        sink.cancel(&handle).expect("first cancel");
        assert_eq!(
            sink.cancel(&handle),
            Err(SinkError::UnknownHandle(handle.clone()))
        );
    }

    #[test]
    fn fire_due_moves_only_past_entries() {
        let sink = InMemorySink::new();
        sink.schedule(request(at(8, 45))).unwrap();
        sink.schedule(request(at(9, 45))).unwrap();

        let fired = sink.fire_due(at(9, 0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].request.scheduled_for, at(8, 45));
        assert_eq!(sink.list_scheduled().len(), 1);
        assert_eq!(sink.delivered().len(), 1);
    }

    #[test]
    fn injected_failures_surface_as_errors() {
        let sink = InMemorySink::new();
        sink.fail_schedules_with(Some(SinkError::PermissionDenied));
        assert_eq!(
            sink.schedule(request(at(8, 45))),
            Err(SinkError::PermissionDenied)
        );
        sink.fail_schedules_with(None);
        assert!(sink.schedule(request(at(8, 45))).is_ok());
    }
}
