use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{appointment::AppointmentId, notifications::NotificationRequest};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub title: String,
    pub body: String,
    pub appointment_id: AppointmentId,
    pub scheduled_for: NaiveDateTime,
    pub is_read: bool,
    pub created_at: NaiveDateTime,
}

impl NotificationRecord {
    pub fn for_reminder(
        appointment_id: &AppointmentId,
        request: &NotificationRequest,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            id: record_id(appointment_id),
            title: request.title.clone(),
            body: request.body.clone(),
            appointment_id: appointment_id.clone(),
            scheduled_for: request.scheduled_for,
            is_read: false,
            created_at,
        }
    }
}

pub fn record_id(appointment_id: &AppointmentId) -> String {
    format!("notif_{appointment_id}")
}

/// In-app list of reminders backing the notifications screen.
#[derive(Debug, Default)]
pub struct NotificationInbox {
    records: RwLock<Vec<NotificationRecord>>,
}

impl NotificationInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record`, replacing any record with the same id.
    pub fn record(&self, record: NotificationRecord) {
        let mut records = self.records.write();
        records.retain(|existing| existing.id != record.id);
        records.push(record);
    }

    pub fn remove_for(&self, appointment_id: &AppointmentId) -> bool {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|existing| &existing.appointment_id != appointment_id);
        records.len() != before
    }

    /// Drops records for `appointment_id` that have not been delivered yet.
    /// Records scheduled at or before `now` stay as history.
    pub fn remove_pending_for(&self, appointment_id: &AppointmentId, now: NaiveDateTime) -> bool {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|existing| {
            &existing.appointment_id != appointment_id || existing.scheduled_for <= now
        });
        records.len() != before
    }

    pub fn mark_read(&self, id: &str) -> bool {
        let mut records = self.records.write();
        match records.iter_mut().find(|record| record.id == id) {
            Some(record) => {
                record.is_read = true;
                true
            }
            None => false,
        }
    }

    pub fn unread_count(&self) -> usize {
        self.records.read().iter().filter(|r| !r.is_read).count()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        let mut records = self.records.read().clone();
        records.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }
}
