use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    appointment::{Appointment, AppointmentId},
    error::ReminderError,
    notifications::{NotificationRequest, NotificationSink, SinkError, SinkHandle},
    policy::{self, Decision},
    settings::ReminderSetting,
};

pub const REMINDER_TITLE: &str = "Appointment Reminder";
pub const REMINDER_KIND: &str = "appointment_reminder";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledReminder {
    pub appointment_id: AppointmentId,
    pub fire_at: NaiveDateTime,
    pub sink_handle: SinkHandle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotScheduledReason {
    LeadTimeElapsed,
    AppointmentInactive,
}

impl fmt::Display for NotScheduledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeadTimeElapsed => f.write_str("lead time already elapsed"),
            Self::AppointmentInactive => f.write_str("appointment is cancelled or completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingOutcome {
    Scheduled {
        fire_at: NaiveDateTime,
        handle: SinkHandle,
    },
    NotScheduled(NotScheduledReason),
    Disabled,
    Failed(SinkError),
}

impl SchedulingOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }

    pub fn fire_at(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Scheduled { fire_at, .. } => Some(*fire_at),
            _ => None,
        }
    }

    /// Text for the non-fatal warning shown after the appointment is saved.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Scheduled { .. } => None,
            Self::NotScheduled(NotScheduledReason::LeadTimeElapsed) => Some(
                "The appointment is too close to its start time; no reminder will fire.".into(),
            ),
            Self::NotScheduled(NotScheduledReason::AppointmentInactive) => None,
            Self::Disabled => Some("Reminders are turned off; no reminder will fire.".into()),
            Self::Failed(err) => Some(format!(
                "The reminder could not be scheduled because of a system error: {err}."
            )),
        }
    }
}

/// Keeps at most one pending platform notification per appointment.
pub struct NotificationScheduler {
    sink: Arc<dyn NotificationSink>,
    reminders: Mutex<HashMap<AppointmentId, ScheduledReminder>>,
    in_flight: Mutex<HashMap<AppointmentId, Arc<Mutex<()>>>>,
}

impl NotificationScheduler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            reminders: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }

    #[instrument(skip(self, appointment, setting), fields(appointment_id = %appointment.id))]
    pub fn schedule_or_replace(
        &self,
        appointment: &Appointment,
        setting: &ReminderSetting,
        now: NaiveDateTime,
    ) -> Result<SchedulingOutcome, ReminderError> {
        policy::validate_lead_minutes(setting.lead_minutes)?;

        self.serialized(&appointment.id, || {
            self.retract(&appointment.id, now);

            if !setting.enabled {
                debug!("reminders disabled");
                return Ok(SchedulingOutcome::Disabled);
            }
            if !appointment.is_active() {
                debug!(status = ?appointment.status, "appointment inactive");
                return Ok(SchedulingOutcome::NotScheduled(
                    NotScheduledReason::AppointmentInactive,
                ));
            }

            let instant = appointment.appointment_instant();
            let fire_at = match policy::decide(instant, setting.lead_minutes, now)? {
                Decision::Schedule(fire_at) => fire_at,
                Decision::TooLate => {
                    info!(
                        %instant,
                        lead_minutes = setting.lead_minutes,
                        %now,
                        "reminder window already elapsed"
                    );
                    return Ok(SchedulingOutcome::NotScheduled(
                        NotScheduledReason::LeadTimeElapsed,
                    ));
                }
            };

            let request = reminder_request(appointment, setting.lead_minutes, fire_at);
            // Held across the platform call so `cancel_all` sees the handle and its mapping together.
            let mut reminders = self.reminders.lock();
            match self.sink.schedule(request) {
                Ok(handle) => {
                    info!(%fire_at, %handle, "reminder scheduled");
                    reminders.insert(
                        appointment.id.clone(),
                        ScheduledReminder {
                            appointment_id: appointment.id.clone(),
                            fire_at,
                            sink_handle: handle.clone(),
                        },
                    );
                    Ok(SchedulingOutcome::Scheduled { fire_at, handle })
                }
                Err(err) => {
                    warn!(%err, %fire_at, "notification sink refused reminder");
                    Ok(SchedulingOutcome::Failed(err))
                }
            }
        })
    }

    /// Retracts the pending reminder for `appointment_id`, if any.
    #[instrument(skip(self))]
    pub fn cancel(&self, appointment_id: &AppointmentId) {
        self.serialized(appointment_id, || {
            let Some(existing) = self.reminders.lock().remove(appointment_id) else {
                return;
            };
            self.cancel_handle(&existing);
        })
    }

    /// Cancels every platform notification and forgets all mappings.
    ///
    /// Mappings are kept when the platform call fails so a later edit can still
    /// retract the individual reminders.
    #[instrument(skip(self))]
    pub fn cancel_all(&self) -> Result<(), SinkError> {
        let mut reminders = self.reminders.lock();
        self.sink.cancel_all()?;
        let cleared = reminders.len();
        reminders.clear();
        info!(cleared, "all reminders cancelled");
        Ok(())
    }

    /// Forgets reminders whose fire time has passed; the platform consumed them.
    pub fn prune_fired(&self, now: NaiveDateTime) -> usize {
        let mut reminders = self.reminders.lock();
        let before = reminders.len();
        reminders.retain(|_, reminder| reminder.fire_at > now);
        before - reminders.len()
    }

    pub fn pending_for(&self, appointment_id: &AppointmentId) -> Option<ScheduledReminder> {
        self.reminders.lock().get(appointment_id).cloned()
    }

    pub fn pending(&self) -> Vec<ScheduledReminder> {
        let mut pending: Vec<ScheduledReminder> =
            self.reminders.lock().values().cloned().collect();
        pending.sort_by(|a, b| {
            a.fire_at
                .cmp(&b.fire_at)
                .then_with(|| a.appointment_id.cmp(&b.appointment_id))
        });
        pending
    }

    fn retract(&self, appointment_id: &AppointmentId, now: NaiveDateTime) {
        let Some(existing) = self.reminders.lock().remove(appointment_id) else {
            return;
        };
        if existing.fire_at <= now {
            debug!(handle = %existing.sink_handle, "previous reminder already fired");
            return;
        }
        self.cancel_handle(&existing);
    }

    fn cancel_handle(&self, reminder: &ScheduledReminder) {
        match self.sink.cancel(&reminder.sink_handle) {
            Ok(()) => debug!(handle = %reminder.sink_handle, "reminder cancelled"),
            Err(err) => warn!(
                %err,
                appointment_id = %reminder.appointment_id,
                handle = %reminder.sink_handle,
                "failed to cancel reminder; treating it as already gone"
            ),
        }
    }

    fn serialized<T>(&self, appointment_id: &AppointmentId, op: impl FnOnce() -> T) -> T {
        let lock = self
            .in_flight
            .lock()
            .entry(appointment_id.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock();
            op()
        };
        let mut in_flight = self.in_flight.lock();
        // Only the map and this call hold the lock: nobody is queued behind us.
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(appointment_id);
        }
        drop(lock);
        drop(in_flight);
        result
    }
}

/// Builds the platform payload announcing `appointment`.
pub fn reminder_request(
    appointment: &Appointment,
    lead_minutes: i64,
    fire_at: NaiveDateTime,
) -> NotificationRequest {
    let mut body = match lead_minutes {
        0 => format!("Your appointment \"{}\" starts now.", appointment.title),
        1 => format!("Your appointment \"{}\" starts in 1 minute.", appointment.title),
        n => format!("Your appointment \"{}\" starts in {n} minutes.", appointment.title),
    };
    if let Some(doctor) = non_empty(appointment.doctor.as_deref()) {
        body.push_str(&format!(" Doctor: {doctor}."));
    }
    if let Some(location) = non_empty(appointment.location.as_deref()) {
        body.push_str(&format!(" Location: {location}."));
    }

    let mut data = BTreeMap::new();
    data.insert("appointmentId".to_string(), appointment.id.to_string());
    data.insert("type".to_string(), REMINDER_KIND.to_string());
    data.insert("appointmentTitle".to_string(), appointment.title.clone());
    data.insert(
        "appointmentTime".to_string(),
        appointment
            .appointment_instant()
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string(),
    );

    NotificationRequest {
        title: REMINDER_TITLE.to_string(),
        body,
        data,
        scheduled_for: fire_at,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
