use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use tracing::{info, instrument, warn};

use crate::{
    appointment::{
        Appointment, AppointmentDraft, AppointmentId, AppointmentStatus, AppointmentUpdate,
    },
    clock::{Clock, SystemClock},
    error::{ServiceError, ServiceResult},
    inbox::{NotificationInbox, NotificationRecord},
    notifications::{InMemorySink, NotificationRequest, NotificationSink, SinkHandle},
    scheduler::{reminder_request, NotificationScheduler, ScheduledReminder, SchedulingOutcome},
    settings::{InMemorySettingsStore, ReminderSetting, SettingsStore},
    store::{AppointmentStore, InMemoryAppointmentStore},
};

const TEST_NOTIFICATION_DELAY_SECS: i64 = 5;

/// Result of an appointment write. The write succeeded even when no reminder was scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentReceipt {
    pub appointment: Appointment,
    pub reminder: SchedulingOutcome,
}

pub struct AppointmentService {
    clock: Arc<dyn Clock>,
    settings: Arc<dyn SettingsStore>,
    appointments: Arc<dyn AppointmentStore>,
    scheduler: NotificationScheduler,
    inbox: NotificationInbox,
    sequence: AtomicU64,
}

pub struct AppointmentServiceBuilder {
    clock: Option<Arc<dyn Clock>>,
    settings: Option<Arc<dyn SettingsStore>>,
    appointments: Option<Arc<dyn AppointmentStore>>,
    notification_sink: Option<Arc<dyn NotificationSink>>,
}

impl AppointmentServiceBuilder {
    pub fn new() -> Self {
        Self {
            clock: None,
            settings: None,
            appointments: None,
            notification_sink: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_settings_store(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_appointment_store(mut self, appointments: Arc<dyn AppointmentStore>) -> Self {
        self.appointments = Some(appointments);
        self
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notification_sink = Some(sink);
        self
    }

    pub fn build(self) -> AppointmentService {
        let sink = self
            .notification_sink
            .unwrap_or_else(|| Arc::new(InMemorySink::new()));
        AppointmentService {
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            settings: self
                .settings
                .unwrap_or_else(|| Arc::new(InMemorySettingsStore::default())),
            appointments: self
                .appointments
                .unwrap_or_else(|| Arc::new(InMemoryAppointmentStore::new())),
            scheduler: NotificationScheduler::new(sink),
            inbox: NotificationInbox::new(),
            sequence: AtomicU64::new(0),
        }
    }
}

impl Default for AppointmentServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppointmentService {
    pub fn builder() -> AppointmentServiceBuilder {
        AppointmentServiceBuilder::new()
    }

    pub fn appointments(&self) -> Vec<Appointment> {
        self.appointments.list()
    }

    pub fn appointment(&self, id: &AppointmentId) -> ServiceResult<Appointment> {
        self.appointments
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(id.clone()))
    }

    #[instrument(skip(self, draft), fields(title = %draft.title))]
    pub fn create_appointment(&self, draft: AppointmentDraft) -> ServiceResult<AppointmentReceipt> {
        let setting = self.current_setting()?;
        let now = self.clock.now();
        let appointment = draft.into_appointment(self.next_id(now));
        self.appointments.upsert(appointment.clone());
        info!(appointment_id = %appointment.id, "appointment created");

        let reminder = self.plan_reminder(&appointment, &setting, now)?;
        Ok(AppointmentReceipt {
            appointment,
            reminder,
        })
    }

    #[instrument(skip(self, update))]
    pub fn update_appointment(
        &self,
        id: &AppointmentId,
        update: AppointmentUpdate,
    ) -> ServiceResult<AppointmentReceipt> {
        let setting = self.current_setting()?;
        let mut appointment = self.appointment(id)?;
        let moved = update.apply_to(&mut appointment);
        self.appointments.upsert(appointment.clone());
        info!(moved, status = ?appointment.status, "appointment updated");

        let reminder = self.plan_reminder(&appointment, &setting, self.clock.now())?;
        Ok(AppointmentReceipt {
            appointment,
            reminder,
        })
    }

    pub fn set_status(
        &self,
        id: &AppointmentId,
        status: AppointmentStatus,
    ) -> ServiceResult<AppointmentReceipt> {
        self.update_appointment(id, AppointmentUpdate::status(status))
    }

    #[instrument(skip(self))]
    pub fn delete_appointment(&self, id: &AppointmentId) -> ServiceResult<Appointment> {
        let removed = self
            .appointments
            .remove(id)
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        self.scheduler.cancel(id);
        self.inbox.remove_for(id);
        info!("appointment deleted");
        Ok(removed)
    }

    /// Persists `setting` and re-plans every appointment's reminder against it.
    #[instrument(skip(self))]
    pub fn update_settings(
        &self,
        setting: ReminderSetting,
    ) -> ServiceResult<Vec<(AppointmentId, SchedulingOutcome)>> {
        self.settings.save_reminder_setting(setting)?;
        self.replan_all()
    }

    /// Re-plans reminders for all stored appointments using the current settings.
    #[instrument(skip(self))]
    pub fn replan_all(&self) -> ServiceResult<Vec<(AppointmentId, SchedulingOutcome)>> {
        let setting = self.current_setting()?;
        let now = self.clock.now();
        let pruned = self.scheduler.prune_fired(now);
        if pruned > 0 {
            info!(pruned, "forgot reminders that already fired");
        }

        let mut outcomes = Vec::new();
        for appointment in self.appointments.list() {
            let outcome = self.plan_reminder(&appointment, &setting, now)?;
            outcomes.push((appointment.id, outcome));
        }
        Ok(outcomes)
    }

    /// Drops every scheduled reminder, as on sign-out.
    #[instrument(skip(self))]
    pub fn logout(&self) -> ServiceResult<()> {
        self.scheduler.cancel_all()?;
        self.inbox.clear();
        Ok(())
    }

    pub fn send_test_notification(&self) -> ServiceResult<SinkHandle> {
        let mut data = BTreeMap::new();
        data.insert("type".to_string(), "test".to_string());
        let request = NotificationRequest {
            title: "Test Notification".to_string(),
            body: "This is a test notification to check that reminders are delivered.".to_string(),
            data,
            scheduled_for: self.clock.now() + Duration::seconds(TEST_NOTIFICATION_DELAY_SECS),
        };
        Ok(self.scheduler.sink().schedule(request)?)
    }

    pub fn pending_reminders(&self) -> Vec<ScheduledReminder> {
        self.scheduler.pending()
    }

    pub fn pending_reminder(&self, id: &AppointmentId) -> Option<ScheduledReminder> {
        self.scheduler.pending_for(id)
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.inbox.records()
    }

    pub fn mark_notification_read(&self, id: &str) -> bool {
        self.inbox.mark_read(id)
    }

    pub fn unread_notifications(&self) -> usize {
        self.inbox.unread_count()
    }

    pub fn current_setting(&self) -> ServiceResult<ReminderSetting> {
        let setting = self.settings.reminder_setting()?;
        setting.validate()?;
        Ok(setting)
    }
}

impl AppointmentService {
    fn plan_reminder(
        &self,
        appointment: &Appointment,
        setting: &ReminderSetting,
        now: NaiveDateTime,
    ) -> ServiceResult<SchedulingOutcome> {
        let outcome = self.scheduler.schedule_or_replace(appointment, setting, now)?;
        match &outcome {
            SchedulingOutcome::Scheduled { fire_at, .. } => {
                let request = reminder_request(appointment, setting.lead_minutes, *fire_at);
                self.inbox.record(NotificationRecord::for_reminder(
                    &appointment.id,
                    &request,
                    now,
                ));
            }
            SchedulingOutcome::Failed(err) => {
                warn!(appointment_id = %appointment.id, %err, "appointment saved without reminder");
                self.inbox.remove_pending_for(&appointment.id, now);
            }
            SchedulingOutcome::NotScheduled(_) | SchedulingOutcome::Disabled => {
                self.inbox.remove_pending_for(&appointment.id, now);
            }
        }
        Ok(outcome)
    }

    fn next_id(&self, now: NaiveDateTime) -> AppointmentId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        AppointmentId::new(format!("{}-{sequence}", now.and_utc().timestamp_millis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::notifications::SinkError;
    use crate::scheduler::NotScheduledReason;
    use chrono::{NaiveDate, NaiveTime};

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn draft(hour: u32) -> AppointmentDraft {
        let mut draft = AppointmentDraft::new(
            "Checkup",
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
        );
        draft.doctor = Some("Dr. Ruiz".into());
        draft
    }

    struct Fixture {
        clock: Arc<FixedClock>,
        sink: Arc<InMemorySink>,
        settings: Arc<InMemorySettingsStore>,
        service: AppointmentService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(at(8, 0)));
        let sink = Arc::new(InMemorySink::new());
        let settings = Arc::new(InMemorySettingsStore::default());
        let service = AppointmentService::builder()
            .with_clock(clock.clone())
            .with_notification_sink(sink.clone())
            .with_settings_store(settings.clone())
            .build();
        Fixture {
            clock,
            sink,
            settings,
            service,
        }
    }

    #[test]
    fn create_schedules_reminder_and_inbox_record() {
        let fx = fixture();
        let receipt = fx.service.create_appointment(draft(9)).expect("create");
        assert_eq!(receipt.reminder.fire_at(), Some(at(8, 45)));
        assert_eq!(fx.sink.list_scheduled().len(), 1);

        let records = fx.service.notifications();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].appointment_id, receipt.appointment.id);
        assert!(records[0].body.contains("Dr. Ruiz"));
        assert_eq!(fx.service.unread_notifications(), 1);
    }

    #[test]
    fn delivered_reminder_stays_in_inbox_after_edit() {
        let fx = fixture();
        let receipt = fx.service.create_appointment(draft(9)).expect("create");
        fx.clock.set(at(8, 46));
        assert_eq!(fx.sink.fire_due(at(8, 46)).len(), 1);

        let update = AppointmentUpdate {
            notes: Some(Some("Bring the lab results".into())),
            ..AppointmentUpdate::default()
        };
        let edited = fx
            .service
            .update_appointment(&receipt.appointment.id, update)
            .expect("edit notes");
        assert_eq!(
            edited.reminder,
            SchedulingOutcome::NotScheduled(NotScheduledReason::LeadTimeElapsed)
        );
        fx.service.replan_all().expect("replan");

        let records = fx.service.notifications();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].scheduled_for, at(8, 45));
        assert_eq!(fx.service.unread_notifications(), 1);
    }

    #[test]
    fn disabling_drops_only_undelivered_records() {
        let fx = fixture();
        fx.service.create_appointment(draft(9)).expect("create");
        fx.clock.set(at(8, 50));
        fx.service.create_appointment(draft(11)).expect("create later");

        fx.service
            .update_settings(ReminderSetting {
                lead_minutes: 15,
                enabled: false,
            })
            .expect("disable");
        let records = fx.service.notifications();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].scheduled_for, at(8, 45));
    }

    #[test]
    fn sink_failure_does_not_block_the_write() {
        let fx = fixture();
        fx.sink.fail_schedules_with(Some(SinkError::PermissionDenied));
        let receipt = fx.service.create_appointment(draft(9)).expect("create");
        assert_eq!(
            receipt.reminder,
            SchedulingOutcome::Failed(SinkError::PermissionDenied)
        );
        assert!(fx.service.appointment(&receipt.appointment.id).is_ok());
        assert!(fx.service.notifications().is_empty());
    }

    #[test]
    fn late_booking_is_saved_with_too_late_outcome() {
        let fx = fixture();
        fx.clock.set(at(8, 50));
        let receipt = fx.service.create_appointment(draft(9)).expect("create");
        assert_eq!(
            receipt.reminder,
            SchedulingOutcome::NotScheduled(NotScheduledReason::LeadTimeElapsed)
        );
        assert_eq!(fx.service.appointments().len(), 1);
    }

    #[test]
    fn invalid_stored_setting_is_rejected_before_write() {
        let fx = fixture();
        let store = Arc::new(InvalidSettings);
        let service = AppointmentService::builder()
            .with_clock(fx.clock.clone())
            .with_notification_sink(fx.sink.clone())
            .with_settings_store(store)
            .build();
        let err = service.create_appointment(draft(9)).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Reminder(crate::error::ReminderError::InvalidLeadTime(-5))
        ));
        assert!(service.appointments().is_empty());
        assert!(fx.sink.list_scheduled().is_empty());
    }

    #[test]
    fn settings_change_replans_active_appointments() {
        let fx = fixture();
        let kept = fx.service.create_appointment(draft(9)).unwrap();
        let cancelled = fx.service.create_appointment(draft(11)).unwrap();
        fx.service
            .set_status(&cancelled.appointment.id, AppointmentStatus::Cancelled)
            .unwrap();

        let outcomes = fx
            .service
            .update_settings(ReminderSetting {
                lead_minutes: 30,
                enabled: true,
            })
            .expect("update settings");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(fx.settings.reminder_setting().unwrap().lead_minutes, 30);

        let pending = fx.service.pending_reminders();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].appointment_id, kept.appointment.id);
        assert_eq!(pending[0].fire_at, at(8, 30));
        assert_eq!(fx.sink.list_scheduled().len(), 1);
    }

    #[test]
    fn delete_cancels_reminder() {
        let fx = fixture();
        let receipt = fx.service.create_appointment(draft(9)).unwrap();
        fx.service
            .delete_appointment(&receipt.appointment.id)
            .expect("delete");
        assert!(fx.sink.list_scheduled().is_empty());
        assert!(fx.service.notifications().is_empty());
        assert!(matches!(
            fx.service.delete_appointment(&receipt.appointment.id),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn logout_clears_everything() {
        let fx = fixture();
        fx.service.create_appointment(draft(9)).unwrap();
        fx.service.create_appointment(draft(10)).unwrap();
        fx.service.logout().expect("logout");
        assert!(fx.sink.list_scheduled().is_empty());
        assert!(fx.service.pending_reminders().is_empty());
        assert_eq!(fx.service.unread_notifications(), 0);
    }

    #[test]
    fn test_notification_is_not_tracked() {
        let fx = fixture();
        fx.service.send_test_notification().expect("test notification");
        let listed = fx.sink.list_scheduled();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].request.scheduled_for,
            at(8, 0) + Duration::seconds(5)
        );
        assert!(fx.service.pending_reminders().is_empty());
    }

    struct InvalidSettings;

    impl SettingsStore for InvalidSettings {
        fn reminder_setting(&self) -> Result<ReminderSetting, crate::error::SettingsError> {
            Ok(ReminderSetting {
                lead_minutes: -5,
                enabled: true,
            })
        }

        fn save_reminder_setting(
            &self,
            _setting: ReminderSetting,
        ) -> Result<(), crate::error::SettingsError> {
            Ok(())
        }
    }
}
