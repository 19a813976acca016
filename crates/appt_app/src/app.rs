use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use appt_core::{
    appointment::{Appointment, AppointmentId},
    clock::{Clock, FixedClock, SystemClock},
    inbox::NotificationRecord,
    notifications::{InMemorySink, NotificationSink},
    scheduler::SchedulingOutcome,
    settings::{InMemorySettingsStore, JsonSettingsStore, SettingsStore},
    store::InMemoryAppointmentStore,
    AppointmentService,
};
use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

const APPOINTMENTS_FILE: &str = "appointments.json";
const SETTINGS_FILE: &str = "notificationSettings.json";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) appointments_file: Option<PathBuf>,
    pub(crate) settings_file: Option<PathBuf>,
    pub(crate) now: Option<NaiveDateTime>,
    pub(crate) reminder_minutes: Option<i64>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `lookup`; a value that is set but unusable is an error.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(dir) = lookup("APPT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("APPT_APPOINTMENTS_FILE") {
            config.appointments_file = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("APPT_SETTINGS_FILE") {
            config.settings_file = Some(PathBuf::from(path));
        }
        if let Some(now) = lookup("APPT_NOW") {
            config.now = Some(
                parse_local_instant(&now)
                    .with_context(|| format!("APPT_NOW `{now}` is not a local date-time"))?,
            );
        }
        if let Some(minutes) = lookup("APPT_REMINDER_MINUTES") {
            let value = minutes.trim().parse::<i64>().with_context(|| {
                format!("APPT_REMINDER_MINUTES `{minutes}` is not a whole number")
            })?;
            config.reminder_minutes = Some(value);
        }
        Ok(config)
    }

    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_reminder_minutes(mut self, minutes: i64) -> Self {
        self.reminder_minutes = Some(minutes);
        self
    }

    pub(crate) fn appointments_path(&self) -> PathBuf {
        self.appointments_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(APPOINTMENTS_FILE))
    }

    pub(crate) fn settings_path(&self) -> PathBuf {
        self.settings_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(SETTINGS_FILE))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            appointments_file: None,
            settings_file: None,
            now: None,
            reminder_minutes: None,
        }
    }
}

fn parse_local_instant(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .with_context(|| format!("unrecognised date-time `{raw}`"))
}

/// Dry-run plan: which reminders would be registered for the stored appointments.
#[derive(Debug, Clone)]
pub struct ReminderPlan {
    pub now: NaiveDateTime,
    pub entries: Vec<PlanEntry>,
    pub notifications: Vec<NotificationRecord>,
}

impl ReminderPlan {
    pub fn unread(&self) -> usize {
        self.notifications.iter().filter(|record| !record.is_read).count()
    }
}

#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub appointment: Appointment,
    pub outcome: SchedulingOutcome,
}

pub fn run(config: AppConfig) -> Result<()> {
    let plan = build_plan(&config)?;
    print!("{}", render_plan(&plan));
    Ok(())
}

pub fn build_plan(config: &AppConfig) -> Result<ReminderPlan> {
    info!(data_dir = %config.data_dir.display(), "planning reminders");
    let appointments = load_appointments(&config.appointments_path())?;
    let settings = load_settings(config)?;

    // One reading for the whole run, so the header matches the decisions.
    let now = config.now.unwrap_or_else(|| SystemClock.now());
    let sink = Arc::new(InMemorySink::new());
    let service = AppointmentService::builder()
        .with_clock(Arc::new(FixedClock::new(now)))
        .with_notification_sink(sink.clone())
        .with_settings_store(settings)
        .with_appointment_store(Arc::new(InMemoryAppointmentStore::with_appointments(
            appointments,
        )))
        .build();

    let outcomes = service
        .replan_all()
        .context("failed to plan appointment reminders")?;
    debug!(scheduled = sink.list_scheduled().len(), "plan complete");

    let entries = outcomes
        .into_iter()
        .map(|(id, outcome)| {
            let appointment = service.appointment(&id)?;
            Ok(PlanEntry {
                appointment,
                outcome,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ReminderPlan {
        now,
        entries,
        notifications: service.notifications(),
    })
}

pub fn render_plan(plan: &ReminderPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Reminder plan as of {}", plan.now.format("%Y-%m-%d %H:%M"));
    if plan.entries.is_empty() {
        let _ = writeln!(out, "  no appointments");
    }
    for entry in &plan.entries {
        let appointment = &entry.appointment;
        let status = match &entry.outcome {
            SchedulingOutcome::Scheduled { fire_at, .. } => {
                format!("reminder at {}", fire_at.format("%Y-%m-%d %H:%M"))
            }
            SchedulingOutcome::NotScheduled(reason) => format!("no reminder ({reason})"),
            SchedulingOutcome::Disabled => "no reminder (reminders disabled)".to_string(),
            SchedulingOutcome::Failed(err) => format!("no reminder (system error: {err})"),
        };
        let _ = writeln!(
            out,
            "  {} {} [{}] {}: {}",
            appointment.appointment_instant().format("%Y-%m-%d %H:%M"),
            appointment.title,
            appointment.id,
            status_label(appointment),
            status
        );
    }
    let _ = writeln!(out, "{} unread reminder(s)", plan.unread());
    out
}

fn status_label(appointment: &Appointment) -> &'static str {
    if appointment.is_active() {
        "active"
    } else {
        "inactive"
    }
}

fn load_appointments(path: &Path) -> Result<Vec<Appointment>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "no appointments file; nothing to plan");
            return Ok(Vec::new());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let appointments: Vec<Appointment> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse appointments in {}", path.display()))?;
    let mut seen: Vec<&AppointmentId> = Vec::new();
    for appointment in &appointments {
        anyhow::ensure!(
            !seen.contains(&&appointment.id),
            "duplicate appointment id `{}` in {}",
            appointment.id,
            path.display()
        );
        seen.push(&appointment.id);
    }
    info!(count = appointments.len(), "appointments loaded");
    Ok(appointments)
}

fn load_settings(config: &AppConfig) -> Result<Arc<dyn SettingsStore>> {
    let store = JsonSettingsStore::new(config.settings_path());
    let Some(minutes) = config.reminder_minutes else {
        return Ok(Arc::new(store));
    };
    let mut setting = store
        .reminder_setting()
        .with_context(|| format!("failed to read {}", store.path().display()))?;
    setting.lead_minutes = minutes;
    info!(lead_minutes = minutes, "overriding stored reminder lead time");
    Ok(Arc::new(InMemorySettingsStore::new(setting)))
}
