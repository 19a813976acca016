use std::collections::HashMap;

use parking_lot::RwLock;

use crate::appointment::{Appointment, AppointmentId};

/// Persistence for the user's appointment list, owned by the surrounding app.
pub trait AppointmentStore: Send + Sync {
    fn get(&self, id: &AppointmentId) -> Option<Appointment>;
    fn list(&self) -> Vec<Appointment>;
    fn upsert(&self, appointment: Appointment);
    fn remove(&self, id: &AppointmentId) -> Option<Appointment>;
}

#[derive(Debug, Default)]
pub struct InMemoryAppointmentStore {
    appointments: RwLock<HashMap<AppointmentId, Appointment>>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_appointments(appointments: impl IntoIterator<Item = Appointment>) -> Self {
        let store = Self::new();
        for appointment in appointments {
            store.upsert(appointment);
        }
        store
    }
}

impl AppointmentStore for InMemoryAppointmentStore {
    fn get(&self, id: &AppointmentId) -> Option<Appointment> {
        self.appointments.read().get(id).cloned()
    }

    /// Appointments ordered by date and time.
    fn list(&self) -> Vec<Appointment> {
        let mut entries: Vec<Appointment> = self.appointments.read().values().cloned().collect();
        entries.sort_by(|a, b| {
            a.appointment_instant()
                .cmp(&b.appointment_instant())
                .then_with(|| a.id.cmp(&b.id))
        });
        entries
    }

    fn upsert(&self, appointment: Appointment) {
        self.appointments
            .write()
            .insert(appointment.id.clone(), appointment);
    }

    fn remove(&self, id: &AppointmentId) -> Option<Appointment> {
        self.appointments.write().remove(id)
    }
}
