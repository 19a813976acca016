pub mod appointment;
pub mod clock;
pub mod error;
pub mod inbox;
pub mod notifications;
pub mod policy;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod store;

pub use crate::service::{AppointmentReceipt, AppointmentService, AppointmentServiceBuilder};
