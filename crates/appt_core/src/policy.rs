use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::ReminderError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Decision {
    Schedule(NaiveDateTime),
    TooLate,
}

impl Decision {
    pub fn fire_at(&self) -> Option<NaiveDateTime> {
        match self {
            Decision::Schedule(at) => Some(*at),
            Decision::TooLate => None,
        }
    }
}

pub fn validate_lead_minutes(lead_minutes: i64) -> Result<(), ReminderError> {
    if lead_minutes < 0 {
        return Err(ReminderError::InvalidLeadTime(lead_minutes));
    }
    Ok(())
}

/// Decides when a reminder for an appointment at `appointment_instant` should fire.
///
/// The reminder is scheduled only when at least one whole second separates `now`
/// from the fire point; fractional seconds are floored so a reminder never fires early.
pub fn decide(
    appointment_instant: NaiveDateTime,
    lead_minutes: i64,
    now: NaiveDateTime,
) -> Result<Decision, ReminderError> {
    validate_lead_minutes(lead_minutes)?;

    // A lead so long that the fire point is unrepresentable lies before any `now`.
    let Some(fire_at) = Duration::try_minutes(lead_minutes)
        .and_then(|lead| appointment_instant.checked_sub_signed(lead))
    else {
        return Ok(Decision::TooLate);
    };

    if floor_seconds(fire_at - now) > 0 {
        Ok(Decision::Schedule(fire_at))
    } else {
        Ok(Decision::TooLate)
    }
}

fn floor_seconds(delta: Duration) -> i64 {
    let truncated = delta.num_seconds();
    if Duration::seconds(truncated) > delta {
        truncated - 1
    } else {
        truncated
    }
}
