//! Subscription scheduling: the recurrence rule, the per-subscription
//! executor, and the batch driver that walks every subscription.

pub mod engine;
pub mod executor;
pub mod history;
pub mod recurrence;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::domain::{EmailAddress, ValidationError};

pub use self::engine::{run_batch, run_scheduler_loop, BatchSummary};
pub use self::executor::{Executor, Outcome};

/// Last day of month a subscription may be anchored to. Every month has it.
pub const MAX_START_DAY: u32 = 28;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("subscription {id} not found")]
    NotFound { id: i64 },

    #[error("report {id} not found")]
    ReportNotFound { id: i64 },

    #[error("gave up after {waited:?} waiting for the lock on subscription {id}")]
    LockTimeout { id: i64, waited: Duration },

    #[error("lease on subscription {id} expired and was taken over")]
    LeaseLost { id: i64 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Delivery cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Recurrence::Daily => "Daily",
            Recurrence::Weekly => "Weekly",
            Recurrence::Monthly => "Monthly",
            Recurrence::Yearly => "Yearly",
        };
        f.write_str(s)
    }
}

impl FromStr for Recurrence {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            "monthly" => Ok(Recurrence::Monthly),
            "yearly" => Ok(Recurrence::Yearly),
            _ => Err(ValidationError::UnknownVariant {
                kind: "recurrence",
                value: s.to_string(),
            }),
        }
    }
}

/// A recurring delivery of one report to one recipient.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: i64,
    pub report_id: i64,
    pub recipient: EmailAddress,
    pub recurrence: Recurrence,
    pub time_of_day: NaiveTime,
    pub start_date: NaiveDate,
    pub last_scheduled_run: Option<NaiveDateTime>,
    pub last_run_succeeded: bool,
    /// Query string of parameter overrides; `None` means report defaults.
    pub report_parameters: Option<String>,
    pub email_subject: String,
    pub email_body_extra: String,
}

impl Subscription {
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        recurrence::should_fire(
            self.recurrence,
            self.time_of_day,
            self.start_date,
            self.last_scheduled_run,
            now,
        )
    }

    pub fn next_due(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        recurrence::next_due(
            self.recurrence,
            self.time_of_day,
            self.start_date,
            self.last_scheduled_run,
            after,
        )
    }
}

/// Fields supplied when creating a subscription.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub report_id: i64,
    pub recipient: EmailAddress,
    pub recurrence: Recurrence,
    pub time_of_day: NaiveTime,
    pub start_date: NaiveDate,
    pub report_parameters: Option<String>,
    pub email_subject: String,
    pub email_body_extra: String,
}

impl NewSubscription {
    pub fn validate(&self) -> Result<(), ValidationError> {
        // Later days do not exist in every month.
        let day = self.start_date.day();
        if day > MAX_START_DAY {
            return Err(ValidationError::StartDateDay { day });
        }
        Ok(())
    }
}
