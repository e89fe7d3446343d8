//! Validated value types shared by the report catalog and the scheduler.

mod email_address;

use thiserror::Error;

pub use self::email_address::EmailAddress;

/// A record that violates a write-time invariant. These never reach the
/// executor: storage refuses to persist them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("start date must be on or before the 28th of the month (got day {day})")]
    StartDateDay { day: u32 },

    #[error("parameter name '{name}' must start with a letter or '_' and contain only letters, digits or '_'")]
    ParameterName { name: String },

    #[error("parameter '{name}' has a default value and cannot also be required")]
    RequiredWithDefault { name: String },

    #[error("invalid email address '{value}': {reason}")]
    EmailAddress { value: String, reason: &'static str },

    #[error("invalid default expression '{expr}': {reason}")]
    DefaultExpr { expr: String, reason: String },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}
