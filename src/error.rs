//! Error kinds for the detection-to-mission pipeline.
//!
//! Ingestion, queueing and planning failures are returned synchronously to
//! the caller as one of these enums so the API layer can branch on the kind.
//! Execution faults never surface as errors; they end a mission as `FAILED`
//! with an `AbortReason`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::mission::MissionState;
use crate::MissionKind;

/// Coarse taxonomy used for HTTP status codes and runner exit codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    ResourceBusy,
    Planning,
    Execution,
    Internal,
}

impl ErrorCategory {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::ResourceBusy => 409,
            Self::Planning => 422,
            Self::Execution | Self::Internal => 500,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation => 2,
            Self::Planning => 3,
            Self::Execution => 4,
            Self::ResourceBusy | Self::Internal => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("channel '{0}' is already registered")]
    DuplicateSite(String),

    #[error("site id '{0}' is already registered")]
    DuplicateSiteId(String),

    #[error("no site registered for '{0}'")]
    UnknownSource(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error(transparent)]
    Rejected(#[from] EnqueueError),

    #[error("cooldown store failure: {0:#}")]
    Storage(anyhow::Error),
}

impl IngestError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DuplicateSite(_)
            | Self::DuplicateSiteId(_)
            | Self::UnknownSource(_)
            | Self::MalformedEvent(_) => ErrorCategory::Validation,
            Self::Rejected(err) => err.category(),
            Self::Storage(_) => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable kind for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateSite(_) | Self::DuplicateSiteId(_) => "duplicate_site",
            Self::UnknownSource(_) => "unknown_source",
            Self::MalformedEvent(_) => "malformed_event",
            Self::Rejected(err) => err.kind(),
            Self::Storage(_) => "storage",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum EnqueueError {
    #[error("confidence {confidence} is below threshold {threshold}")]
    BelowThreshold { confidence: f64, threshold: f64 },

    #[error("mission queue is full ({depth} pending)")]
    QueueOverflow { depth: usize },

    #[error("site '{0}' is not registered")]
    UnknownSite(String),

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

impl EnqueueError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BelowThreshold { .. } | Self::UnknownSite(_) => ErrorCategory::Validation,
            Self::QueueOverflow { .. } | Self::ShuttingDown => ErrorCategory::ResourceBusy,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::BelowThreshold { .. } => "below_threshold",
            Self::QueueOverflow { .. } => "queue_full",
            Self::UnknownSite(_) => "unknown_source",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Planning is deterministic given the drone state, so none of these are
/// retried.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PlanningError {
    #[error("target is {distance_m:.0} m away, beyond usable range {range_m:.0} m")]
    OutOfRange { distance_m: f64, range_m: f64 },

    #[error("target or flight path enters no-fly zone '{zone}'")]
    NoFlyZone { zone: String },

    #[error("drone state unsafe for flight: {0}")]
    UnsafeState(String),
}

impl PlanningError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Planning
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "out_of_range",
            Self::NoFlyZone { .. } => "no_fly_zone",
            Self::UnsafeState(_) => "unsafe_state",
        }
    }
}

/// Why a mission ended `FAILED`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Battery,
    Gps,
    Link,
    Timeout,
    Operator,
    Actuator,
    Storage,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Battery => "battery",
            Self::Gps => "gps",
            Self::Link => "link",
            Self::Timeout => "timeout",
            Self::Operator => "operator",
            Self::Actuator => "actuator",
            Self::Storage => "storage",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("illegal {kind} mission transition {from} -> {to}")]
pub struct TransitionError {
    pub kind: MissionKind,
    pub from: MissionState,
    pub to: MissionState,
}
