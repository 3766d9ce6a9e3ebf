use serde_json::json;
use thiserror::Error;

use crate::reconcile::SinkError;

/// Which component of a composite mark an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkField {
    Sessional,
    Attendance,
}

impl MarkField {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkField::Sessional => "sessional",
            MarkField::Attendance => "attendance",
        }
    }

    pub fn max(self) -> f64 {
        match self {
            MarkField::Sessional => crate::calc::MAX_SESSIONAL,
            MarkField::Attendance => crate::calc::MAX_ATTENDANCE,
        }
    }
}

/// Errors raised by the marks engine. None of them are fatal; every variant
/// is recoverable at the call site by re-editing or retrying.
#[derive(Debug, Error)]
pub enum MarksError {
    #[error("{} mark must be between 0 and {max}, got {value}", .field.as_str())]
    OutOfRange {
        field: MarkField,
        max: f64,
        value: f64,
    },

    #[error("{} mark is not a number: {raw:?}", .field.as_str())]
    MalformedValue { field: MarkField, raw: String },

    #[error("student not in cohort: {0}")]
    UnknownStudent(String),

    #[error("cannot build cohort for student {student_id}: {reason}")]
    InvalidSeed { student_id: String, reason: String },

    #[error("cohort has no students")]
    EmptyCohort,

    #[error("nothing saved ({attempted} records pending): {source}")]
    Persistence {
        attempted: usize,
        #[source]
        source: SinkError,
    },

    /// The sink accepted the batch but its answer could not be matched to
    /// the requests. Some rows may be stored; every record stays dirty.
    #[error("save of {attempted} records was not confirmed: {source}")]
    Unconfirmed {
        attempted: usize,
        #[source]
        source: SinkError,
    },
}

impl MarksError {
    pub fn code(&self) -> &'static str {
        match self {
            MarksError::OutOfRange { .. } => "out_of_range",
            MarksError::MalformedValue { .. } => "bad_value",
            MarksError::UnknownStudent(_) => "not_found",
            MarksError::InvalidSeed { .. } => "invalid_seed",
            MarksError::EmptyCohort => "empty_cohort",
            MarksError::Persistence { .. } => "persistence_failed",
            MarksError::Unconfirmed { .. } => "save_unconfirmed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            MarksError::OutOfRange { field, max, value } => Some(json!({
                "field": field.as_str(),
                "min": 0.0,
                "max": max,
                "value": value,
            })),
            MarksError::MalformedValue { field, raw } => Some(json!({
                "field": field.as_str(),
                "raw": raw,
            })),
            MarksError::UnknownStudent(id) => Some(json!({ "studentId": id })),
            MarksError::InvalidSeed { student_id, .. } => {
                Some(json!({ "studentId": student_id }))
            }
            MarksError::EmptyCohort => None,
            MarksError::Persistence { attempted, .. } => Some(json!({
                "attempted": attempted,
                "saved": 0,
            })),
            MarksError::Unconfirmed { attempted, .. } => Some(json!({
                "attempted": attempted,
                "stillDirty": attempted,
            })),
        }
    }
}
