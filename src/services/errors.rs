//! Failure taxonomy for moderation processing.
//!
//! Every failure maps to exactly one [`ErrorClass`]. Domain failures raised by
//! the worker itself (bad event, missing or invalid item) are permanent;
//! everything else, including unrecognised infrastructure faults, is retried.

use strum::{Display, IntoStaticStr};

use crate::services::prediction::PredictionError;
use crate::services::store::StoreError;

#[derive(Debug, thiserror::Error, IntoStaticStr)]
pub enum ProcessingError {
    #[error("{0}")]
    MalformedEvent(String),

    #[error("Item with id={0} not found in database")]
    ItemNotFound(i64),

    #[error("Item with id={item_id} failed validation: {reason}")]
    InvalidItem { item_id: i64, reason: String },

    #[error("ML model is not available")]
    ModelUnavailable,

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("Prediction failed: {0}")]
    Prediction(#[from] PredictionError),

    /// Explicitly tagged as transient by the caller.
    #[error("{0}")]
    Retryable(String),

    /// Explicitly tagged as never-succeeding by the caller.
    #[error("{0}")]
    Permanent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

/// Classify a failure. Pure and total.
pub fn classify(err: &ProcessingError) -> ErrorClass {
    match err {
        ProcessingError::MalformedEvent(_)
        | ProcessingError::ItemNotFound(_)
        | ProcessingError::InvalidItem { .. }
        | ProcessingError::Permanent(_) => ErrorClass::Permanent,
        ProcessingError::ModelUnavailable
        | ProcessingError::Store(_)
        | ProcessingError::Prediction(_)
        | ProcessingError::Retryable(_) => ErrorClass::Retryable,
    }
}

pub fn is_retryable(err: &ProcessingError) -> bool {
    classify(err) == ErrorClass::Retryable
}

impl ProcessingError {
    /// Stable variant name used as the dead-letter `error_type`.
    pub fn error_type(&self) -> &'static str {
        self.into()
    }
}
