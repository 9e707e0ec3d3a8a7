use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle status of a moderation task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    /// `completed` and `failed` are terminal; a terminal task is never written again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A moderation task row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModerationTask {
    pub id: i64,
    pub item_id: i64,
    pub status: TaskStatus,
    pub is_violation: Option<bool>,
    pub probability: Option<f64>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Terminal write applied to a pending task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub is_violation: Option<bool>,
    pub probability: Option<f64>,
    pub error_message: Option<String>,
    /// `None` leaves the stored counter untouched.
    pub retry_count: Option<i32>,
}

impl TaskUpdate {
    pub fn completed(is_violation: bool, probability: f64) -> Self {
        Self {
            status: TaskStatus::Completed,
            is_violation: Some(is_violation),
            probability: Some(probability),
            error_message: None,
            retry_count: None,
        }
    }

    pub fn failed(error_message: impl Into<String>, retry_count: Option<i32>) -> Self {
        Self {
            status: TaskStatus::Failed,
            is_violation: None,
            probability: None,
            error_message: Some(error_message.into()),
            retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trips_through_text() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::from_str("completed").unwrap(), TaskStatus::Completed);
        assert!(TaskStatus::from_str("processing").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_failed_update_clears_prediction_fields() {
        let update = TaskUpdate::failed("boom", Some(3));
        assert_eq!(update.status, TaskStatus::Failed);
        assert!(update.is_violation.is_none());
        assert!(update.probability.is_none());
        assert_eq!(update.retry_count, Some(3));
    }
}
