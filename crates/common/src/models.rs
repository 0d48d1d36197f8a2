//! Request data model
//!
//! A [`Request`] is one inference job tracked from submission to a terminal
//! status. Status changes go through [`Request::transition`], which enforces the
//! lifecycle `pending -> processing -> {completed | failed | timeout | canceled}`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, ErrorPayload, Result};
use crate::types::{ModelId, RequestId};

// Keeps chrono durations in range for absurd timeout values.
const MAX_TIMEOUT_SECS: i64 = 100 * 365 * 24 * 3600;

/// Request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Waiting in the queue
    Pending,
    /// Dequeued by a worker
    Processing,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
    /// Exceeded its timeout budget
    Timeout,
    /// Canceled while pending
    Canceled,
}

impl RequestStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [RequestStatus; 6] = [
        RequestStatus::Pending,
        RequestStatus::Processing,
        RequestStatus::Completed,
        RequestStatus::Failed,
        RequestStatus::Timeout,
        RequestStatus::Canceled,
    ];

    /// Returns true for statuses that never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Failed
                | RequestStatus::Timeout
                | RequestStatus::Canceled
        )
    }

    /// Lowercase name, as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Timeout => "timeout",
            RequestStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request priority
///
/// Variants are declared lowest first so that the derived ordering ranks
/// `Critical` highest. Serialized lowercase; parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    /// Low priority
    Low,
    /// Normal priority
    Normal,
    /// High priority
    High,
    /// Critical priority
    Critical,
}

impl RequestPriority {
    /// All priorities, lowest first
    pub const ALL: [RequestPriority; 4] = [
        RequestPriority::Low,
        RequestPriority::Normal,
        RequestPriority::High,
        RequestPriority::Critical,
    ];

    /// Uppercase tier name
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPriority::Low => "LOW",
            RequestPriority::Normal => "NORMAL",
            RequestPriority::High => "HIGH",
            RequestPriority::Critical => "CRITICAL",
        }
    }
}

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::Normal
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(RequestPriority::Low),
            "normal" => Ok(RequestPriority::Normal),
            "high" => Ok(RequestPriority::High),
            "critical" => Ok(RequestPriority::Critical),
            _ => Err(format!("Unknown request priority: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for RequestPriority {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// What a request asks for: which model, and the arguments to run it with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferencePayload {
    /// Model the request runs against
    pub model_id: ModelId,
    /// Service category (e.g. `get_molecule_property`)
    pub service_type: String,
    /// Service name within the category
    pub service_name: String,
    /// Inference arguments, passed through to the model untouched
    pub parameters: serde_json::Value,
}

impl InferencePayload {
    /// Creates a payload for a model with the given arguments
    pub fn new(model_id: impl Into<ModelId>, parameters: serde_json::Value) -> Self {
        Self {
            model_id: model_id.into(),
            service_type: String::new(),
            service_name: String::new(),
            parameters,
        }
    }
}

/// One inference job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique identifier
    pub id: RequestId,
    /// Current status
    pub status: RequestStatus,
    /// Scheduling priority
    pub priority: RequestPriority,
    /// Model identifier and arguments
    pub payload: InferencePayload,
    /// Submission timestamp
    pub created_at: DateTime<Utc>,
    /// Dequeue timestamp
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Timeout budget in seconds (applies to queue wait and to processing)
    pub timeout_seconds: Option<u64>,
    /// Result, set when completed
    pub result: Option<serde_json::Value>,
    /// Error, set when failed, timed out or canceled
    pub error: Option<ErrorPayload>,
}

impl Request {
    /// Creates a pending request
    pub fn new(
        payload: InferencePayload,
        priority: RequestPriority,
        timeout_seconds: Option<u64>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            status: RequestStatus::Pending,
            priority,
            payload,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds,
            result: None,
            error: None,
        }
    }

    /// Returns true if the request reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a status change
    ///
    /// Terminal statuses are absorbing and `completed_at` is written exactly once.
    /// A terminal transition always leaves either a result or an error behind:
    /// `Completed` without a result stores `null`, the other terminal statuses
    /// get a default error payload when none is given.
    pub fn transition(
        &mut self,
        status: RequestStatus,
        result: Option<serde_json::Value>,
        error: Option<ErrorPayload>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }

        match status {
            RequestStatus::Pending => {
                return Err(self.invalid_transition(status));
            },
            RequestStatus::Processing => {
                if self.status != RequestStatus::Pending {
                    return Err(self.invalid_transition(status));
                }
                self.started_at.get_or_insert(now);
            },
            RequestStatus::Completed | RequestStatus::Failed
                if self.status != RequestStatus::Processing =>
            {
                return Err(self.invalid_transition(status));
            },
            RequestStatus::Completed => {
                self.result = Some(result.unwrap_or(serde_json::Value::Null));
                self.error = None;
                self.completed_at = Some(now);
            },
            RequestStatus::Failed | RequestStatus::Timeout | RequestStatus::Canceled => {
                self.result = None;
                self.error = Some(error.unwrap_or_else(|| default_error(status)));
                self.completed_at = Some(now);
            },
        }

        self.status = status;
        Ok(())
    }

    fn invalid_transition(&self, to: RequestStatus) -> Error {
        Error::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }

    /// Timeout budget as a duration
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(|secs| {
            Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_TIMEOUT_SECS))
        })
    }

    /// Returns true if the request is pending and has waited longer than its timeout
    pub fn queue_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.timeout()) {
            (RequestStatus::Pending, Some(timeout)) => now - self.created_at > timeout,
            _ => false,
        }
    }

    /// Returns true if the request is processing and has run longer than its timeout
    pub fn processing_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.timeout(), self.started_at) {
            (RequestStatus::Processing, Some(timeout), Some(started)) => now - started > timeout,
            _ => false,
        }
    }

    /// Time since submission, frozen at completion
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.completed_at.unwrap_or(now) - self.created_at
    }

    /// Time since dequeue, frozen at completion
    pub fn processing_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at
            .map(|started| self.completed_at.unwrap_or(now) - started)
    }

    /// Projection returned to callers polling for results
    pub fn view(&self) -> RequestView {
        let now = Utc::now();
        RequestView {
            request_id: self.id,
            status: self.status,
            priority: self.priority,
            model_id: self.payload.model_id.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            elapsed_seconds: seconds(self.elapsed(now)),
            processing_seconds: self.processing_time(now).map(seconds),
            result: if self.status == RequestStatus::Completed {
                self.result.clone()
            } else {
                None
            },
            error: self.error.clone(),
            expires_at: None,
        }
    }
}

fn default_error(status: RequestStatus) -> ErrorPayload {
    match status {
        RequestStatus::Timeout => ErrorPayload::new(ErrorKind::Timeout, "Request timed out"),
        RequestStatus::Canceled => {
            ErrorPayload::new(ErrorKind::Canceled, "Request canceled by user")
        },
        _ => ErrorPayload::new(ErrorKind::Internal, "Request failed"),
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

/// Read-only projection of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestView {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub priority: RequestPriority,
    pub model_id: ModelId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Set on persisted results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(timeout: Option<u64>) -> Request {
        Request::new(
            InferencePayload::new("echo", json!({"x": 1})),
            RequestPriority::Normal,
            timeout,
        )
    }

    #[test]
    fn test_priority_ordering() {
        assert!(RequestPriority::Critical > RequestPriority::High);
        assert!(RequestPriority::High > RequestPriority::Normal);
        assert!(RequestPriority::Normal > RequestPriority::Low);
        assert_eq!("HIGH".parse::<RequestPriority>().unwrap(), RequestPriority::High);
        assert!("urgent".parse::<RequestPriority>().is_err());
    }

    #[test]
    fn test_priority_serde_ignores_case() {
        let priority: RequestPriority = serde_json::from_str(r#""CRITICAL""#).unwrap();
        assert_eq!(priority, RequestPriority::Critical);
        assert_eq!(serde_json::to_string(&RequestPriority::High).unwrap(), r#""high""#);
        assert!(serde_json::from_str::<RequestPriority>(r#""urgent""#).is_err());
    }

    #[test]
    fn test_lifecycle_is_monotonic() {
        let mut req = request(None);
        let now = Utc::now();

        req.transition(RequestStatus::Processing, None, None, now).unwrap();
        assert_eq!(req.started_at, Some(now));

        // Cannot go back to pending
        assert!(req.transition(RequestStatus::Pending, None, None, now).is_err());

        req.transition(RequestStatus::Completed, Some(json!(42)), None, now)
            .unwrap();
        assert_eq!(req.result, Some(json!(42)));
        let completed_at = req.completed_at;

        // Terminal is absorbing and completed_at is written once
        let later = now + Duration::seconds(5);
        let err = req
            .transition(RequestStatus::Failed, None, None, later)
            .unwrap_err();
        assert!(err.is_already_terminal());
        assert_eq!(req.status, RequestStatus::Completed);
        assert_eq!(req.completed_at, completed_at);
    }

    #[test]
    fn test_terminal_without_error_gets_default_payload() {
        let mut req = request(Some(1));
        req.transition(RequestStatus::Timeout, None, None, Utc::now())
            .unwrap();
        assert_eq!(req.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));

        let mut req = request(None);
        req.transition(RequestStatus::Canceled, None, None, Utc::now())
            .unwrap();
        assert_eq!(req.error.as_ref().map(|e| e.kind), Some(ErrorKind::Canceled));
    }

    #[test]
    fn test_processing_requires_pending() {
        let mut req = request(None);
        let now = Utc::now();
        req.transition(RequestStatus::Processing, None, None, now).unwrap();
        let err = req
            .transition(RequestStatus::Processing, None, None, now)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_outcomes_require_processing() {
        let now = Utc::now();
        for status in [RequestStatus::Completed, RequestStatus::Failed] {
            let mut req = request(None);
            let err = req.transition(status, None, None, now).unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }));
            assert_eq!(req.status, RequestStatus::Pending);
            assert!(req.completed_at.is_none());
        }

        // Pending requests may still time out or be canceled
        let mut req = request(Some(1));
        req.transition(RequestStatus::Timeout, None, None, now).unwrap();
        assert!(req.started_at.is_none());
    }

    #[test]
    fn test_expiry_checks() {
        let mut req = request(Some(1));
        let now = req.created_at;
        assert!(!req.queue_expired(now));
        assert!(req.queue_expired(now + Duration::milliseconds(1500)));

        req.transition(RequestStatus::Processing, None, None, now + Duration::seconds(2))
            .unwrap();
        assert!(!req.queue_expired(now + Duration::seconds(10)));
        assert!(!req.processing_expired(now + Duration::milliseconds(2500)));
        assert!(req.processing_expired(now + Duration::seconds(4)));

        let untimed = request(None);
        assert!(!untimed.queue_expired(now + Duration::days(1)));
    }

    #[test]
    fn test_view_hides_result_unless_completed() {
        let mut req = request(None);
        let now = Utc::now();
        req.transition(RequestStatus::Processing, None, None, now).unwrap();
        req.transition(
            RequestStatus::Failed,
            Some(json!("ignored")),
            Some(ErrorPayload::new(ErrorKind::Inference, "boom")),
            now,
        )
        .unwrap();

        let view = req.view();
        assert_eq!(view.status, RequestStatus::Failed);
        assert!(view.result.is_none());
        assert_eq!(view.error.unwrap().message, "boom");
        assert!(view.processing_seconds.is_some());
    }
}
