//! Error types for the inference core
//!
//! This module defines the error type shared by the queue, the resource manager
//! and the inference manager, together with the structured error payload that a
//! failed request carries.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::RequestStatus;
use crate::types::{ModelId, RequestId};

/// Result type for inference core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for inference core operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request queue is at capacity
    #[error("Request queue is full ({capacity} pending requests)")]
    QueueFull {
        /// Configured maximum queue size
        capacity: usize,
    },

    /// Unknown request identifier
    #[error("Request {0} not found")]
    RequestNotFound(RequestId),

    /// Unknown model identifier
    #[error("Model {0} is not registered")]
    ModelNotFound(ModelId),

    /// Operation on a request that already reached a terminal status
    #[error("Request {id} is already {status}")]
    AlreadyTerminal {
        /// Request identifier
        id: RequestId,
        /// The terminal status the request is in
        status: RequestStatus,
    },

    /// Status change that would move a request backwards
    #[error("Invalid transition for request {id}: {from} -> {to}")]
    InvalidTransition {
        /// Request identifier
        id: RequestId,
        /// Current status
        from: RequestStatus,
        /// Requested status
        to: RequestStatus,
    },

    /// No model could be loaded or evicted to make room
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The wrapped model failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Model loading failed
    #[error("Model load error: {0}")]
    ModelLoad(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::RequestNotFound(_) | Error::ModelNotFound(_))
    }

    /// Returns true if the queue rejected a submission
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Error::QueueFull { .. })
    }

    /// Returns true if the request was already terminal
    pub fn is_already_terminal(&self) -> bool {
        matches!(self, Error::AlreadyTerminal { .. })
    }

    /// Returns true if the error is a resource exhaustion error
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_))
    }

    /// Returns true if the error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Classifies the error for a request's error payload
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::QueueFull { .. } => ErrorKind::QueueFull,
            Error::RequestNotFound(_) | Error::ModelNotFound(_) => ErrorKind::NotFound,
            Error::AlreadyTerminal { .. } => ErrorKind::AlreadyTerminal,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Inference(_) => ErrorKind::Inference,
            Error::ModelLoad(_) => ErrorKind::ModelLoad,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Io(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::InvalidTransition { .. }
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Converts the error into the payload stored on a failed request
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.kind(), self.to_string())
    }
}

/// Kind of failure recorded on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QueueFull,
    NotFound,
    AlreadyTerminal,
    ResourceExhausted,
    ModelLoad,
    Inference,
    Timeout,
    Canceled,
    InvalidArgument,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyTerminal => "already_terminal",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::ModelLoad => "model_load",
            ErrorKind::Inference => "inference",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Structured error attached to a request in a failed, timeout or canceled state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error classification
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

impl ErrorPayload {
    /// Creates a new error payload
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Builds an inference error payload from a model callable failure,
    /// keeping the whole context chain
    pub fn inference(err: &anyhow::Error) -> Self {
        Error::Inference(format!("{:#}", err)).to_payload()
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
