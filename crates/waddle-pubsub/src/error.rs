//! Error types for the PubSub engine.

use thiserror::Error;

use crate::types::Affiliation;

/// Errors raised while handling a PubSub request.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Node, item or subscription lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate node creation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Access denied by node policy
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The requester's effective affiliation is below what the operation needs
    #[error("{required} required")]
    AffiliationRequired {
        /// Affiliation the operation declares
        required: Affiliation,
    },

    /// Structurally forbidden action (e.g. an owner abandoning their own node)
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// Malformed operation input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown feature/operation pair
    #[error("Feature not implemented: {0}")]
    FeatureNotImplemented(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl PubSubError {
    /// Create a new not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new forbidden error.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a forbidden error naming the affiliation that was required.
    pub fn affiliation_required(required: Affiliation) -> Self {
        Self::AffiliationRequired { required }
    }

    /// Create a new not-allowed error.
    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::NotAllowed(msg.into())
    }

    /// Create a new bad-request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a new feature-not-implemented error.
    pub fn feature_not_implemented(msg: impl Into<String>) -> Self {
        Self::FeatureNotImplemented(msg.into())
    }

    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// The stanza error condition this error maps to.
    pub fn condition(&self) -> ErrorCondition {
        match self {
            Self::NotFound(_) => ErrorCondition::ItemNotFound,
            Self::Conflict(_) => ErrorCondition::Conflict,
            Self::Forbidden(_) | Self::AffiliationRequired { .. } => ErrorCondition::Forbidden,
            Self::NotAllowed(_) => ErrorCondition::NotAllowed,
            Self::BadRequest(_) => ErrorCondition::BadRequest,
            Self::FeatureNotImplemented(_) => ErrorCondition::FeatureNotImplemented,
            Self::Storage(_) => ErrorCondition::InternalServerError,
        }
    }

    /// Whether this is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<libsql::Error> for PubSubError {
    fn from(e: libsql::Error) -> Self {
        PubSubError::Storage(e.to_string())
    }
}

/// Stanza error conditions produced by the engine (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    /// Malformed request
    BadRequest,
    /// Node already exists
    Conflict,
    /// Unknown feature/operation
    FeatureNotImplemented,
    /// Insufficient affiliation or access model
    Forbidden,
    /// Backend failure
    InternalServerError,
    /// Lookup miss
    ItemNotFound,
    /// Structurally forbidden action
    NotAllowed,
}

impl ErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::NotAllowed => "not-allowed",
        }
    }

    /// Get the stanza error type attribute for this condition.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Forbidden => "auth",
            Self::BadRequest => "modify",
            Self::InternalServerError => "wait",
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed => "cancel",
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed dispatch as delivered to the caller.
///
/// Wraps the original error unchanged and adds a diagnostic trace of the form
/// `<message> @ <feature>/<operation>`.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DispatchError {
    /// The error that aborted the request
    #[source]
    pub error: PubSubError,
    /// Diagnostic trace for operators
    pub trace: String,
}

impl DispatchError {
    /// Annotate an error with the feature/operation it was raised in.
    pub fn annotate(error: PubSubError, feature: &str, operation: &str) -> Self {
        let message = error.to_string();
        let message = if message.is_empty() {
            error.condition().as_str().to_string()
        } else {
            message
        };
        let trace = format!("{} @ {}/{}", message, feature, operation);
        Self { error, trace }
    }

    /// The stanza error condition of the wrapped error.
    pub fn condition(&self) -> ErrorCondition {
        self.error.condition()
    }
}
