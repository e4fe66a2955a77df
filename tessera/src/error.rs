//! Operator status and error types
//!
//! Every operator returns [`Result`]. A failure carries exactly one
//! [`OpStatus`]; success is `Ok`. The status can be extracted again with
//! [`OpError::status`] or converted into a plain [`OpStatus`] for callers that
//! keep status values around instead of propagating errors.

use std::fmt;

use thiserror::Error;

/// Result type alias using tessera's [`OpError`]
pub type Result<T> = std::result::Result<T, OpError>;

/// Classification of an operator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpErrorType {
    /// No error.
    None,
    /// Caller-supplied shapes, types or required fields are wrong.
    /// Never retried internally.
    InvalidArgs,
    /// Scratch or workspace memory could not be acquired. The caller may
    /// retry after freeing resources.
    ResourceExhausted,
    /// The requested configuration has no backend support. Permanent.
    Unimplemented,
    /// Backend or communication-layer fault.
    Internal,
    /// Uncategorized backend failure.
    Unknown,
}

impl OpErrorType {
    /// Upper-case tag used in diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::InvalidArgs => "INVALID_ARGS",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for OpErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an operator invocation: an error class plus a message.
///
/// `ok()` holds iff `error_type == OpErrorType::None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpStatus {
    pub error_type: OpErrorType,
    pub message: String,
}

impl OpStatus {
    /// Build a status with the given class and message.
    #[must_use]
    pub fn make(error_type: OpErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    /// The success status.
    #[must_use]
    pub fn ok_status() -> Self {
        Self::make(OpErrorType::None, "")
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.error_type == OpErrorType::None
    }

    /// Convert into a `Result`, turning any non-OK status into an [`OpError`].
    ///
    /// # Errors
    /// Returns the status wrapped in an `OpError` when it is not OK.
    pub fn into_result(self) -> Result<()> {
        if self.ok() {
            Ok(())
        } else {
            Err(OpError(self))
        }
    }

    /// Collapse a `Result` into a status value.
    #[must_use]
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok_status(),
            Err(e) => e.status().clone(),
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpException[{}]: {}", self.error_type, self.message)
    }
}

/// Operator failure carrying exactly one non-OK [`OpStatus`].
///
/// The display form keeps both the error class tag and the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct OpError(OpStatus);

impl OpError {
    /// Wrap a status.
    ///
    /// # Panics
    /// Panics if `status` is OK; an error must always describe a failure.
    #[must_use]
    pub fn new(status: OpStatus) -> Self {
        assert!(!status.ok(), "OpError cannot carry an OK status");
        Self(status)
    }

    #[must_use]
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self(OpStatus::make(OpErrorType::InvalidArgs, message))
    }

    #[must_use]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self(OpStatus::make(OpErrorType::ResourceExhausted, message))
    }

    #[must_use]
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self(OpStatus::make(OpErrorType::Unimplemented, message))
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self(OpStatus::make(OpErrorType::Internal, message))
    }

    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self(OpStatus::make(OpErrorType::Unknown, message))
    }

    #[must_use]
    pub fn status(&self) -> &OpStatus {
        &self.0
    }

    #[must_use]
    pub fn error_type(&self) -> OpErrorType {
        self.0.error_type
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.0.message
    }
}

impl From<OpError> for OpStatus {
    fn from(e: OpError) -> Self {
        e.0
    }
}

impl From<serde_json::Error> for OpError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_args(format!("configuration: {e}"))
    }
}
