//! Error type shared by every part of the runtime.
//!
//! All failures carry an [`ErrorCode`] tag plus an optional user-defined code
//! and message. Errors are themselves registered message content, so a failed
//! request travels back to the requester as an ordinary response message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classifies a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A request did not receive a response within its deadline.
    RequestTimeout,
    /// A response arrived whose type list differs from the declared one.
    UnexpectedResponse,
    /// A message reached an actor with no matching handler.
    UnexpectedMessage,
    /// An argument violated a documented precondition.
    InvalidArgument,
    /// A numeric or index argument fell outside its valid range.
    OutOfRange,
    /// The target mailbox no longer accepts messages.
    MailboxClosed,
    /// The target actor terminated or never existed.
    ActorUnreachable,
    /// Two different metadata records were registered under one type tag.
    TypeRegistryConflict,
    /// A value's type was never registered.
    UnknownType,
    /// Reading a serialized value failed.
    DeserializationFailed,
    /// Writing a value to a codec failed.
    SerializationFailed,
    /// A periodic clock action stalled and its policy is `Fail`.
    PeriodicActionFailed,
    /// Application-defined failure; see `user_code` and `message`.
    User,
}

impl ErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RequestTimeout => "request_timeout",
            ErrorCode::UnexpectedResponse => "unexpected_response",
            ErrorCode::UnexpectedMessage => "unexpected_message",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::OutOfRange => "out_of_range",
            ErrorCode::MailboxClosed => "mailbox_closed",
            ErrorCode::ActorUnreachable => "actor_unreachable",
            ErrorCode::TypeRegistryConflict => "type_registry_conflict",
            ErrorCode::UnknownType => "unknown_type",
            ErrorCode::DeserializationFailed => "deserialization_failed",
            ErrorCode::SerializationFailed => "serialization_failed",
            ErrorCode::PeriodicActionFailed => "periodic_action_failed",
            ErrorCode::User => "user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime failure: tag, optional user code, optional message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", self.render())]
pub struct Error {
    code: ErrorCode,
    user_code: Option<u64>,
    message: Option<String>,
}

impl Error {
    /// Creates an error carrying only a code.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            user_code: None,
            message: None,
        }
    }

    /// Creates an error with a human-readable message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            user_code: None,
            message: Some(message.into()),
        }
    }

    /// Creates an application-defined error.
    pub fn user(user_code: u64, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::User,
            user_code: Some(user_code),
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_code(&self) -> Option<u64> {
        self.user_code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    fn render(&self) -> String {
        let mut out = self.code.as_str().to_string();
        if let Some(code) = self.user_code {
            out.push_str(&format!("({code})"));
        }
        if let Some(msg) = &self.message {
            out.push_str(": ");
            out.push_str(msg);
        }
        out
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

// Deserialization needs to rebuild errors from codecs; a neutral default
// keeps the registry's default-construct slot usable.
impl Default for Error {
    fn default() -> Self {
        Error::new(ErrorCode::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_code_and_message() {
        let err = Error::with_message(ErrorCode::RequestTimeout, "no reply after 10ms");
        assert_eq!(err.to_string(), "request_timeout: no reply after 10ms");
    }

    #[test]
    fn renders_user_code() {
        let err = Error::user(42, "boom");
        assert_eq!(err.to_string(), "user(42): boom");
        assert_eq!(err.code(), ErrorCode::User);
        assert_eq!(err.user_code(), Some(42));
    }

    #[test]
    fn equality_ignores_nothing() {
        assert_eq!(
            Error::new(ErrorCode::MailboxClosed),
            Error::new(ErrorCode::MailboxClosed)
        );
        assert_ne!(
            Error::new(ErrorCode::MailboxClosed),
            Error::with_message(ErrorCode::MailboxClosed, "detail")
        );
    }
}
