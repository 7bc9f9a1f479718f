//! Domain error model.

use thiserror::Error;

use crate::upcast::UpcastError;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures. Storage and
/// routing failures belong to the infrastructure error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A domain invariant rejected the command.
    ///
    /// Retriable violations describe transient preconditions ("try again once
    /// state settles"); non-retriable ones are permanent rejections.
    #[error("business rule violated: {message}")]
    BusinessRuleViolation { message: String, retriable: bool },

    /// The aggregate does not know how to handle this command type.
    #[error("unknown command type: {0}")]
    UnknownCommand(String),

    /// Rehydration was requested with no events.
    #[error("cannot rehydrate an aggregate from an empty event stream")]
    EmptyStream,

    /// A payload or snapshot could not be decoded into its typed form.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// An identifier was invalid (e.g. empty).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Schema evolution failed while reading stored data.
    #[error(transparent)]
    Upcast(#[from] UpcastError),
}

impl DomainError {
    /// Permanent business rule violation.
    pub fn business_rule(msg: impl Into<String>) -> Self {
        Self::BusinessRuleViolation {
            message: msg.into(),
            retriable: false,
        }
    }

    /// Transient business rule violation; the caller may retry later.
    pub fn retriable(msg: impl Into<String>) -> Self {
        Self::BusinessRuleViolation {
            message: msg.into(),
            retriable: true,
        }
    }

    pub fn unknown_command(command_type: impl Into<String>) -> Self {
        Self::UnknownCommand(command_type.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn is_business_rule_violation(&self) -> bool {
        matches!(self, Self::BusinessRuleViolation { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::BusinessRuleViolation { retriable: true, .. })
    }
}
