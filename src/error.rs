//! Error types for trigger registration and the dispatcher lifecycle.

use binlog_core::{ExpressionError, Statement};
use thiserror::Error;

/// Invalid trigger registration input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing trigger name")]
    MissingName,
    #[error("Missing trigger expression")]
    MissingExpression,
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Error returned by trigger registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("There's already a trigger named \"{name}\" for expression \"{expression}\" with statement \"{statement}\"")]
    DuplicateTrigger {
        name: String,
        expression: String,
        statement: Statement,
    },
}

/// Error returned by dispatcher lifecycle operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to connect: {0:#}")]
    Connect(anyhow::Error),

    #[error("Failed to start binlog feed: {0:#}")]
    FeedStart(anyhow::Error),

    #[error("Failed to release connection: {0:#}")]
    ConnectionTeardown(anyhow::Error),
}
