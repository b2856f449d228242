//! Error types for the script bridge
//!
//! Engine exceptions, typed host throws, marshaling failures and the
//! bridge's own runtime conditions share one enum so host functions can
//! return any of them and have it thrown back into the engine.

use crate::value::Value;
use std::fmt;
use tether_core::{AffinityError, CancelCause};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// An exception raised inside the engine.
    #[error("{0}")]
    Script(ScriptError),

    #[error("{0}")]
    Syntax(String),

    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    Reference(String),

    #[error("{0}")]
    Range(String),

    #[error("{0}")]
    Internal(String),

    #[error("{} required, but only {actual} present.", plural(.required, "argument"))]
    NotEnoughParameters { required: usize, actual: usize },

    #[error("parameter {index} is not of type '{type_name}'")]
    InvalidParameterType { index: usize, type_name: String },

    #[error("value is not of type '{type_name}'")]
    InvalidType { type_name: String },

    #[error("engine access from a thread that does not own the runtime")]
    ForeignThread,

    #[error("value belongs to a different runtime")]
    ForeignRuntime,

    #[error("event loop is already running")]
    LoopBusy,

    #[error("runtime is still executing on its owner thread")]
    EngineBusy,

    #[error("event loop cancelled: {0}")]
    Cancelled(CancelCause),

    #[error("task queue is full")]
    QueueFull,

    #[error("task queue is closed")]
    QueueClosed,

    #[error("task was dropped before producing a result")]
    Abandoned,

    #[error("cannot block inside an async runtime; await the result instead")]
    AsyncContext,

    #[error("realm has been released")]
    RealmReleased,

    #[error("engine operation failed: {0}")]
    Engine(&'static str),

    #[error("string contains an interior nul byte")]
    InvalidString(#[from] std::ffi::NulError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Host(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn syntax(message: impl Into<String>) -> Self {
        Error::Syntax(message.into())
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Error::Type(message.into())
    }

    pub fn reference(message: impl Into<String>) -> Self {
        Error::Reference(message.into())
    }

    pub fn range(message: impl Into<String>) -> Self {
        Error::Range(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Wraps an arbitrary host error; it is thrown as a plain `Error` object.
    pub fn host<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Host(Box::new(error))
    }

    /// Marshaling failures are reported to scripts as `TypeError`s.
    pub fn is_type_error(&self) -> bool {
        matches!(
            self,
            Error::Type(_)
                | Error::NotEnoughParameters { .. }
                | Error::InvalidParameterType { .. }
                | Error::InvalidType { .. }
        )
    }

    pub fn as_script(&self) -> Option<&ScriptError> {
        match self {
            Error::Script(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AffinityError> for Error {
    fn from(error: AffinityError) -> Self {
        match error {
            AffinityError::AlreadyDriving => Error::LoopBusy,
            AffinityError::OwnerBusy => Error::EngineBusy,
            AffinityError::NotOwner => Error::ForeignThread,
        }
    }
}

fn plural(n: &usize, noun: &str) -> String {
    if *n == 1 {
        format!("{n} {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

/// An exception value thrown by script code.
///
/// The message is captured when the exception is taken off the engine, so
/// the error can be displayed from any thread. The stack trace is read on
/// demand.
#[derive(Clone)]
pub struct ScriptError {
    value: Value,
    message: String,
}

impl ScriptError {
    /// Classifies an exception value: error objects render as
    /// `"name: message"`, `undefined`/`null` as their tag name and anything
    /// else through `toString()`.
    pub(crate) fn capture(value: Value) -> Self {
        let message = if value.is_error() {
            let name = value
                .get("name")
                .and_then(|v| v.display())
                .unwrap_or_else(|_| "Error".to_string());
            let text = value
                .get("message")
                .and_then(|v| v.display())
                .unwrap_or_default();
            if text.is_empty() {
                name
            } else {
                format!("{name}: {text}")
            }
        } else if value.is_undefined() || value.is_null() {
            value.tag().name().to_string()
        } else {
            value
                .display()
                .unwrap_or_else(|_| "uncaught exception".to_string())
        };
        Self { value, message }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The message followed by the engine's stack trace, if the thrown value
    /// carries one.
    pub fn stack(&self) -> Result<String> {
        if !self.value.is_object() {
            return Ok(self.message.clone());
        }
        let stack = self.value.get("stack")?;
        if stack.is_undefined() {
            return Ok(self.message.clone());
        }
        let trace = stack.display()?;
        Ok(format!("{}\n{}", self.message, trace.trim_end()))
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptError")
            .field("message", &self.message)
            .field("tag", &self.value.tag())
            .finish()
    }
}

impl std::error::Error for ScriptError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshaling_messages() {
        let err = Error::NotEnoughParameters {
            required: 2,
            actual: 1,
        };
        assert_eq!(err.to_string(), "2 arguments required, but only 1 present.");

        let err = Error::NotEnoughParameters {
            required: 1,
            actual: 0,
        };
        assert_eq!(err.to_string(), "1 argument required, but only 0 present.");

        let err = Error::InvalidParameterType {
            index: 1,
            type_name: "string".into(),
        };
        assert_eq!(err.to_string(), "parameter 1 is not of type 'string'");
        assert!(err.is_type_error());

        let err = Error::InvalidType {
            type_name: "array".into(),
        };
        assert_eq!(err.to_string(), "value is not of type 'array'");
    }

    #[test]
    fn typed_constructors() {
        assert!(Error::type_error("x").is_type_error());
        assert!(!Error::range("x").is_type_error());
        assert_eq!(Error::internal("boom").to_string(), "boom");
        assert!(matches!(
            Error::from(AffinityError::AlreadyDriving),
            Error::LoopBusy
        ));
    }
}
