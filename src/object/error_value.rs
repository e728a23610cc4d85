//! The `Error` primitive: kind, message, and an optional cause.
//!
//! This is the *script-visible* error value: what a `throw` statement
//! carries, what `catch e` binds `e` to. It is unrelated to
//! [`crate::error::RuntimeError`], the host-level error used for Rust
//! `Result` plumbing inside this crate; a `RuntimeError::UserThrown` wraps
//! a [`Value`] that is very often (but not necessarily) a `Value::Error`.

use super::Value;

#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub kind: String,
    pub message: String,
    pub cause: Option<Box<Value>>,
}

impl ErrorValue {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn to_display_string(&self) -> String {
        match &self.cause {
            Some(cause) => format!(
                "{}: {} (caused by {})",
                self.kind,
                self.message,
                cause.to_display_string()
            ),
            None => format!("{}: {}", self.kind, self.message),
        }
    }
}
