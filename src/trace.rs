//! Diagnostic trace info attached to tasks.
//!
//! Every field has a static placeholder default rather than forcing callers
//! to fill it in.

use std::fmt;

/// Purely diagnostic descriptor carried by a task. Has no effect on
/// scheduling behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTraceInfo {
    /// What the task is (e.g. "decode PNG thumbnail").
    pub content: String,
    /// Why the task exists (e.g. "asset preview panel").
    pub purpose: String,
}

impl TaskTraceInfo {
    /// Creates trace info with the given content and purpose.
    pub fn new(content: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            purpose: purpose.into(),
        }
    }
}

impl Default for TaskTraceInfo {
    fn default() -> Self {
        Self {
            content: "[Unspecified Context]".to_string(),
            purpose: "[Unspecified Purpose]".to_string(),
        }
    }
}

impl fmt::Display for TaskTraceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.content, self.purpose)
    }
}

/// Emits a `tracing` event when the `tracing` feature is enabled; a no-op
/// otherwise. Centralizes the diagnostics event format.
#[cfg(feature = "tracing")]
macro_rules! trace_event {
    ($level:ident, $event:expr, $trace:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            content = %$trace.content,
            purpose = %$trace.purpose,
            event = $event,
            $($($field)*)?
        );
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_event {
    ($level:ident, $event:expr, $trace:expr $(, $($field:tt)*)?) => {
        let _ = (&$trace, $event);
    };
}

pub(crate) use trace_event;
