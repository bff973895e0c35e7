//! How a finished trace is reported.

use std::fmt;

use nova_jdwp::{Location, ThreadId};
use tokio::sync::mpsc;

use crate::error::{ErrorCategory, TraceError};
use crate::formatter::ChainTrace;

/// Message keys of the failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKey {
    CannotFindPlaces,
    CannotInitializeBreakpoints,
    ExceptionDuringExecution,
    CannotInterpretResult,
}

impl FailureKey {
    pub fn message_key(self) -> &'static str {
        match self {
            FailureKey::CannotFindPlaces => "evaluation.failed.cannot.find.places.for.breakpoints",
            FailureKey::CannotInitializeBreakpoints => {
                "evaluation.failed.cannot.initialize.breakpoints"
            }
            FailureKey::ExceptionDuringExecution => {
                "evaluation.failed.exception.occurred.during.stream.execution"
            }
            FailureKey::CannotInterpretResult => "evaluation.failed.cannot.interpret.result",
        }
    }

    /// The key for an error raised while the chain is set up or running.
    pub fn for_error(err: &TraceError) -> Self {
        match err {
            TraceError::PlaceForBreakpointNotFound { .. } => FailureKey::CannotFindPlaces,
            TraceError::Interpret(_) => FailureKey::CannotInterpretResult,
            TraceError::Tracing(_) => FailureKey::ExceptionDuringExecution,
            _ => match err.category() {
                ErrorCategory::Transport => FailureKey::ExceptionDuringExecution,
                ErrorCategory::SetupFatal
                | ErrorCategory::ValueInjection
                | ErrorCategory::InvariantViolation
                | ErrorCategory::Substitution => FailureKey::CannotInitializeBreakpoints,
            },
        }
    }
}

impl fmt::Display for FailureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFailure {
    pub key: FailureKey,
    /// Rendered cause.
    pub message: String,
}

impl TraceFailure {
    pub fn new(key: FailureKey, err: &TraceError) -> Self {
        Self {
            key,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for TraceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Where the traced chain was evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationContext {
    pub thread: ThreadId,
    /// Location of the invoking frame when the trace started.
    pub location: Location,
}

/// Receives the outcome of a trace. Called from the trace manager task, so
/// implementations must not block.
pub trait TracingCallback: Send + Sync {
    fn evaluated(&self, result: ChainTrace, context: &EvaluationContext);

    fn evaluation_failed(&self, expression: &str, failure: &TraceFailure);

    /// A recoverable substitution failure; the trace goes on.
    fn breakpoint_setup_failed(&self, _err: &TraceError) {}
}

/// Everything a [`TracingCallback`] can observe, as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceReport {
    Evaluated {
        result: ChainTrace,
        context: EvaluationContext,
    },
    Failed {
        expression: String,
        failure: TraceFailure,
    },
    SetupFailed(String),
}

/// Forwards every report into a channel.
impl TracingCallback for mpsc::UnboundedSender<TraceReport> {
    fn evaluated(&self, result: ChainTrace, context: &EvaluationContext) {
        let _ = self.send(TraceReport::Evaluated {
            result,
            context: context.clone(),
        });
    }

    fn evaluation_failed(&self, expression: &str, failure: &TraceFailure) {
        let _ = self.send(TraceReport::Failed {
            expression: expression.to_string(),
            failure: failure.clone(),
        });
    }

    fn breakpoint_setup_failed(&self, err: &TraceError) {
        let _ = self.send(TraceReport::SetupFailed(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn failures_render_with_their_message_key() {
        let failure = TraceFailure::new(
            FailureKey::CannotFindPlaces,
            &TraceError::PlaceForBreakpointNotFound {
                call: "frobnicate".to_string(),
                reason: "no such stream method".to_string(),
            },
        );
        assert_eq!(
            failure.to_string(),
            "evaluation.failed.cannot.find.places.for.breakpoints: cannot find a place for a breakpoint on `frobnicate`: no such stream method"
        );
    }

    #[test]
    fn channel_callback_forwards_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.evaluation_failed(
            "s.count()",
            &TraceFailure {
                key: FailureKey::CannotInterpretResult,
                message: "boom".to_string(),
            },
        );
        tx.breakpoint_setup_failed(&TraceError::ValueInterception("twice".to_string()));

        assert_eq!(
            rx.try_recv().unwrap(),
            TraceReport::Failed {
                expression: "s.count()".to_string(),
                failure: TraceFailure {
                    key: FailureKey::CannotInterpretResult,
                    message: "boom".to_string(),
                },
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TraceReport::SetupFailed("value interception failed: twice".to_string())
        );
    }
}
