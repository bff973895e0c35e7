use nova_jdwp::wire::{
    ERROR_CLASS_NOT_PREPARED, ERROR_INVALID_CLASS, ERROR_OPAQUE_FRAME, ERROR_THREAD_NOT_SUSPENDED,
    ERROR_TYPE_MISMATCH,
};
use nova_jdwp::{JdwpError, ObjectId};
use thiserror::Error;

pub type Result<T, E = TraceError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("cannot find a place for a breakpoint on `{call}`: {reason}")]
    PlaceForBreakpointNotFound { call: String, reason: String },

    #[error("method `{name}{signature}` not found in `{declaring_type}`")]
    MethodNotFound {
        name: String,
        signature: String,
        declaring_type: String,
    },

    #[error("cannot instantiate a value of `{class_name}`: {reason}")]
    ValueInstantiation { class_name: String, reason: String },

    #[error("argument type mismatch invoking `{method}`")]
    ArgumentTypeMismatch { method: String },

    #[error("incorrect value type: expected `{expected}`, got `{actual}`")]
    IncorrectValueType { expected: String, actual: String },

    #[error("value interception failed: {0}")]
    ValueInterception(String),

    #[error("`{method}` threw an exception in the debuggee (object {exception})")]
    RemoteException { method: String, exception: ObjectId },

    #[error("{0}")]
    Tracing(String),

    #[error("pinned value storage was already released")]
    StorageReleased,

    #[error("substitution failed ({kind}): {source}")]
    Substitution {
        kind: SubstitutionErrorKind,
        #[source]
        source: JdwpError,
    },

    #[error("cannot interpret trace result: {0}")]
    Interpret(String),

    #[error("trace manager is not running")]
    ManagerClosed,

    #[error("the debuggee cannot {0}")]
    UnsupportedVm(&'static str),

    #[error(transparent)]
    Jdwp(#[from] JdwpError),
}

/// How a trace failure is reported to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    SetupFatal,
    ValueInjection,
    InvariantViolation,
    Substitution,
    Transport,
}

impl TraceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TraceError::PlaceForBreakpointNotFound { .. }
            | TraceError::MethodNotFound { .. }
            | TraceError::UnsupportedVm(_) => ErrorCategory::SetupFatal,
            TraceError::ValueInstantiation { .. }
            | TraceError::ArgumentTypeMismatch { .. }
            | TraceError::IncorrectValueType { .. }
            | TraceError::RemoteException { .. }
            | TraceError::Tracing(_)
            | TraceError::Interpret(_) => ErrorCategory::ValueInjection,
            TraceError::ValueInterception(_) | TraceError::StorageReleased => {
                ErrorCategory::InvariantViolation
            }
            TraceError::Substitution { .. } => ErrorCategory::Substitution,
            TraceError::ManagerClosed | TraceError::Jdwp(_) => ErrorCategory::Transport,
        }
    }

    /// Wraps a JDWP failure from a frame or return-value write, keeping
    /// transport failures as they are.
    pub fn substitution(err: JdwpError) -> Self {
        match SubstitutionErrorKind::classify(&err) {
            Some(kind) => TraceError::Substitution { kind, source: err },
            None => TraceError::Jdwp(err),
        }
    }
}

/// The recoverable ways writing a substituted value can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubstitutionErrorKind {
    ClassNotLoaded,
    IncompatibleThreadState,
    InvalidType,
}

impl SubstitutionErrorKind {
    pub fn classify(err: &JdwpError) -> Option<Self> {
        match err.vm_error_code()? {
            ERROR_INVALID_CLASS | ERROR_CLASS_NOT_PREPARED => Some(Self::ClassNotLoaded),
            ERROR_THREAD_NOT_SUSPENDED | ERROR_OPAQUE_FRAME => Some(Self::IncompatibleThreadState),
            ERROR_TYPE_MISMATCH => Some(Self::InvalidType),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubstitutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SubstitutionErrorKind::ClassNotLoaded => "class not loaded",
            SubstitutionErrorKind::IncompatibleThreadState => "incompatible thread state",
            SubstitutionErrorKind::InvalidType => "invalid type",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_jdwp::wire::ERROR_INVALID_SLOT;
    use pretty_assertions::assert_eq;

    #[test]
    fn substitution_codes_are_classified() {
        let kind = |code| SubstitutionErrorKind::classify(&JdwpError::VmError(code));
        assert_eq!(kind(ERROR_INVALID_CLASS), Some(SubstitutionErrorKind::ClassNotLoaded));
        assert_eq!(kind(ERROR_CLASS_NOT_PREPARED), Some(SubstitutionErrorKind::ClassNotLoaded));
        assert_eq!(
            kind(ERROR_THREAD_NOT_SUSPENDED),
            Some(SubstitutionErrorKind::IncompatibleThreadState)
        );
        assert_eq!(kind(ERROR_OPAQUE_FRAME), Some(SubstitutionErrorKind::IncompatibleThreadState));
        assert_eq!(kind(ERROR_TYPE_MISMATCH), Some(SubstitutionErrorKind::InvalidType));
        assert_eq!(kind(ERROR_INVALID_SLOT), None);
        assert_eq!(SubstitutionErrorKind::classify(&JdwpError::Timeout), None);
    }

    #[test]
    fn unclassified_write_failures_stay_transport_errors() {
        let err = TraceError::substitution(JdwpError::ConnectionClosed);
        assert_eq!(err.category(), ErrorCategory::Transport);

        let err = TraceError::substitution(JdwpError::VmError(ERROR_OPAQUE_FRAME));
        assert_eq!(err.category(), ErrorCategory::Substitution);
        assert!(err.to_string().contains("incompatible thread state"), "{err}");
    }
}
