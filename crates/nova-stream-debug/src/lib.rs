//! Runtime tracing of Java stream chains over JDWP.
//!
//! Given a [`StreamChain`] about to be evaluated on a suspended thread, the
//! tracer places method entry/exit requests on the JDK stream methods the
//! chain calls, injects `peek` collectors between stages as the program runs,
//! and reads back what every stage saw. The result arrives as a
//! [`ChainTrace`] through a [`TracingCallback`].
//!
//! [`TraceManager`] owns the event loop; [`DebugTarget`] is the slice of JDWP
//! it drives, implemented for [`nova_jdwp::JdwpClient`].

pub mod bridge;
pub mod callback;
pub mod chain;
pub mod error;
pub mod formatter;
pub mod handlers;
pub mod helpers;
pub mod requests;
pub mod resolve;
pub mod signature;
pub mod target;
pub mod tracer;

#[cfg(any(test, feature = "test-support"))]
pub mod fake_vm;

pub use bridge::{Mirror, ObjectStorage, ValueBridge};
pub use callback::{EvaluationContext, FailureKey, TraceFailure, TraceReport, TracingCallback};
pub use chain::{ElementType, QualifierExpression, StreamCall, StreamChain, TerminatorCall};
pub use error::{ErrorCategory, Result, TraceError};
pub use formatter::{
    ChainTrace, StageTrace, TerminalPayload, TraceOutcome, TraceValue, TracedValue,
};
pub use helpers::{BytecodeProvider, DirectoryBytecodeProvider, InMemoryBytecodeProvider};
pub use resolve::{BreakpointResolver, JdkStreamResolver, StreamChainBreakpointPlaces};
pub use signature::MethodSignature;
pub use target::DebugTarget;
pub use tracer::{attach, TraceManager, TraceRequest, TraceState, TracerOptions};
