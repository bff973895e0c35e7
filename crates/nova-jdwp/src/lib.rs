//! Java Debug Wire Protocol (JDWP) client for Nova.
//!
//! `nova-stream-debug` consumes this crate to drive a suspended JVM: it
//! installs method entry/exit requests, invokes methods inside the debuggee,
//! rewrites stack frame slots and forces early returns while a stream chain
//! is being traced.
//!
//! Only the subset of JDWP that the tracer needs is implemented. Everything
//! lives in [`wire`]; the most common types are re-exported at the crate root.

pub mod wire;

pub use wire::{
    ClassInfo, EventModifier, FrameId, FrameInfo, JdwpClient, JdwpClientConfig, JdwpError,
    JdwpEvent, JdwpIdSizes, JdwpValue, Location, MethodId, MethodInfo, ObjectId,
    ReferenceTypeId, Result, ThreadId, VariableInfo,
};

/// Size of a JDWP packet header: `length(4) id(4) flags(1) cmdset/errcode(2)`.
pub const JDWP_HEADER_LEN: usize = 11;
