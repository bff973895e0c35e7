//! Wire-level JDWP implementation.
//!
//! This module speaks the actual JDWP binary protocol over TCP. It is designed
//! to be async-capable (`tokio`) and cancellation-aware.

mod client;
mod codec;
pub mod types;

pub use client::{EventModifier, JdwpClient, JdwpClientConfig};
pub use codec::{class_name_to_signature, signature_to_tag, JdwpReader, JdwpWriter};
pub use types::*;

// The wire-protocol mock server is only needed for tests and downstream integration suites.
#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;

#[cfg(test)]
mod tests;
