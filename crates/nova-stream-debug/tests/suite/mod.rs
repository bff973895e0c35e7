// Consolidated integration test suite, compiled by `tests/tests.rs`.
mod attach;
mod chains;
mod exceptions;
mod lifecycle;
mod qualifier;
