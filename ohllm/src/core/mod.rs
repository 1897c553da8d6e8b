//! Deterministic, pure logic.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod changes;
pub mod failure;
pub mod naming;
pub mod redaction;
pub mod summary;
pub mod types;
