//! Utilities for testing code built on the messenger: they are used by this crate's own tests,
//!  and they are exported for application tests.
//!
//! They are part of the crate's regular (non-#[cfg(test)]) code so that applications can use them
//!  from their own test code.

pub mod frames;
pub mod message;
pub mod net;
pub mod node;
