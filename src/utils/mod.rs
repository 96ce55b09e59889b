//! The `utils` module provides shared definitions used across `tidings`.
//!
//! It centralizes the error taxonomy every transport reports through and the
//! logging bootstrap used by the binary and by tests.

pub mod error;
pub mod logging;
