//! Shared helpers for the service binaries.

pub mod bootstrap;
pub mod retry;
