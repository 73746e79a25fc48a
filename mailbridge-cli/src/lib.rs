//! Shared pieces of the mailbridge binaries.

pub mod logging;

pub use logging::init_tracing;
