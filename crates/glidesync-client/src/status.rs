//! Progress and status reporting
//!
//! `Status` is threaded through long-running operations as an explicit
//! argument. All methods have defaults so implementations only override
//! what they surface; the reconcilers never depend on a concrete type.

/// Pluggable progress sink.
pub trait Status: Send + Sync {
    fn log(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}

    fn debug(&self, _message: &str) {}

    /// Announce `n` more units of upcoming work.
    fn add(&self, _n: u64) {}

    /// Mark `n` units of work finished.
    fn done(&self, _n: u64) {}

    fn set_stages(&self, _n: u64) {}

    fn done_stage(&self) {}
}

/// Status sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatus;

impl Status for NullStatus {}

/// Status sink that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatus;

impl Status for TracingStatus {
    fn log(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn debug(&self, message: &str) {
        tracing::debug!("{message}");
    }
}
