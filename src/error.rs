//! Crate-wide error types.
//!
//! Per the pipeline's error-handling design, almost nothing here ever
//! reaches a caller: drops, restores, and disables are handled internally
//! (see `dispatcher`). These types cover the few boundaries that *can*
//! fail visibly — configuration validation and `Processor::close`.

use thiserror::Error;

/// Failure building an [`crate::config::EventsConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("capacity must be greater than zero")]
    ZeroCapacity,
    #[error("worker_count must be at least 1")]
    ZeroWorkers,
    #[error("flush_interval_millis must be greater than zero")]
    ZeroFlushInterval,
    #[error("events_uri must not be empty")]
    EmptyEventsUri,
}

/// Failure surfaced from [`crate::processor::Processor::close`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("event sender failed to close: {0}")]
    SenderClose(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
