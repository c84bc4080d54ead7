//! Runtime error types

use thiserror::Error;

/// Pipeline, queue and scheduler errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Duplicate pipeline: {0}")]
    DuplicatePipeline(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Duplicate queue: {0}")]
    DuplicateQueue(String),

    #[error("Queue closed: {0}")]
    QueueClosed(String),

    #[error("Pipeline {pipeline} expects arguments of type {expected}")]
    ArgumentMismatch {
        pipeline: String,
        expected: &'static str,
    },

    #[error("Unknown agent implementation: {0}")]
    UnknownAgent(String),

    #[error("Agent {agent} has no method {method}")]
    UnknownMethod { agent: String, method: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
