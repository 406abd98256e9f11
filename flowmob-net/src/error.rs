//! Error types for the flow routing engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::binding::FlowId;

/// Errors raised by binding registry mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("Flow {0} not found")]
    UnknownFlow(FlowId),

    #[error("Renumbering {entries} entries from {start} in steps of {increment} overflows u32")]
    PriorityOverflow {
        entries: usize,
        start: u32,
        increment: u32,
    },
}

/// Errors raised while parsing selectors and loading router configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    #[error("Priority must be non-zero ({0})")]
    ZeroPriority(String),

    #[error("Unknown interface '{0}'")]
    UnknownInterface(String),

    #[error("Duplicate interface '{0}'")]
    DuplicateInterface(String),

    #[error("Binding {0} has no targets")]
    NoTargets(usize),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Errors returned by the engine handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Flow engine has stopped")]
    Stopped,

    #[error(transparent)]
    Binding(#[from] BindingError),
}

/// Errors raised while replaying an event script.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("step offset {at_ms}ms is out of range")]
    OffsetOutOfRange { at_ms: u64 },
}
