//! Harness error types.
//!
//! Provisioning and readiness errors abort a scenario. Teardown failures never
//! abort an unwind; they are collected into a [`TeardownReport`] and surfaced
//! once the stack is empty.

use crate::config::ConfigError;
use crate::teardown::{TeardownCategory, TeardownReport};
use std::time::Duration;
use thiserror::Error;

/// Harness error type.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A collaborator call (helm, kubectl, vault) failed outright.
    #[error("Provisioning failed during {operation}: {message}")]
    Provisioning { operation: String, message: String },

    /// A readiness condition never held within its timeout.
    #[error(
        "Timed out after {elapsed:?} waiting for {description}: wanted {target}, last observed {last_observed}"
    )]
    Timeout {
        description: String,
        target: String,
        last_observed: String,
        elapsed: Duration,
    },

    /// One or more cleanup actions failed; the rest of the stack still ran.
    #[error("Teardown incomplete: {0}")]
    Teardown(TeardownReport),

    /// The scenario failed and teardown also left failures behind.
    #[error("{cause} (teardown also failed: {teardown})")]
    Aborted {
        cause: Box<HarnessError>,
        teardown: TeardownReport,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Spawning or talking to a child process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cluster output could not be decoded.
    #[error("JSON decoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Shorthand for a [`HarnessError::Provisioning`] error.
    pub fn provisioning(operation: impl Into<String>, message: impl Into<String>) -> Self {
        HarnessError::Provisioning {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from a readiness wait.
    pub fn is_timeout(&self) -> bool {
        match self {
            HarnessError::Timeout { .. } => true,
            HarnessError::Aborted { cause, .. } => cause.is_timeout(),
            _ => false,
        }
    }

    /// Teardown failures carried by this error, if any.
    pub fn teardown_report(&self) -> Option<&TeardownReport> {
        match self {
            HarnessError::Teardown(report) | HarnessError::Aborted { teardown: report, .. } => {
                Some(report)
            }
            _ => None,
        }
    }
}

/// A single cleanup action that failed or panicked during unwind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category} teardown failed: {message}")]
pub struct TeardownActionError {
    pub category: TeardownCategory,
    pub message: String,
}
