//! Historical comparison pipeline.
//!
//! Stages run strictly in order for one submitted report:
//! history selection → context assembly → reasoning invocation →
//! result parsing → recording. Selection and recording touch storage,
//! invocation touches the network, everything else is pure.

pub mod cache;
pub mod client;
pub mod context;
pub mod history;
pub mod invoker;
pub mod orchestrator;
pub mod parser;
pub mod recorder;
pub mod templates;
pub mod traits;

pub use cache::*;
pub use client::*;
pub use context::*;
pub use history::*;
pub use invoker::*;
pub use orchestrator::*;
pub use parser::*;
pub use recorder::*;
pub use templates::*;
pub use traits::*;

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::models::{FailureKind, ValidationError};

/// Pipeline failures. `ContextOverflow` is recorded as a degraded comparison
/// by the orchestrator; when any other variant is returned no record exists.
#[derive(Error, Debug)]
pub enum ComparisonError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] DatabaseError),

    #[error("Invalid report: {0}")]
    Validation(#[from] ValidationError),

    #[error("Structured report content needs {required} characters, context budget is {budget}")]
    ContextOverflow { required: usize, budget: usize },

    #[error("Comparison run cancelled before its record was written")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Classification used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasoningFailureKind {
    Timeout,
    Unauthorized,
    RateLimited,
    ServerError,
    NetworkError,
}

/// One failed call to the reasoning engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReasoningFailure {
    #[error("Reasoning engine timed out: {0}")]
    Timeout(String),

    #[error("Reasoning engine rejected the credential (status {status})")]
    Unauthorized { status: u16 },

    #[error("Reasoning engine rate limit reached")]
    RateLimited,

    #[error("Reasoning engine error (status {status:?}): {body}")]
    ServerError { status: Option<u16>, body: String },

    #[error("Reasoning engine unreachable: {0}")]
    NetworkError(String),
}

impl ReasoningFailure {
    pub fn kind(&self) -> ReasoningFailureKind {
        match self {
            Self::Timeout(_) => ReasoningFailureKind::Timeout,
            Self::Unauthorized { .. } => ReasoningFailureKind::Unauthorized,
            Self::RateLimited => ReasoningFailureKind::RateLimited,
            Self::ServerError { .. } => ReasoningFailureKind::ServerError,
            Self::NetworkError(_) => ReasoningFailureKind::NetworkError,
        }
    }
}

/// Outcome of an invocation that produced no response.
/// Absorbed into a degraded record by the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("Reasoning unavailable after {attempts} attempt(s): {last}")]
    Unavailable { attempts: u32, last: ReasoningFailure },

    #[error("Reasoning rejected after {attempts} attempt(s): {last}")]
    Rejected { attempts: u32, last: ReasoningFailure },
}

impl InvocationError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Unavailable { .. } => FailureKind::ReasoningUnavailable,
            Self::Rejected { .. } => FailureKind::ReasoningRejected,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Unavailable { attempts, .. } | Self::Rejected { attempts, .. } => *attempts,
        }
    }
}
