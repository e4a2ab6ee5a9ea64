//! Core types, configuration, and error handling for the Stepwise pipeline.
//!
//! This crate provides the shared foundation used by all other Stepwise
//! crates:
//! - [`StepwiseError`] — unified error type using `thiserror`, with the
//!   retryable/terminal classification the dispatcher relies on
//! - [`StepwiseConfig`] — configuration loaded from `.stepwise.toml`
//! - The review data model: [`ReviewSession`], [`PullRequestSnapshot`],
//!   [`Hunk`], [`ReviewStep`], [`ContextPack`], [`Guidance`], [`Job`]

mod config;
mod error;
mod types;

pub use config::{
    ClusterConfig, ContextConfig, HostConfig, ModelConfig, QueueConfig, StepwiseConfig,
};
pub use error::StepwiseError;
pub use types::{
    ChangeType, ContextPack, Guidance, GuidanceTarget, Hunk, Job, JobPayload, JobStatus, JobType,
    LineRange, Location, OutputFormat, PullRequestSnapshot, ReviewSession, ReviewStep, RiskLevel,
    ScopeEntry, SessionStatus, StepStatus, SymbolContext,
};

/// A convenience `Result` type for Stepwise operations.
pub type Result<T> = std::result::Result<T, StepwiseError>;
