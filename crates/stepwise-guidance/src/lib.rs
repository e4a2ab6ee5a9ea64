//! AI guidance: risk ratings and review checklists for steps and sessions.
//!
//! The model is advisory. A response that cannot be parsed gets one
//! reformat retry; if that fails too, the caller receives a placeholder
//! guidance with [`RiskLevel::Unknown`](stepwise_core::RiskLevel) instead
//! of an error, so a flaky model never blocks a review session.

pub mod client;
pub mod generate;
pub mod prompt;

pub use client::{ChatMessage, GuidanceModel, ModelClient, Role};
pub use generate::{generate_session_guidance, generate_step_guidance, unavailable_guidance};
