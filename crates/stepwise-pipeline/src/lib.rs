//! Stage orchestration: wires the host, store, clustering, context, and
//! guidance crates behind the job queue.
//!
//! Each pipeline stage is one [`JobPayload`](stepwise_core::JobPayload)
//! variant. Stages communicate only through the store and through the
//! follow-up payloads they return; the dispatcher owns every status
//! transition.

pub mod host;
pub mod pipeline;
pub mod regen;
pub mod render;
pub mod store;

pub use host::{parse_pr_reference, GitHubHost, PrInfo, RepoHost};
pub use pipeline::Pipeline;
pub use regen::request_regeneration;
pub use render::{collect_view, render, SessionView, StepView};
pub use store::{MemoryStore, Store};
