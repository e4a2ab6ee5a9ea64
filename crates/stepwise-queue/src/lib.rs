//! Durable-in-process job queue with retries, dedupe, and stage chaining.
//!
//! Stages never call each other directly: a completed stage returns the
//! payloads of its follow-up jobs and the [`Dispatcher`] enqueues them.
//! Every payload carries a dedupe key, so re-submitting work that is
//! already queued, running, or done is a no-op.

pub mod dispatch;

pub use dispatch::{backoff_delay, Dispatcher, QueueOptions, StageRunner, StatusSink};
