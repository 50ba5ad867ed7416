//! The message pipeline: admission control, persistence, room-list caching
//! and the background completion workers.

pub mod admission;
pub mod cache;
pub mod clock;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{CacheError, PipelineError, ProviderError};
pub use pipeline::{Pipeline, PipelineConfig};
