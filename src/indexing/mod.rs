//! Indexing pipeline: queue, worker pool and full rescans.

pub mod pipeline;
pub mod queue;

pub use pipeline::IndexPipeline;
pub use pipeline::ProgressSnapshot;
pub use queue::IndexJob;
pub use queue::IndexOptions;
pub use queue::IndexQueue;
pub use queue::JobKind;
