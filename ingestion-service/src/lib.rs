pub mod clock;
pub mod config;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use pipeline::{IngestOutcome, Pipeline, PipelineError};
