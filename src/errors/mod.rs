pub mod types;

pub use types::{AppError, BalancerError, PipelineError, SorterError, SourceError, StreamStatus};
