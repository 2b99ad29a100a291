pub mod config;
pub mod error;
pub mod sink;
pub mod worker;

pub use config::WorkerConfig;
pub use error::PipelineError;
pub use sink::{FileSink, RepositoryStatusFile, RunSummaryFile};
pub use worker::{run_harvest, run_harvest_worker};
