use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("harvest error: {0}")]
    Harvester(#[from] inventory_harvester::HarvesterError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML serialization failed: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("{rejected} of {total} repositories could not be written")]
    SinkRejected { rejected: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
