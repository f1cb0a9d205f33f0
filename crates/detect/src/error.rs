use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    /// Fatal for the rule's run; surfaced to the operator, never retried
    /// silently.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("extraction failed: {0}")]
    Source(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("execution tracking failed: {0}")]
    Tracker(String),

    #[error("duplicate check failed: {0}")]
    Dedup(#[from] argus_dedup::DedupError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
