use thiserror::Error;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("store engine error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("layout serialization error: {0}")]
    Layout(#[from] serde_json::Error),

    #[error("row has {got} values but store layout has {expected} columns")]
    ColumnMismatch { expected: usize, got: usize },

    #[error("corrupt canonical row: {0}")]
    CorruptRow(String),

    #[error("no duplicate-check store for rule {0}")]
    StoreNotFound(uuid::Uuid),

    #[error("store internal error: {0}")]
    Internal(String),
}
