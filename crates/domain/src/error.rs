use thiserror::Error;

/// Domain-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker connection error: {0}")]
    Connect(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("insert error: {0}")]
    Insert(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
