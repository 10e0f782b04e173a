use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaperwatchError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("query syntax error: {0}")]
    QuerySyntax(String),

    #[error("LLM provider error: {0}")]
    Llm(String),

    /// Store unreachable or a transaction failed. Fatal for the run:
    /// dedup/history correctness cannot be guaranteed without the store.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PaperwatchError>;
