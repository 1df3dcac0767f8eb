use thiserror::Error;

/// No error crosses a driver boundary: every driver catches its own
/// transport failures and either retries or marks itself disconnected
/// rather than propagating.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("bad expression: {0}")]
    BadExpression(String),

    #[error("error evaluating expression: {0}")]
    Eval(String),

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("tag is read-only: {0}")]
    ReadOnly(String),

    #[error("malformed websocket message: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("unknown tag: {0}")]
    UnknownTag(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
