use thiserror::Error;

pub type Result<T> = std::result::Result<T, TxError>;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("unknown transaction '{0}'")]
    Unknown(String),

    #[error("transaction '{0}' is already closed")]
    Closed(String),
}
