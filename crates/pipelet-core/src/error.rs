use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised while building or fingerprinting values.
#[derive(Debug, Error)]
pub enum Error {
    /// A value was not a JSON object.
    #[error("not a value: {0}")]
    Value(String),

    #[error("cannot (de)serialize: {0}")]
    Serde(String),

    /// Canonical encoding for a digest failed.
    #[error("cannot fingerprint: {0}")]
    Hash(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}
