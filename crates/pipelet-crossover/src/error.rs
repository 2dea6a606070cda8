use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrossoverError>;

#[derive(Debug, Error)]
pub enum CrossoverError {
    #[error("transport closed")]
    Closed,

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    Protocol { local: u32, remote: u32 },

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("no supported transport in {0:?}")]
    UnsupportedTransport(Vec<String>),

    #[error("graph: {0}")]
    Graph(#[from] pipelet_operators::OpError),
}

impl From<serde_json::Error> for CrossoverError {
    fn from(e: serde_json::Error) -> Self {
        CrossoverError::Frame(e.to_string())
    }
}
