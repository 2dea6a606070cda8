use thiserror::Error;

use pipelet_operators::OpError;
use pipelet_query::QueryError;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("branch build failed: {0}")]
    Build(String),

    #[error("template: {0}")]
    Template(String),

    #[error(transparent)]
    Graph(#[from] OpError),

    #[error(transparent)]
    Query(#[from] QueryError),
}
