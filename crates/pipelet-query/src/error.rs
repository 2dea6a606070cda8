use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid term: {0}")]
    InvalidTerm(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{0}' is missing its operand")]
    MissingOperand(String),

    #[error("dangling '{0}' in expression")]
    Dangling(String),

    #[error("invalid regular expression: {0}")]
    Regex(String),

    #[error("serde: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Serde(e.to_string())
    }
}

impl From<regex::Error> for QueryError {
    fn from(e: regex::Error) -> Self {
        QueryError::Regex(e.to_string())
    }
}
