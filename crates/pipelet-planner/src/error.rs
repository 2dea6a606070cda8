use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlanError>;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("node '{0}' has no pipelet")]
    MissingPipelet(String),

    #[error("node '{node}' reads from unknown node '{input}'")]
    UnknownInput { node: String, input: String },

    #[error("subscription on unknown node '{0}'")]
    UnknownSubscription(String),

    #[error("node '{node}' uses unknown pipelet '{pipelet}'")]
    UnknownPipelet { node: String, pipelet: String },
}
