use validator::ValidationErrors;
use vmdash_node::NodeError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation error in request body")]
    InvalidEntity(#[from] ValidationErrors),

    #[error("{0}")]
    UnprocessableEntity(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ExternalTool(String),

    #[error("internal server error")]
    Internal(NodeError),
}

impl From<NodeError> for Error {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::NotFound(msg) => Error::NotFound(msg),
            NodeError::InvalidArgument(msg) => Error::UnprocessableEntity(msg),
            NodeError::Conflict(msg) => Error::Conflict(msg),
            NodeError::ExternalTool(msg) => Error::ExternalTool(msg),
            other => Error::Internal(other),
        }
    }
}
