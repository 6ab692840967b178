use crate::inventory::ObjectKind;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{kind} not found: {path}")]
    NotFound { kind: ObjectKind, path: String },

    #[error("{0} is already in the requested state")]
    AlreadyInState(String),

    #[error("task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("api error: status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("session error: {0}")]
    Session(String),

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn not_found(kind: ObjectKind, path: impl Into<String>) -> Self {
        GatewayError::NotFound {
            kind,
            path: path.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }
}
