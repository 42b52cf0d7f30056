use thiserror::Error;
use wager_core::WagerError;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("SMS gateway failure: {0}")]
    Sms(String),

    #[error("In-app delivery failure: {0}")]
    InApp(String),

    #[error("Ticket desk failure: {0}")]
    Ticket(String),

    #[error("Backup I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backup encryption error: {0}")]
    Crypto(String),

    #[error("Malformed backup: {0}")]
    Format(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] WagerError),
}

impl AdapterError {
    /// Collaborator failures surface to the engine as external-dependency errors.
    pub fn into_engine(self, dependency: &str) -> WagerError {
        match self {
            Self::Engine(err) => err,
            other => WagerError::External {
                dependency: dependency.to_string(),
                message: other.to_string(),
            },
        }
    }
}
