use crate::transfer::ledger::LedgerError;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Network and filesystem failures are worth another attempt; everything
    /// else (auth, config, bad payloads, cancellation) fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http(_) | SyncError::Io(_) => true,
            SyncError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
