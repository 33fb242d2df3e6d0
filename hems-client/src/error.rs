/// Failures surfaced by a [`crate::TimeSeriesStore`] implementation.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store rejected the configured credentials")]
    Unauthorized,
    #[error("points outside the retention window: {message}")]
    OutOfRetention { message: String },
    #[error("store returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid point: {0}")]
    InvalidPoint(String),
    #[error("failed to decode store response: {0}")]
    Decode(String),
    #[error("store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Network or server-side availability failures. These are worth another
    /// attempt later; everything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
