use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentryError {
    #[error("Image fetch failed for {src}: {reason}")]
    Fetch { src: String, reason: String },

    /// The locator can never be fetched; retrying won't help.
    #[error("Image fetch rejected for {src}: {reason}")]
    FetchRejected { src: String, reason: String },

    #[error("Image decode failed for {src}: {reason}")]
    Decode { src: String, reason: String },

    #[error("Model load failed for {label}: {reason}")]
    ModelLoad { label: String, reason: String },

    #[error("Model not ready: {0}")]
    NotReady(String),

    #[error("Inference failed on {label}: {reason}")]
    Inference { label: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Channel closed: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SentryError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SentryError::NotReady(_) | SentryError::Fetch { .. })
    }

    pub fn fetch(src: &str, reason: impl ToString) -> Self {
        SentryError::Fetch {
            src: src.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn fetch_rejected(src: &str, reason: impl ToString) -> Self {
        SentryError::FetchRejected {
            src: src.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(src: &str, reason: impl ToString) -> Self {
        SentryError::Decode {
            src: src.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn inference(label: &str, reason: impl ToString) -> Self {
        SentryError::Inference {
            label: label.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<sled::Error> for SentryError {
    fn from(err: sled::Error) -> Self {
        SentryError::Cache(err.to_string())
    }
}

impl From<bincode::Error> for SentryError {
    fn from(err: bincode::Error) -> Self {
        SentryError::Cache(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SentryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_ready_and_fetch_are_recoverable() {
        assert!(SentryError::NotReady("weapons".into()).is_recoverable());
        assert!(SentryError::fetch("http://x/a.png", "timeout").is_recoverable());
        assert!(!SentryError::fetch_rejected("chrome://x", "unsupported scheme").is_recoverable());
        assert!(!SentryError::decode("http://x/a.png", "bad header").is_recoverable());
        assert!(!SentryError::Channel("request receiver dropped".into()).is_recoverable());
        assert!(!SentryError::Config("threshold".into()).is_recoverable());
    }

    #[test]
    fn messages_carry_context() {
        let err = SentryError::inference("pistols", "shape mismatch");
        assert_eq!(err.to_string(), "Inference failed on pistols: shape mismatch");
    }
}
