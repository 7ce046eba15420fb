use thiserror::Error;

use crate::browser::BrowserError;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] Box<ureq::Error>),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Browser error: {0}")]
    BrowserError(#[from] BrowserError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid cron expression: {0}")]
    CronError(String),

    #[error("Action failed: {0}")]
    ActionError(String),

    #[error("Extraction failed: {0}")]
    ExtractionError(String),

    #[error("Notification failed: {0}")]
    NotificationError(String),

    #[error("Status server error: {0}")]
    ServerError(String),

    #[error("Watch not found: {0}")]
    WatchNotFound(String),
}

impl From<ureq::Error> for WatchError {
    fn from(e: ureq::Error) -> Self {
        WatchError::HttpError(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
