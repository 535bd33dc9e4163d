/// Core error type for the notifier.
///
/// Adapter crates map their specific errors into this type so the bot and the
/// redirect server can handle failures consistently (user-facing vs logged).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("mail error: {0}")]
    Mail(String),

    #[error("oauth error: {0}")]
    OAuth(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
