use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Business rule violation: {0}")]
    Business(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Event bus is shut down")]
    BusClosed,

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

impl Error {
    /// Stable machine-readable code carried in domain failure events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_INVALID",
            Error::WebSocket(_) => "WS_ERROR",
            Error::Json(_) => "PARSE_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Url(_) => "URL_INVALID",
            Error::Exchange { .. } => "EXCHANGE_ERROR",
            Error::Auth(_) => "AUTH_FAILED",
            Error::Business(_) => "BUSINESS_RULE",
            Error::Connection(_) => "CONNECTION_FAILED",
            Error::Database(_) => "DATABASE_ERROR",
            Error::BusClosed => "BUS_CLOSED",
            Error::UnknownAccount(_) => "UNKNOWN_ACCOUNT",
            Error::Execution(_) => "EXECUTION_ERROR",
        }
    }

    /// Whether a REST failure is worth retrying with a fresh signature.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e
                .status()
                .map_or(true, |s| s.is_server_error() || s.as_u16() == 429),
            Error::Exchange { code, .. } => *code <= -1000 && *code > -1100,
            Error::Connection(_) | Error::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
