/// Shared error type used across all browserd crates.
///
/// Every variant except `Fatal` is reported in-band on the wire; the
/// connection stays open and the daemon keeps running.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("Unauthorized - invalid or missing token")]
    Auth,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("failed to load feature {feature}: {message}")]
    FeatureLoad { feature: String, message: String },

    #[error("{0}")]
    Handler(String),

    #[error("plugin {0} timed out after {1}s")]
    PluginTimeout(String, u64),

    #[error("plugin: {0}")]
    Plugin(String),

    #[error("storage state rejected: {0}")]
    StorageCorruption(String),

    #[error("Session ID mismatch. Manager session: {manager}, requested: {requested}")]
    SessionMismatch { manager: String, requested: String },

    #[error("browser driver: {0}")]
    Driver(String),

    #[error("invalid capacity: {0} (must be > 0)")]
    InvalidCapacity(usize),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable code carried in the wire envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Config(_) => "config",
            Error::Auth => "auth",
            Error::Parse(_) => "parse",
            Error::UnknownCommand(_) => "unknown_command",
            Error::FeatureLoad { .. } => "feature_load",
            Error::Handler(_) => "handler_domain",
            Error::PluginTimeout(..) => "plugin_timeout",
            Error::Plugin(_) => "plugin_hook_failure",
            Error::StorageCorruption(_) => "storage_corruption",
            Error::SessionMismatch { .. } => "session_mismatch",
            Error::Driver(_) => "driver",
            Error::InvalidCapacity(_) => "invalid_capacity",
            Error::Fatal(_) => "fatal",
            Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
