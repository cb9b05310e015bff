use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error kinds reported to the host. Script-facing failures carry the same
/// code in their `code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The deadline elapsed before the script finished. The script may still be running.
    Timeout,
    InvalidInput,
    FileNotFound,
    HttpError,
    FilesystemError,
    BrowserError,
    DocumentError,
    ImageError,
    SystemError,
    /// The guest script threw.
    ExecutionError,
    /// The sandbox was closed or its cancellation root fired.
    Cancelled,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::HttpError => "HTTP_ERROR",
            ErrorCode::FilesystemError => "FILESYSTEM_ERROR",
            ErrorCode::BrowserError => "BROWSER_ERROR",
            ErrorCode::DocumentError => "DOCUMENT_ERROR",
            ErrorCode::ImageError => "IMAGE_ERROR",
            ErrorCode::SystemError => "SYSTEM_ERROR",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct SandboxError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<Cause>,
}

pub type Result<T> = std::result::Result<T, SandboxError>;

pub const SESSION_CLOSED: &str = "browser session is closed";

impl SandboxError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!(
                "script did not finish within {}ms; evaluation continues in the background",
                timeout.as_millis()
            ),
        )
    }

    pub fn session_closed() -> Self {
        Self::new(ErrorCode::BrowserError, SESSION_CLOSED)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn browser(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BrowserError, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SystemError, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for a deadline expiry. The evaluation it refers to was not stopped.
    pub fn is_timed_out(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    pub fn is_session_closed(&self) -> bool {
        self.code == ErrorCode::BrowserError && self.message == SESSION_CLOSED
    }

    /// Structured failure as seen from inside a script.
    pub fn to_script_value(&self) -> Value {
        json!({
            "success": false,
            "error": self.message,
            "code": self.code,
        })
    }
}

pub(crate) fn io_code(kind: std::io::ErrorKind) -> ErrorCode {
    match kind {
        std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        _ => ErrorCode::FilesystemError,
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::new(io_code(err.kind()), err.to_string()).with_cause(err)
    }
}
