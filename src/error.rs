use std::io;

use thiserror::Error;

/// Errors thay may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// The modem's serial device could not be opened.
    /// Nothing else works without it, so this is fatal at startup.
    #[error("The modem at `{path}` is unavailable. Problem: {problem}")]
    DeviceUnavailable {
        /// The device path that was tried.
        path: String,

        /// What the OS said.
        problem: String,
    },

    /// Reading from or writing to the line failed.
    #[error("Underlying IO problem")]
    Io(#[from] io::Error),

    /// A single exchange with the modem did not complete in time.
    #[error("The modem did not answer `{0}` in time")]
    Timeout(String),

    /// The message log could not be written or read.
    #[error("Message store problem: {0}")]
    Store(String),

    /// The configuration is not usable.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// An SMS which cannot be put on the line as asked.
    #[error("Invalid SMS: {0}")]
    InvalidRequest(String),

    /// A background task ended without an answer.
    #[error("Task failed: {0}")]
    Task(String),

    /// Bad json.
    #[error("Problem with JSON")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get the bad configuration problem, if that is the variant.
    pub fn try_into_bad_config(self) -> std::result::Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Self::Io(e.into())
    }
}

/// Results in this library.
pub type Result<T> = std::result::Result<T, Error>;
