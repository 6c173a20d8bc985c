//! Error types for heater-hub

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serial error: {0}")]
    Serial(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Serial(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Transport("modem missing".to_string());
        assert!(err.to_string().contains("modem missing"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_nix() {
        let err: Error = nix::Error::ENOENT.into();
        assert!(matches!(err, Error::Serial(_)));
    }
}
