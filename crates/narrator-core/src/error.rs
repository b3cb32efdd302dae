//! Error taxonomy shared by the engine and the HTTP layer.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input. Reported before any model interaction.
    #[error("{0}")]
    Validation(String),

    /// The inference call failed. Isolated to one item.
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// The one-time model load failed. Sticky until process restart.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Writing the audio file failed. Treated like a synthesis failure.
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Model file download failed.
    #[error("download failed: {0}")]
    Download(String),

    /// A request arrived after the shutdown hook released the model.
    #[error("server is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// HTTP status code this error is reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::ShuttingDown => 503,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::validation("No text provided").status_code(), 400);
        assert_eq!(Error::synthesis("boom").status_code(), 500);
        assert_eq!(Error::model_load("missing weights").status_code(), 500);
        assert_eq!(Error::ShuttingDown.status_code(), 503);
    }

    #[test]
    fn validation_message_is_bare() {
        assert_eq!(Error::validation("No text provided").to_string(), "No text provided");
    }

    #[test]
    fn io_error_names_path() {
        let err = Error::io(
            "/nope/out.wav",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/nope/out.wav"));
    }
}
