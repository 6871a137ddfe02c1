//! Error types for the chest disease classifier pipeline.

use thiserror::Error;

/// Main error type shared by every pipeline stage.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file missing, empty or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Image decoding or resizing failed
    #[error("Image processing error: {0}")]
    Image(String),

    /// Model construction, save or load failed
    #[error("Model error: {0}")]
    Model(String),

    /// Dataset layout error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Dataset download failed
    #[error("Download error: {0}")]
    Download(String),

    /// Archive could not be extracted
    #[error("Archive error: {0}")]
    Archive(String),

    /// Experiment tracking service rejected a request or was unreachable
    #[error("Tracking error: {0}")]
    Tracking(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::Archive(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Tracking(err.to_string())
    }
}

/// Specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Model("record unreadable".to_string());
        assert_eq!(err.to_string(), "Model error: record unreadable");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_yaml_error_is_config_error() {
        let yaml_err = serde_yaml::from_str::<Vec<u32>>("{ not: a list").unwrap_err();
        let err: Error = yaml_err.into();
        assert!(matches!(err, Error::Config(_)));
    }
}
