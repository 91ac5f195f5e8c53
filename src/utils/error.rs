//! Error Handling Module
//!
//! Defines the error type for the chest X-ray training library.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for chest X-ray training operations
#[derive(Error, Debug)]
pub enum XrayError {
    /// The `--train` glob matched no files
    #[error("No record files match pattern '{0}'")]
    NoInputFiles(String),

    /// Invalid glob pattern
    #[error("Invalid glob pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    /// A record ended before its declared length
    #[error("Truncated record at byte offset {offset}")]
    TruncatedRecord { offset: u64 },

    /// A record checksum did not match
    #[error("Corrupted record at byte offset {offset}: {what} checksum mismatch")]
    CorruptedRecord { offset: u64, what: &'static str },

    /// A record in a specific file failed to read or decode
    #[error("{}: record {index}: {source}", path.display())]
    InRecord {
        path: PathBuf,
        index: usize,
        #[source]
        source: Box<XrayError>,
    },

    /// Malformed `tf.train.Example` payload
    #[error("Malformed example: {0}")]
    Example(String),

    /// Image decode failure
    #[error("Image decode failed: {0}")]
    Image(#[from] image::ImageError),

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error with model operations
    #[error("Model error: {0}")]
    Model(String),

    /// Error with training
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Path not found
    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),
}

/// Convenience Result type for chest X-ray training operations
pub type Result<T> = std::result::Result<T, XrayError>;

impl From<prost::DecodeError> for XrayError {
    fn from(e: prost::DecodeError) -> Self {
        XrayError::Example(e.to_string())
    }
}

impl From<serde_json::Error> for XrayError {
    fn from(e: serde_json::Error) -> Self {
        XrayError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for XrayError {
    fn from(e: toml::de::Error) -> Self {
        XrayError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for XrayError {
    fn from(e: toml::ser::Error) -> Self {
        XrayError::Serialization(e.to_string())
    }
}

impl XrayError {
    /// Attach the file and record index a failure came from
    pub fn in_record(self, path: impl Into<PathBuf>, index: usize) -> Self {
        XrayError::InRecord {
            path: path.into(),
            index,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = XrayError::NoInputFiles("data/*.tfrecord".to_string());
        assert_eq!(
            err.to_string(),
            "No record files match pattern 'data/*.tfrecord'"
        );

        let err = XrayError::CorruptedRecord {
            offset: 12,
            what: "data",
        };
        assert!(err.to_string().contains("offset 12"));
    }

    #[test]
    fn test_in_record_context() {
        let err = XrayError::TruncatedRecord { offset: 40 }.in_record("train-0.tfrecord", 3);
        let msg = err.to_string();
        assert!(msg.contains("train-0.tfrecord"));
        assert!(msg.contains("record 3"));
        assert!(msg.contains("offset 40"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: XrayError = io.into();
        assert!(matches!(err, XrayError::Io(_)));
    }
}
