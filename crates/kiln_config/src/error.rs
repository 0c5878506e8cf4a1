//! Error types for configuration loading and validation.

/// Errors that can occur when loading or validating a `kiln.toml` configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    IoError {
        /// Path of `kiln.toml`.
        path: std::path::PathBuf,
        /// What the OS reported.
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A size limit string is not a byte count with an optional `K`/`M`/`G`/`T` suffix.
    #[error("invalid {setting}: '{value}'")]
    InvalidSizeLimit {
        /// The setting or environment variable the value came from.
        setting: String,
        /// The offending value.
        value: String,
    },

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_size_limit() {
        let err = ConfigError::InvalidSizeLimit {
            setting: "cache.limit_size".to_string(),
            value: "12Q".to_string(),
        };
        assert_eq!(format!("{err}"), "invalid cache.limit_size: '12Q'");
    }

    #[test]
    fn display_parse_error() {
        let err = ConfigError::ParseError("expected '=' at line 3".to_string());
        assert_eq!(
            format!("{err}"),
            "failed to parse configuration: expected '=' at line 3"
        );
    }

    #[test]
    fn display_validation_error() {
        let err = ConfigError::ValidationError("build.jobs must be at least 1".to_string());
        assert_eq!(
            format!("{err}"),
            "validation error: build.jobs must be at least 1"
        );
    }

    #[test]
    fn display_io_error() {
        let err = ConfigError::IoError {
            path: "/ws/kiln.toml".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        };
        assert_eq!(format!("{err}"), "failed to read /ws/kiln.toml: file not found");
    }
}
