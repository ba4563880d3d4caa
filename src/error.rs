//! Error types and handling for bundlesmith
//!
//! Uses `thiserror` for error definitions and `miette` for pretty diagnostics.
//!
//! The taxonomy follows the failure surfaces of the crate:
//! - bundle construction errors (malformed or incomplete topology documents)
//! - merge conflicts (two topologies disagreeing on a shared top-level key)
//! - fetch failures (charm store transport errors or unexpected result shapes)
//! - handle-level lookup errors (a metadata field absent from a fetched entity)
//!
//! The enum derives `Clone` so a cached fetch failure can be handed to every
//! handle waiting on the same in-flight lookup.

use miette::Diagnostic;
use thiserror::Error;

/// Main error type for bundlesmith operations
#[derive(Error, Diagnostic, Debug, Clone)]
pub enum BundleError {
    // Bundle construction errors
    #[error("Invalid bundle: {reason}")]
    #[diagnostic(
        code(bundlesmith::bundle::invalid),
        help("A bundle document must be a mapping with a 'services' section")
    )]
    InvalidBundle { reason: String },

    #[error("Failed to read bundle file: {path}")]
    #[diagnostic(code(bundlesmith::bundle::read_failed))]
    BundleReadFailed { path: String, reason: String },

    #[error("Failed to parse bundle document: {reason}")]
    #[diagnostic(code(bundlesmith::bundle::parse_failed))]
    BundleParseFailed { reason: String },

    #[error("Failed to parse metadata overlay: {reason}")]
    #[diagnostic(code(bundlesmith::bundle::metadata_parse_failed))]
    MetadataParseFailed { reason: String },

    // Merge errors
    #[error("Can't merge top level key '{key}': {ours} vs {theirs}")]
    #[diagnostic(
        code(bundlesmith::merge::conflict),
        help("Top-level keys other than services/machines/relations must match in both bundles")
    )]
    MergeConflict {
        key: String,
        ours: String,
        theirs: String,
    },

    // Charm store errors
    #[error("Charm store lookup failed: {reason}")]
    #[diagnostic(
        code(bundlesmith::store::fetch_failed),
        help("Check network connectivity and that the charm id is spelled correctly")
    )]
    FetchFailed { reason: String },

    #[error("Got wrong number of results from charm store: expected 1, got {count}")]
    #[diagnostic(code(bundlesmith::store::unexpected_results))]
    UnexpectedResults { count: usize },

    #[error("No result returned for charm '{id}'")]
    #[diagnostic(code(bundlesmith::store::missing_result))]
    MissingResult { id: String },

    #[error("Metadata field '{field}' not present in charm entity")]
    #[diagnostic(code(bundlesmith::store::missing_field))]
    MissingField { field: String },

    #[error("Metadata lookup was interrupted before completion")]
    #[diagnostic(code(bundlesmith::store::interrupted))]
    LookupInterrupted,

    // Recommended-charms config errors
    #[error("Failed to parse bundle config: {reason}")]
    #[diagnostic(code(bundlesmith::config::parse_failed))]
    ConfigParseFailed { reason: String },
}

impl From<std::io::Error> for BundleError {
    fn from(err: std::io::Error) -> Self {
        BundleError::BundleReadFailed {
            path: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for BundleError {
    fn from(err: serde_yaml::Error) -> Self {
        BundleError::BundleParseFailed {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BundleError {
    fn from(err: serde_json::Error) -> Self {
        BundleError::ConfigParseFailed {
            reason: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BundleError {
    fn from(err: reqwest::Error) -> Self {
        BundleError::FetchFailed {
            reason: err.to_string(),
        }
    }
}

/// Result type alias using miette for error handling
pub type Result<T> = miette::Result<T, BundleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BundleError::MergeConflict {
            key: "series".to_string(),
            ours: "xenial".to_string(),
            theirs: "trusty".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Can't merge top level key 'series': xenial vs trusty"
        );
    }

    #[test]
    fn test_error_code() {
        let err = BundleError::InvalidBundle {
            reason: "missing services".to_string(),
        };
        assert_eq!(
            err.code().map(|c| c.to_string()),
            Some("bundlesmith::bundle::invalid".to_string())
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BundleError = io_err.into();
        assert!(matches!(err, BundleError::BundleReadFailed { .. }));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_str = "invalid: yaml: content: [unclosed";
        let parse_result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str(yaml_str);
        let yaml_err = parse_result.unwrap_err();
        let err: BundleError = yaml_err.into();
        assert!(matches!(err, BundleError::BundleParseFailed { .. }));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_str = "invalid json content";
        let parse_result: std::result::Result<serde_json::Value, _> =
            serde_json::from_str(json_str);
        let json_err = parse_result.unwrap_err();
        let err: BundleError = json_err.into();
        assert!(matches!(err, BundleError::ConfigParseFailed { .. }));
    }

    #[test]
    fn test_fetch_failure_is_cloneable() {
        let err = BundleError::FetchFailed {
            reason: "connection reset".to_string(),
        };
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn test_unexpected_results_message() {
        let err = BundleError::UnexpectedResults { count: 3 };
        assert!(err.to_string().contains("expected 1, got 3"));
    }
}
