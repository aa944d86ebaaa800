//! Error types for dataset feature operations.
//!
//! Each failure a provider operation can report has its own type, grouped under
//! [`GeoCrudError`]. The orchestration layer maps them to response classes with
//! [`GeoCrudError::status_class`]; the provider itself knows nothing about HTTP.
//! Messages for clients are produced through a [`Translator`].

use std::fmt;

use thiserror::Error;

use geocrud_core_common::DbError;

use crate::filter::FilterIssue;
use crate::i18n::Translator;
use crate::validation::ValidationReport;

/// Main error type for dataset feature operations.
///
/// Wrapped variants delegate display formatting with `#[error(transparent)]`.
#[derive(Debug, Error)]
pub enum GeoCrudError {
    /// Invalid dataset configuration, raised at provider construction.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Malformed filter, bounding box or CRS in a request.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A feature payload failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    /// The dataset does not permit the operation.
    #[error("Operation '{operation}' is not permitted on this dataset")]
    PermissionDenied {
        /// The rejected operation
        operation: Operation,
    },

    /// No row with the requested id (or it is outside the datasource filter).
    #[error("Feature '{id}' not found")]
    NotFound {
        /// The requested feature id
        id: String,
    },

    /// The database rejected a write.
    #[error(transparent)]
    Commit(#[from] CommitFailure),

    /// Unexpected database failure.
    #[error(transparent)]
    Database(#[from] DbError),
}

/// Provider operations subject to a permission flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Listing, showing and extent queries
    Read,
    /// Inserting features
    Create,
    /// Updating features
    Update,
    /// Deleting features
    Delete,
}

impl Operation {
    /// Returns the lowercase operation name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration errors.
///
/// These are fatal for the dataset and raised before any query runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid option value
    #[error("Invalid {option} option: {message}")]
    InvalidOption {
        /// The option name
        option: String,
        /// Why it's invalid
        message: String,
    },

    /// Required option is missing
    #[error("Missing required option: {option}")]
    MissingRequired {
        /// The missing option name
        option: String,
    },

    /// The configured backend names no known dialect
    #[error("Unknown dialect '{name}'. Available dialects: {available}")]
    UnknownDialect {
        /// The configured backend name
        name: String,
        /// Comma-separated list of known dialects
        available: String,
    },
}

/// Request parse errors.
///
/// These never reach the database.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// Filter text was empty or missing
    #[error("Empty expression")]
    EmptyExpression,

    /// Filter text is not JSON
    #[error("Invalid JSON")]
    InvalidJson,

    /// Filter JSON is not an array
    #[error("Not an array")]
    NotAnArray,

    /// One or more entries of the filter are invalid
    #[error("{}", join_issues(.0))]
    Filter(Vec<FilterIssue>),

    /// Bounding box is not four ordered numbers
    #[error("Invalid bounding box '{input}'")]
    InvalidBbox {
        /// The rejected input
        input: String,
    },

    /// CRS is not an EPSG code
    #[error("Invalid CRS '{input}'")]
    InvalidCrs {
        /// The rejected input
        input: String,
    },

    /// Filter geometry cannot be bound for the dataset's dialect
    #[error("Invalid filter geometry: {message}")]
    InvalidFilterGeometry {
        /// Converter message
        message: String,
    },
}

fn join_issues(issues: &[FilterIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ParseError {
    /// Returns the translated message.
    #[must_use]
    pub fn message(&self, tr: &dyn Translator) -> String {
        match self {
            Self::EmptyExpression => tr.tr("filter.empty_expression", &[]),
            Self::InvalidJson => tr.tr("filter.invalid_json", &[]),
            Self::NotAnArray => tr.tr("filter.not_an_array", &[]),
            Self::Filter(issues) => issues
                .iter()
                .map(|i| i.message(tr))
                .collect::<Vec<_>>()
                .join("; "),
            Self::InvalidBbox { .. } => tr.tr("request.invalid_bbox", &[]),
            Self::InvalidCrs { .. } => tr.tr("request.invalid_crs", &[]),
            Self::InvalidFilterGeometry { .. } => tr.tr("request.invalid_filter_geom", &[]),
        }
    }
}

/// A feature payload failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Feature validation failed: {}", .report.summary())]
pub struct ValidationFailure {
    /// The populated error category
    pub report: ValidationReport,
}

/// The database rejected a write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Feature commit failed: {message}{}", detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
pub struct CommitFailure {
    /// Engine message
    pub message: String,
    /// Engine detail text, if any
    pub detail: Option<String>,
}

impl From<DbError> for CommitFailure {
    fn from(err: DbError) -> Self {
        Self {
            message: err.message,
            detail: err.detail,
        }
    }
}

/// Response class of an error, independent of any transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Malformed request (400)
    BadRequest,
    /// Unknown feature (404)
    NotFound,
    /// Operation not permitted (405)
    MethodNotAllowed,
    /// Validation or commit failure (422)
    UnprocessableEntity,
    /// Configuration or database failure (500)
    Internal,
}

impl StatusClass {
    /// Returns the conventional HTTP status code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            StatusClass::BadRequest => 400,
            StatusClass::NotFound => 404,
            StatusClass::MethodNotAllowed => 405,
            StatusClass::UnprocessableEntity => 422,
            StatusClass::Internal => 500,
        }
    }
}

/// Type alias for Results using `GeoCrudError`.
pub type Result<T> = std::result::Result<T, GeoCrudError>;

impl GeoCrudError {
    /// Returns the response class for this error.
    #[must_use]
    pub fn status_class(&self) -> StatusClass {
        match self {
            Self::Parse(_) => StatusClass::BadRequest,
            Self::NotFound { .. } => StatusClass::NotFound,
            Self::PermissionDenied { .. } => StatusClass::MethodNotAllowed,
            Self::Validation(_) | Self::Commit(_) => StatusClass::UnprocessableEntity,
            Self::Config(_) | Self::Database(_) => StatusClass::Internal,
        }
    }

    /// Get a user-friendly error message.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(e) => format!("Configuration error: {e}"),
            Self::Parse(e) => format!("Invalid request: {e}"),
            Self::Validation(e) => format!("{e}\n{}", e.report.details()),
            Self::Database(e) => format!("Database error: {e}"),
            Self::PermissionDenied { .. } | Self::NotFound { .. } | Self::Commit(_) => {
                self.to_string()
            },
        }
    }

    /// Returns the client-facing message, routed through `tr`.
    #[must_use]
    pub fn message(&self, tr: &dyn Translator) -> String {
        match self {
            Self::Parse(e) => e.message(tr),
            Self::PermissionDenied { operation } => {
                tr.tr("request.method_not_allowed", &[operation.as_str()])
            },
            Self::NotFound { .. } => tr.tr("request.not_found", &[]),
            Self::Validation(_) => tr.tr("request.feature_validation_failed", &[]),
            Self::Commit(e) => {
                let base = tr.tr("request.feature_commit_failed", &[]);
                match &e.detail {
                    Some(detail) => format!("{base}: {detail}"),
                    None => format!("{base}: {}", e.message),
                }
            },
            Self::Config(_) | Self::Database(_) => self.to_string(),
        }
    }

    /// Get recovery suggestions if available.
    #[must_use]
    pub fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::Config(ConfigError::UnknownDialect { .. }) => {
                Some("Run 'geocrud dialects' to see all known dialects.".to_string())
            },
            Self::Parse(ParseError::Filter(_)) => Some(
                "Filters are JSON arrays like [[\"name\", \"=\", \"x\"], \"and\", [\"id\", \">\", 5]]."
                    .to_string(),
            ),
            Self::Parse(ParseError::InvalidBbox { .. }) => {
                Some("Use '<minx>,<miny>,<maxx>,<maxy>' with min <= max.".to_string())
            },
            Self::Parse(ParseError::InvalidCrs { .. }) => {
                Some("Use 'EPSG:<srid>', e.g. 'EPSG:4326'.".to_string())
            },
            Self::PermissionDenied { .. } => {
                Some("Check the dataset permissions for this operation.".to_string())
            },
            _ => None,
        }
    }

    /// Check if this error is potentially recoverable.
    ///
    /// Recoverable errors go away when the request is corrected.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Validation(_) | Self::Commit(_) | Self::NotFound { .. }
        )
    }
}

/// Helper to create `ConfigError::UnknownDialect` with the known dialects.
#[must_use]
pub fn dialect_not_found(name: &str) -> ConfigError {
    let available = geocrud_core_common::dialects::get_dialect_names().join(", ");
    ConfigError::UnknownDialect {
        name: name.to_string(),
        available,
    }
}
