//! Error types shared across the crate.

use thiserror::Error;

/// Result type for engine-level operations.
pub type Result<T> = std::result::Result<T, AclError>;

/// A wire-format entry string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("entry `{input}` has {fields} fields, expected 3 or 4")]
    FieldCount { input: String, fields: usize },
    #[error("entry `{input}` has unknown principal type `{value}`")]
    PrincipalType { input: String, value: String },
    #[error("entry `{input}` has unknown scope `{value}`")]
    Scope { input: String, value: String },
    #[error("entry `{input}` has invalid permissions `{value}`")]
    Permissions { input: String, value: String },
}

/// The input document does not satisfy the schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{location}: {rule} (got: {fragment})")]
pub struct ValidationError {
    /// Where in the document the problem is, e.g. `containers[0].folders[1]`.
    pub location: String,
    /// The schema rule that was violated.
    pub rule: String,
    /// The offending document fragment, rendered compactly.
    pub fragment: String,
}

impl ValidationError {
    pub fn new(
        location: impl Into<String>,
        rule: impl Into<String>,
        fragment: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            rule: rule.into(),
            fragment: fragment.into(),
        }
    }
}

/// Failures reported by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("transient failure (status {status}): {message}")]
    Transient { status: u16, message: String },
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("request rejected (status {status}, code {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl BackendError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transient { .. } | BackendError::Timeout(_) => true,
            BackendError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Credential acquisition failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown authentication method `{0}`")]
    UnknownMethod(String),
    #[error("credential `{method}` is missing option `{option}`")]
    MissingOption {
        method: &'static str,
        option: &'static str,
    },
    #[error("credential `{method}` failed: {message}")]
    Failed {
        method: &'static str,
        message: String,
    },
    #[error("no credential in the chain produced a token: {0}")]
    ChainExhausted(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum AclError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("invalid document: {0}")]
    Validation(#[from] ValidationError),

    #[error("backend failure at `{path}`: {source}")]
    Backend {
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("recursive update of `{entry}` at `{path}` failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        path: String,
        entry: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("recursive update of `{entry}` at `{path}` still incomplete after {attempts} attempts")]
    ContinuationExhausted {
        path: String,
        entry: String,
        attempts: u32,
    },

    #[error("container `{container}`: parent of `{path}` not found")]
    Lookup { container: String, path: String },

    #[error("node kind mismatch: {0}")]
    TypeMismatch(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AclError {
    pub fn backend(path: impl Into<String>, source: BackendError) -> Self {
        AclError::Backend {
            path: path.into(),
            source,
        }
    }
}
