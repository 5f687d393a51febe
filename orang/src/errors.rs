use std::io;
use std::path::{Path, PathBuf};

pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("{}: not found", path.display())]
    FileNotFound { path: PathBuf },

    #[error("{}: permission denied", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("{}: read failed: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: write failed: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: already exists", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("{}: cannot decode as {encoding}", path.display())]
    EncodingError { path: PathBuf, encoding: String },

    #[error("invalid pattern: {0}")]
    RegexError(#[from] regex::Error),

    #[error("{}: rename target already exists", path.display())]
    RenameConflict { path: PathBuf },

    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A per-path precondition was not met (e.g. deleting a non-empty
    /// directory without `--recursive`). Logged and skipped, never fatal.
    #[error("{0}")]
    PreconditionFailed(String),

    #[error("unknown value '{value}' for {what}")]
    UnknownEnumValue { what: &'static str, value: String },

    #[error("operation canceled")]
    Canceled,
}

impl SearchError {
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        SearchError::FileNotFound { path: path.into() }
    }

    pub fn permission_denied(path: impl Into<PathBuf>) -> Self {
        SearchError::PermissionDenied { path: path.into() }
    }

    /// Classifies a failed read by its `io::ErrorKind`.
    pub fn read_failed(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::file_not_found(path),
            io::ErrorKind::PermissionDenied => Self::permission_denied(path),
            _ => SearchError::ReadFailed {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    pub fn write_failed(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::permission_denied(path),
            io::ErrorKind::AlreadyExists => SearchError::AlreadyExists {
                path: path.to_path_buf(),
            },
            _ => SearchError::WriteFailed {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    pub fn encoding_error(path: &Path, encoding: &str) -> Self {
        SearchError::EncodingError {
            path: path.to_path_buf(),
            encoding: encoding.to_string(),
        }
    }

    pub fn rename_conflict(path: impl Into<PathBuf>) -> Self {
        SearchError::RenameConflict { path: path.into() }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        SearchError::ConfigError(msg.into())
    }

    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        SearchError::PreconditionFailed(msg.into())
    }

    pub fn unknown_enum(what: &'static str, value: impl Into<String>) -> Self {
        SearchError::UnknownEnumValue {
            what,
            value: value.into(),
        }
    }

    /// Fatal errors abort the command; everything else is logged per path
    /// and the traversal continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SearchError::RegexError(_)
                | SearchError::ConfigError(_)
                | SearchError::UnknownEnumValue { .. }
                | SearchError::Canceled
        )
    }
}
