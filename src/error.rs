use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PortalError>;

/// Errors surfaced by the reading portal library.
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("file I/O failed for {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {artifact} JSON")]
    Json {
        artifact: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config {path}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unable to serialize config")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("chapter identifier {0:?} is not a valid chapter file name")]
    InvalidChapter(String),

    #[error("unable to load chapter {chapter}: {source}")]
    ChapterUnavailable {
        chapter: String,
        #[source]
        source: FetchError,
    },

    #[error("chapter {0} has no page markers")]
    Unpaginated(String),

    #[error("template rendering failed")]
    Template(#[from] askama::Error),
}

impl PortalError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(artifact: &'static str, source: serde_json::Error) -> Self {
        Self::Json { artifact, source }
    }
}

/// Failure of a single artifact fetch issued by the chapter loader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("reading {path} failed: {message}")]
    Io { path: String, message: String },
}

impl FetchError {
    pub fn from_io(path: &str, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_string())
        } else {
            Self::Io {
                path: path.to_string(),
                message: err.to_string(),
            }
        }
    }
}
