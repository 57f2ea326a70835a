//!
//! Crate-wide error type.
//!

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

///
/// Everything that can abort a run. Per-read conditions (missing events,
/// short strands) are not errors; they are skipped with a log line.
///
#[derive(Debug, Error)]
pub enum Error {
    /// Bad command-line or model-set configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed model, transition, or event file content.
    #[error("parse error in [{path}] line {line}: {msg}")]
    Parse {
        path: String,
        line: usize,
        msg: String,
    },

    #[error("io error on [{path}]: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no reads to process")]
    NoReads,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Error {
        Error::Config(msg.into())
    }
    pub fn parse(path: impl Into<String>, line: usize, msg: impl Into<String>) -> Error {
        Error::Parse {
            path: path.into(),
            line,
            msg: msg.into(),
        }
    }
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
