//! Errors raised inside the leak analyzer.
//!
//! None of these ever reach the host program: the interception layer turns them
//! into "tracking disabled" and the reporter turns them into raw frame addresses.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeakError {
    /// The real allocator entry point could not be located.
    #[error("could not resolve the real `{symbol}`")]
    AllocatorUnavailable { symbol: &'static str },

    #[error("could not determine the executable path: {0}")]
    ExecutablePath(#[source] io::Error),

    /// The executable is not among the images reported by the loader.
    #[error("executable {0} is not among the loaded images")]
    ImageNotFound(PathBuf),

    #[error("executable has no loadable code segment")]
    NoCodeSegment,

    #[error("load address resolution is not supported on this platform")]
    Unsupported,

    /// A frame could not be turned into a symbol name.
    #[error("no symbol for address {0:#x}")]
    Unresolved(usize),

    #[error("failed to run symbolizer `{tool}`: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("symbolizer `{tool}` did not finish within {timeout:?}")]
    SymbolizerTimeout { tool: String, timeout: Duration },

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("leak report serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<figment::Error> for LeakError {
    fn from(e: figment::Error) -> Self {
        LeakError::Config(Box::new(e))
    }
}
