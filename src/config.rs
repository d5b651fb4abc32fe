//! Runtime settings of the leak analyzer.
//!
//! The analyzer has no command line of its own: it is configured through
//! `LEAK_ANALYZER_*` environment variables layered over [`Config::default`].
//! For example, to symbolize with an external tool and give it half a second
//! per frame:
//!
//! ```bash
//! LEAK_ANALYZER_SYMBOLIZER=external LEAK_ANALYZER_TIMEOUT_MS=500 \
//!     LD_PRELOAD=libleak_analyzer.so ./my_program
//! ```

use std::{path::PathBuf, time::Duration};

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::LeakError;

pub const ENV_PREFIX: &str = "LEAK_ANALYZER_";

/// How frames of the exit report are turned into readable names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolizerKind {
    /// Resolve through the symbol tables of the images loaded in this process.
    InProcess,
    /// Spawn `tool` once per frame.
    External,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub symbolizer: SymbolizerKind,
    /// External symbolizer executable.
    pub tool: String,
    /// Whitespace-separated argument template for `tool`.  Recognized
    /// placeholders: `{binary}`, `{base}`, `{slide}`, `{addr}`, `{offset}`.
    pub tool_args: String,
    /// Binary handed to the external symbolizer; defaults to the current executable.
    pub binary: Option<PathBuf>,
    /// Upper bound on a single symbolizer run.
    pub timeout_ms: u64,
    /// When set, a YAML copy of the report is written to this directory.
    pub report_dir: Option<PathBuf>,
    /// Install a signal handler that exits the process so the report still runs.
    pub exit_signal: bool,
}

#[cfg(target_os = "macos")]
const DEFAULT_TOOL: (&str, &str) = ("atos", "-o {binary} -l {base} {addr}");
#[cfg(not(target_os = "macos"))]
const DEFAULT_TOOL: (&str, &str) = ("addr2line", "-C -f -p -e {binary} {offset}");

impl Default for Config {
    fn default() -> Self {
        Config {
            symbolizer: SymbolizerKind::InProcess,
            tool: DEFAULT_TOOL.0.to_string(),
            tool_args: DEFAULT_TOOL.1.to_string(),
            binary: None,
            timeout_ms: 2000,
            report_dir: None,
            exit_signal: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `LEAK_ANALYZER_*` variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load() -> Result<Self, LeakError> {
        Self::figment().extract().map_err(LeakError::from)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

static CONFIG: Lazy<Config> = Lazy::new(|| {
    Config::load().unwrap_or_else(|e| {
        log::warn!("leak_analyzer: {}; using default settings", e);
        Config::default()
    })
});

/// Process-wide settings, read from the environment on first use.
///
/// Must only be called with the re-entrancy guard held: loading allocates.
pub(crate) fn current() -> &'static Config {
    &CONFIG
}
