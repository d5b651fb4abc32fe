//! Turning raw return addresses into readable frames.

use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use backtrace::SymbolName;
use libc::c_void;

use crate::{
    config::{Config, SymbolizerKind},
    error::LeakError,
    slide::{self, ImageBase},
};

pub trait Symbolizer {
    /// Describe the code at `addr`.  Errors are reported as gaps: the caller
    /// falls back to printing the raw address.
    fn symbolize(&self, addr: usize) -> Result<String, LeakError>;
}

/// Resolves frames using the symbol tables of the images loaded in this process.
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessSymbolizer;

impl Symbolizer for InProcessSymbolizer {
    fn symbolize(&self, addr: usize) -> Result<String, LeakError> {
        let mut sym = None;
        backtrace::resolve(addr as *mut c_void, |s| {
            if sym.is_some() {
                return;
            }
            let name = s.name().unwrap_or_else(|| SymbolName::new(&[]));
            sym = Some(match (s.filename(), s.lineno()) {
                (Some(file), Some(line)) => format!("{} (in {}:{})", name, file.display(), line),
                _ => name.to_string(),
            });
        });
        sym.filter(|s| !s.is_empty())
            .ok_or(LeakError::Unresolved(addr))
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs an external tool once per frame, e.g. `addr2line` or `atos`.
///
/// The tool's arguments come from a template; each whitespace-separated word
/// has its placeholders substituted:
///
/// | placeholder | value |
/// |---|---|
/// | `{binary}` | target binary |
/// | `{base}` | runtime base address of the executable code |
/// | `{slide}` | load slide |
/// | `{addr}` | raw return address |
/// | `{offset}` | return address with the slide removed |
///
/// The tool's exit status is not inspected: whatever it prints on stdout is the
/// frame description, unless it only consists of `??` placeholders.  A tool that runs longer than the timeout is killed.
#[derive(Clone, Debug)]
pub struct ExternalSymbolizer {
    tool: String,
    args: Vec<String>,
    binary: PathBuf,
    image: ImageBase,
    timeout: Duration,
}

impl ExternalSymbolizer {
    pub fn new(
        tool: impl Into<String>,
        args: &str,
        binary: impl Into<PathBuf>,
        image: ImageBase,
        timeout: Duration,
    ) -> Self {
        ExternalSymbolizer {
            tool: tool.into(),
            args: args.split_whitespace().map(str::to_owned).collect(),
            binary: binary.into(),
            image,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, LeakError> {
        let image = slide::resolve()?;
        let binary = match &config.binary {
            Some(binary) => binary.clone(),
            None => std::env::current_exe().map_err(LeakError::ExecutablePath)?,
        };
        Ok(Self::new(
            config.tool.clone(),
            &config.tool_args,
            binary,
            image,
            config.timeout(),
        ))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn expand(&self, word: &str, addr: usize) -> String {
        word.replace("{binary}", &self.binary.display().to_string())
            .replace("{base}", &format!("{:#x}", self.image.base()))
            .replace("{slide}", &format!("{:#x}", self.image.slide))
            .replace("{addr}", &format!("{:#x}", addr))
            .replace("{offset}", &format!("{:#x}", self.image.file_address(addr)))
    }

    pub fn command_line(&self, addr: usize) -> Vec<String> {
        self.args.iter().map(|w| self.expand(w, addr)).collect()
    }
}

impl Symbolizer for ExternalSymbolizer {
    fn symbolize(&self, addr: usize) -> Result<String, LeakError> {
        let mut child = Command::new(&self.tool)
            .args(self.command_line(addr))
            // Keep the tool itself out of the analysis.
            .env_remove("LD_PRELOAD")
            .env_remove("DYLD_INSERT_LIBRARIES")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| LeakError::Spawn {
                tool: self.tool.clone(),
                source,
            })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LeakError::SymbolizerTimeout {
                    tool: self.tool.clone(),
                    timeout: self.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_string(&mut output)?;
        }
        let output = output.trim();
        if output.is_empty() || is_unknown(output) {
            return Err(LeakError::Unresolved(addr));
        }
        Ok(output.to_string())
    }
}

/// `addr2line` answers `?? ??:0` (or `??:?`) for addresses it knows nothing about.
fn is_unknown(output: &str) -> bool {
    output
        .split_whitespace()
        .all(|word| word.split(':').next() == Some("??"))
}

/// Symbolizer selected by the configuration.  Falls back to in-process
/// resolution when the external tool cannot be set up.
pub fn from_config(config: &Config) -> Box<dyn Symbolizer> {
    match config.symbolizer {
        SymbolizerKind::InProcess => Box::new(InProcessSymbolizer),
        SymbolizerKind::External => match ExternalSymbolizer::from_config(config) {
            Ok(external) => Box::new(external),
            Err(e) => {
                log::warn!(
                    "leak_analyzer: cannot use `{}` ({}); resolving symbols in-process",
                    config.tool,
                    e
                );
                Box::new(InProcessSymbolizer)
            }
        },
    }
}
