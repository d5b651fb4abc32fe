//! The exit-time leak report.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::{self, Display, Formatter},
    fs,
    path::{Path, PathBuf},
};

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

use crate::{
    callstack::CallStack, error::LeakError, registry::AllocationRecord, symbolize::Symbolizer,
};

pub const NO_LEAKS: &str = "No leaks !!!";

/// Snapshot of one allocation that was still live when the snapshot was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leak {
    pub ptr: usize,
    pub size: usize,
    pub stack: CallStack,
}

impl From<&AllocationRecord> for Leak {
    fn from(record: &AllocationRecord) -> Self {
        Leak {
            ptr: record.ptr(),
            size: record.size(),
            stack: *record.stack(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub addr: usize,
    /// `None` when the symbolizer had nothing to say about this frame.
    pub symbol: Option<String>,
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => f.write_str(symbol),
            None => write!(f, "{:#x}", self.addr),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakEntry {
    pub size: usize,
    pub ptr: usize,
    pub frames: Vec<Frame>,
}

/// Leaks of one process, most recently allocated first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    pub pid: u32,
    pub leaks: Vec<LeakEntry>,
}

impl LeakReport {
    /// Render every leak's call stack with `symbolizer`.  The frame inside the
    /// interception layer is left out.  Each distinct address is symbolized once.
    pub fn resolve<S: Symbolizer + ?Sized>(pid: u32, leaks: &[Leak], symbolizer: &S) -> Self {
        let mut symbols: HashMap<usize, Option<String>> = HashMap::new();
        let leaks = leaks
            .iter()
            .map(|leak| LeakEntry {
                size: leak.size,
                ptr: leak.ptr,
                frames: leak
                    .stack
                    .callers()
                    .iter()
                    .map(|&addr| {
                        let symbol = match symbols.entry(addr) {
                            Entry::Occupied(oe) => oe.get().clone(),
                            Entry::Vacant(ve) => ve.insert(lookup(symbolizer, addr)).clone(),
                        };
                        Frame { addr, symbol }
                    })
                    .collect(),
            })
            .collect();
        LeakReport { pid, leaks }
    }

    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.leaks.iter().map(|l| l.size).sum()
    }

    pub fn file_name(pid: u32) -> String {
        format!("leak_analyzer.{}.yaml", pid)
    }

    /// Store the report as `leak_analyzer.<pid>.yaml` inside `dir`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, LeakError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(self.pid));
        fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, LeakError> {
        let bytes = fs::read(path)?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }
}

fn lookup<S: Symbolizer + ?Sized>(symbolizer: &S, addr: usize) -> Option<String> {
    match symbolizer.symbolize(addr) {
        Ok(symbol) => Some(symbol),
        Err(e) => {
            log::debug!("leak_analyzer: {}", e);
            None
        }
    }
}

impl Display for LeakReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "{}", NO_LEAKS);
        }
        for leak in &self.leaks {
            writeln!(f, "{} bytes at {:#x}", leak.size, leak.ptr)?;
            for frame in &leak.frames {
                writeln!(f, "    {}", frame)?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "{} leaks, {} bytes total",
            self.leaks.len().to_formatted_string(&Locale::en),
            self.total_bytes().to_formatted_string(&Locale::en)
        )
    }
}
