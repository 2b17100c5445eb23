//! Manager configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HostError;

/// What kind of artifact the monitor scans for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Directories hold compiled libraries with the platform extension
    Binary,
    /// Directories hold sources that the monitor compiles on demand
    Source,
}

/// Compile subprocess template for source mode.
///
/// `{src}` and `{out}` are replaced with the source and output paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub command: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: ["rustc", "--crate-type", "cdylib", "-O", "{src}", "-o", "{out}"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Configuration for [`Manager::init`](crate::Manager::init).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directories the monitor scans for plugins
    pub paths: Vec<PathBuf>,
    /// Binary or source scanning
    pub mode: ScanMode,
    /// Compile template (source mode only)
    pub compiler: CompilerConfig,
    /// File extension of plugin sources (source mode only)
    pub source_extension: String,
    /// Monitor poll delay until the initial load pass completes
    pub poll_startup_ms: u64,
    /// Monitor poll delay once ready
    pub poll_ready_ms: u64,
    /// After ready, the load queue is drained every this many ticks
    pub load_gate_ticks: u64,
    /// Whitelist file, one plugin name per line
    pub allow_file: PathBuf,
    /// Blacklist file, one plugin name per line
    pub block_file: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            mode: ScanMode::Binary,
            compiler: CompilerConfig::default(),
            source_extension: "rs".into(),
            poll_startup_ms: 200,
            poll_ready_ms: 2000,
            load_gate_ticks: 25,
            allow_file: PathBuf::from("allow.ini"),
            block_file: PathBuf::from("block.ini"),
        }
    }
}

impl ManagerConfig {
    /// Configuration scanning the given directories in binary mode
    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load a configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, HostError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| HostError::Config(e.to_string()))
    }

    /// Current monitor poll delay for the given ready state
    pub fn poll_delay(&self, ready: bool) -> Duration {
        Duration::from_millis(if ready {
            self.poll_ready_ms
        } else {
            self.poll_startup_ms
        })
    }
}
