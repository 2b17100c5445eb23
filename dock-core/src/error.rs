//! Error types for the plugin host engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the plugin host.
///
/// None of these escape to the host application's loop: the manager
/// converts every failure into a notify message and keeps running.
#[derive(Error, Debug)]
pub enum HostError {
    /// The dynamic loader rejected the library
    #[error("Failed to load plugin library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// A required symbol is not exported by the library
    #[error("Plugin '{plugin}' is missing required symbol '{symbol}'")]
    SymbolMissing { plugin: String, symbol: String },

    /// The sidecar produced by a recompile could not replace the live library
    #[error("Could not replace '{path}' with its rebuilt copy: {reason}")]
    Replace { path: PathBuf, reason: String },

    /// A path handed to the loader has no usable file stem
    #[error("Not a plugin library path: {path}")]
    InvalidPath { path: PathBuf },

    /// A plugin callback panicked
    #[error("Plugin '{plugin}' callback '{callback}' crashed: {message}")]
    CallbackPanicked {
        plugin: String,
        callback: String,
        message: String,
    },

    /// A plugin callback reported failure through the envelope
    #[error("Plugin '{plugin}' callback '{callback}' failed")]
    CallbackFailed { plugin: String, callback: String },

    /// Compile subprocess failed; carries the compiler diagnostic
    #[error("{0}")]
    Compile(String),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
