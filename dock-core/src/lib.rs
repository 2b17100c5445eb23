//! dock-core: plugin lifecycle and dispatch engine
//!
//! This crate is the manager a host application embeds to run native
//! plugins:
//!
//! - [`Manager`]: the aggregate the host drives with `init`/`sync`/`stop`
//! - [`Monitor`]: background worker that scans plugin directories,
//!   recompiles stale sources, and queues load requests
//! - [`ManagerConfig`]: directories, scan mode, compiler template, poll
//!   cadence
//! - [`HostError`]: everything that can go wrong, always converted into
//!   notify messages rather than surfaced to the host loop
//!
//! # Quick Start
//!
//! ```no_run
//! use dock_core::{Manager, ManagerConfig, RunState};
//!
//! let config = ManagerConfig::with_paths(["plugins"]);
//! let mut manager = Manager::init(config, vec![]);
//!
//! while manager.run_state() != RunState::Stopped {
//!     manager.sync();
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! manager.stop();
//! ```
//!
//! # Threading
//!
//! Exactly two threads touch manager state: the host thread, which owns
//! the manager and runs every plugin callback, and the monitor thread,
//! which shares one mutex-guarded record with the host. No callback ever
//! runs on the monitor thread.

mod command;
mod compile;
mod config;
mod dispatch;
mod error;
mod filter;
mod loader;
mod manager;
mod monitor;
mod plugin;

pub use config::{CompilerConfig, ManagerConfig, ScanMode};
pub use error::HostError;
pub use manager::Manager;
pub use monitor::{Monitor, RunState};

// Re-export the ABI crate so hosts can build envelopes without a second
// dependency line.
pub use dock_plugin_api as plugin_api;
