//! Manager - the host-side aggregate owning the plugin table, the
//! monitor, and the run state.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;

use dock_plugin_api::{CmdData, DataSlot, HostVtbl};

use crate::command::{InternalCommand, internal_table};
use crate::config::ManagerConfig;
use crate::monitor::{Monitor, RunState};
use crate::plugin::PluginRecord;

/// The plugin host engine.
///
/// The host application drives it with exactly three operations:
/// [`init`](Manager::init) once, [`sync`](Manager::sync) every loop
/// iteration, [`stop`](Manager::stop) at shutdown. Everything else
/// (loading, dispatch, the command router) hangs off those three.
///
/// `init` returns the manager boxed: plugin callbacks reach back into the
/// manager through its address, which must stay put for the lifetime of
/// the host loop.
pub struct Manager {
    pub(crate) state: RunState,
    pub(crate) ready: bool,
    pub(crate) queued_commands: Vec<String>,
    pub(crate) ticks: u64,
    /// Insertion-ordered plugin table; iteration order is load order
    pub(crate) plugins: Vec<PluginRecord>,
    /// Manager-scoped data, keyed by plugin name, survives reloads
    pub(crate) shared: HashMap<String, DataSlot>,
    pub(crate) monitor: Monitor,
    pub(crate) internal: Vec<InternalCommand>,
    pub(crate) config: ManagerConfig,
}

impl Manager {
    /// Allocate the manager, install the internal command table, and
    /// start the monitor thread over the configured directories.
    pub fn init(config: ManagerConfig, initial_commands: Vec<String>) -> Box<Manager> {
        tracing::info!(paths = config.paths.len(), mode = ?config.mode, "plugin host starting");
        let monitor = Monitor::start(&config);
        Box::new(Manager {
            state: RunState::Executing,
            ready: false,
            queued_commands: initial_commands,
            ticks: 0,
            plugins: Vec::new(),
            shared: HashMap::new(),
            monitor,
            internal: internal_table(),
            config,
        })
    }

    /// One host-loop iteration: drain pending loads, settle deferred
    /// initializations, fire the ready transition, tick every plugin.
    pub fn sync(&mut self) {
        self.ticks += 1;

        let gate = self.config.load_gate_ticks.max(1);
        if !self.ready || self.ticks % gate == 0 {
            for entry in self.monitor.drain() {
                if Path::new(&entry).exists() {
                    if let Err(error) = self.load_plugin(Path::new(&entry)) {
                        let message = error.to_string();
                        self.notify_all(&message);
                    }
                } else {
                    // Queue entries that aren't files are error messages
                    // from the monitor.
                    self.notify_all(&entry);
                }
            }
            self.retry_deferred();
        }

        if !self.ready && self.monitor.is_ready() {
            self.ready = true;
            tracing::info!("plugin host ready");
            self.ready_all();
            for line in std::mem::take(&mut self.queued_commands) {
                self.run_command(&line);
            }
        }

        self.tick_all();
    }

    /// Stop the monitor, unload every plugin (leaves first), and join
    /// the monitor thread.
    pub fn stop(&mut self) {
        tracing::info!("plugin host stopping");
        self.monitor.stop();
        self.unload_all();
        self.monitor.join();
        self.state = RunState::Stopped;
    }

    /// Retry initialization of half-initialized plugins; missing
    /// dependencies resolve as their providers load.
    pub(crate) fn retry_deferred(&mut self) {
        for name in self.snapshot_names() {
            let pending = self
                .index_of(&name)
                .is_some_and(|idx| !self.plugins[idx].initialized);
            if pending && let Err(error) = self.init_plugin(&name) {
                let message = error.to_string();
                self.notify_all(&message);
            }
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn run_state(&self) -> RunState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Insertion-ordered list of loaded plugin names
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.name() == name)
    }

    /// Name snapshot for broadcast iteration: plugins loaded after the
    /// snapshot is taken are not dispatched to, plugins unloaded
    /// mid-broadcast are skipped when their turn comes.
    pub(crate) fn snapshot_names(&self) -> Vec<String> {
        self.plugin_names()
    }

    // ─── Manager-scoped data registry ────────────────────────────────

    /// The manager-scoped data slot for the named plugin, created empty
    /// on first access. Slots survive unload/reload of their plugin.
    pub fn shared_slot(&mut self, name: &str) -> &mut DataSlot {
        self.shared.entry(name.to_string()).or_default()
    }

    /// Free the named manager-scoped slot, running its destructor.
    ///
    /// Call while the code behind the destructor is still loaded; slots
    /// never freed are leaked at teardown.
    pub fn free_shared(&mut self, name: &str) {
        if let Some(mut slot) = self.shared.remove(name) {
            slot.free();
        }
    }

    // ─── Host vtable ─────────────────────────────────────────────────

    /// Function table installed into every plugin handle at load
    pub(crate) fn vtbl(&mut self) -> HostVtbl {
        HostVtbl {
            host: self as *mut Manager as *mut c_void,
            call: vtbl_call,
            call_plugin: vtbl_call_plugin,
            notify: vtbl_notify,
            command: vtbl_command,
            shared_slot: vtbl_shared_slot,
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.state != RunState::Stopped {
            self.stop();
        }
    }
}

// The vtable shims recover the manager from the opaque pointer carried in
// the handle. During a callback the host thread holds no reference to the
// manager, so the reborrow is unique.

unsafe fn vtbl_call(host: *mut c_void, callback: &str, cmd: &mut CmdData) -> bool {
    let manager = unsafe { &mut *(host as *mut Manager) };
    manager.call(callback, cmd)
}

unsafe fn vtbl_call_plugin(host: *mut c_void, plugin: &str, callback: &str, cmd: &mut CmdData) {
    let manager = unsafe { &mut *(host as *mut Manager) };
    manager.call_plugin(plugin, callback, cmd);
}

unsafe fn vtbl_notify(host: *mut c_void, message: &str) {
    let manager = unsafe { &mut *(host as *mut Manager) };
    manager.notify_all(message);
}

unsafe fn vtbl_command(host: *mut c_void, cmd: &mut CmdData) {
    let manager = unsafe { &mut *(host as *mut Manager) };
    manager.call_command(cmd);
}

unsafe fn vtbl_shared_slot(host: *mut c_void, name: &str) -> *mut DataSlot {
    let manager = unsafe { &mut *(host as *mut Manager) };
    manager.shared_slot(name) as *mut DataSlot
}
