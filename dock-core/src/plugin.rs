//! Per-plugin record: identity, native handle, resolved callbacks,
//! dependency edges.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use dock_plugin_api::{PluginCallback, PluginHandle};
use libloading::Library;

/// One record per loaded native library.
///
/// The [`PluginHandle`] half is boxed so callbacks receive a stable
/// pointer regardless of how the manager's table reallocates. The record
/// is *half-initialized* until every declared dependency is present:
/// the handle is open but `onLoad` has not been resolved or invoked.
pub(crate) struct PluginRecord {
    /// Shared with plugin code; field order keeps it alive until after
    /// the library closes on a plain drop
    pub handle: Box<PluginHandle>,
    /// Open native handle. `None` only for records injected by tests.
    pub library: Option<Library>,
    /// Resolved library path this record was opened from
    pub lib_path: PathBuf,
    /// Declared dependencies (plugin names)
    pub depends: Vec<String>,
    /// Names of plugins that depend on this one
    pub dependents: BTreeSet<String>,
    pub on_load: Option<PluginCallback>,
    pub on_unload: Option<PluginCallback>,
    pub on_tick: Option<PluginCallback>,
    pub on_notify: Option<PluginCallback>,
    pub on_ready: Option<PluginCallback>,
    pub on_depends: Option<PluginCallback>,
    /// User-defined callbacks, keyed by name; always a subset of the
    /// handle's `cindex`
    pub callbacks: HashMap<String, PluginCallback>,
    /// All dependencies present, `onLoad` has run
    pub initialized: bool,
    /// A missing-dependency notify has been emitted for this record
    pub defer_notified: bool,
    #[cfg(test)]
    pub test_symbols: HashMap<String, PluginCallback>,
}

impl PluginRecord {
    pub fn new(handle: Box<PluginHandle>, library: Option<Library>, lib_path: PathBuf) -> Self {
        Self {
            handle,
            library,
            lib_path,
            depends: Vec::new(),
            dependents: BTreeSet::new(),
            on_load: None,
            on_unload: None,
            on_tick: None,
            on_notify: None,
            on_ready: None,
            on_depends: None,
            callbacks: HashMap::new(),
            initialized: false,
            defer_notified: false,
            #[cfg(test)]
            test_symbols: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Stable pointer handed to callbacks as their first argument
    pub fn handle_ptr(&mut self) -> *mut PluginHandle {
        &mut *self.handle
    }

    /// Look up an exported symbol as a plugin callback
    pub fn resolve(&self, symbol: &str) -> Option<PluginCallback> {
        #[cfg(test)]
        if let Some(callback) = self.test_symbols.get(symbol) {
            return Some(*callback);
        }

        let library = self.library.as_ref()?;
        unsafe {
            library
                .get::<PluginCallback>(symbol.as_bytes())
                .ok()
                .map(|symbol| *symbol)
        }
    }

    /// Resolved user-defined callback names, sorted
    pub fn callback_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
