//! Loading and unloading: native handles, symbol wiring, dependency
//! ordering.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dock_plugin_api::{
    CmdData, ON_DEPENDS, ON_LOAD, ON_NOTIFY, ON_READY, ON_TICK, ON_UNLOAD, PluginHandle,
};
use libloading::Library;

use crate::dispatch::{CallOutcome, invoke};
use crate::error::HostError;
use crate::manager::Manager;
use crate::monitor::plugin_name;
use crate::plugin::PluginRecord;

/// Attempts to delete a live library before renaming its sidecar over it
const REPLACE_ATTEMPTS: u32 = 10;
const REPLACE_BACKOFF: Duration = Duration::from_millis(250);

impl Manager {
    /// Open the library at `path`, wire its symbols, and initialize it
    /// once its declared dependencies are present.
    ///
    /// A path ending in `.new` is a freshly-compiled sidecar; the live
    /// library is replaced first. A plugin with the same name is
    /// unloaded before the new copy opens, which is how reloads work.
    pub fn load_plugin(&mut self, path: &Path) -> Result<(), HostError> {
        let target = strip_sidecar(path);
        let name = plugin_name(&target);
        if name.is_empty() {
            return Err(HostError::InvalidPath {
                path: path.to_path_buf(),
            });
        }

        if self.index_of(&name).is_some() {
            self.unload_plugin(&name, true);
        }

        let lib_path = if is_sidecar(path) {
            self.replace_library(path, &target)?
        } else {
            path.to_path_buf()
        };

        let library = unsafe { Library::new(&lib_path) }?;
        tracing::debug!(plugin = %name, path = %lib_path.display(), "library opened");

        let mut handle = Box::new(PluginHandle::new(name.as_str()));
        handle.install_host(self.vtbl());
        let mut record = PluginRecord::new(handle, Some(library), lib_path);
        record.on_depends = record.resolve(ON_DEPENDS);
        self.plugins.push(record);

        // Let the plugin declare its dependencies before anything else.
        if let Some(idx) = self.index_of(&name)
            && let Some(callback) = self.plugins[idx].on_depends
        {
            let plugin = self.plugins[idx].handle_ptr();
            let mut cmd = CmdData::new();
            match invoke(callback, plugin, &mut cmd) {
                CallOutcome::Completed { failed: false } => {
                    if let Some(idx) = self.index_of(&name) {
                        self.plugins[idx].depends = cmd.returned.clone();
                    }
                }
                CallOutcome::Completed { failed: true } => {
                    self.unload_plugin(&name, true);
                    return Err(HostError::CallbackFailed {
                        plugin: name,
                        callback: ON_DEPENDS.to_string(),
                    });
                }
                CallOutcome::Panicked { message } => {
                    self.unload_plugin(&name, true);
                    return Err(HostError::CallbackPanicked {
                        plugin: name,
                        callback: ON_DEPENDS.to_string(),
                        message,
                    });
                }
            }
        }

        self.init_plugin(&name).map(|_| ())
    }

    /// Finish initializing a half-initialized plugin.
    ///
    /// Idempotent: while dependencies are missing it changes nothing and
    /// reports `Ok(false)`; the sync loop retries it every cycle.
    pub(crate) fn init_plugin(&mut self, name: &str) -> Result<bool, HostError> {
        let Some(idx) = self.index_of(name) else {
            return Ok(false);
        };
        if self.plugins[idx].initialized {
            return Ok(true);
        }

        // A dependency counts as present only once it is initialized; a
        // half-initialized record is not loaded yet, so cyclic depends
        // defer forever instead of initializing each other.
        let missing: Vec<String> = self.plugins[idx]
            .depends
            .iter()
            .filter(|dep| {
                !self
                    .index_of(dep)
                    .is_some_and(|dep_idx| self.plugins[dep_idx].initialized)
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            if !self.plugins[idx].defer_notified {
                self.plugins[idx].defer_notified = true;
                for dep in &missing {
                    let message = format!("Plugin '{name}' dependency '{dep}' not loaded");
                    self.notify_all(&message);
                }
            }
            return Ok(false);
        }

        let resolved = self.plugins[idx]
            .on_load
            .or_else(|| self.plugins[idx].resolve(ON_LOAD));
        let Some(on_load) = resolved else {
            self.unload_plugin(name, true);
            return Err(HostError::SymbolMissing {
                plugin: name.to_string(),
                symbol: ON_LOAD.to_string(),
            });
        };
        self.plugins[idx].on_load = Some(on_load);

        let plugin = self.plugins[idx].handle_ptr();
        let mut cmd = CmdData::new();
        match invoke(on_load, plugin, &mut cmd) {
            CallOutcome::Completed { failed: false } => {}
            CallOutcome::Completed { failed: true } => {
                self.unload_plugin(name, true);
                return Err(HostError::CallbackFailed {
                    plugin: name.to_string(),
                    callback: ON_LOAD.to_string(),
                });
            }
            CallOutcome::Panicked { message } => {
                self.unload_plugin(name, true);
                return Err(HostError::CallbackPanicked {
                    plugin: name.to_string(),
                    callback: ON_LOAD.to_string(),
                    message,
                });
            }
        }

        // onLoad ran arbitrary code; find the record again.
        let Some(idx) = self.index_of(name) else {
            return Ok(false);
        };

        let mut dropped: Vec<String> = Vec::new();
        {
            let record = &mut self.plugins[idx];
            record.on_unload = record.resolve(ON_UNLOAD);
            record.on_tick = record.resolve(ON_TICK);
            record.on_notify = record.resolve(ON_NOTIFY);
            record.on_ready = record.resolve(ON_READY);

            // Resolve the user-defined callbacks declared in cindex.
            let declared: Vec<String> = record.handle.cindex.iter().cloned().collect();
            for callback_name in declared {
                match record.resolve(&callback_name) {
                    Some(callback) => {
                        record.callbacks.insert(callback_name, callback);
                    }
                    None => dropped.push(callback_name),
                }
            }
            record.initialized = true;
        }
        for callback_name in dropped {
            let message = format!("Plugin '{name}' callback '{callback_name}' not found");
            self.notify_all(&message);
        }

        // The drop notifies ran plugin code too.
        let Some(idx) = self.index_of(name) else {
            return Ok(false);
        };

        // Reciprocal dependency edges.
        let depends = self.plugins[idx].depends.clone();
        for dep in &depends {
            if let Some(dep_idx) = self.index_of(dep) {
                self.plugins[dep_idx].dependents.insert(name.to_string());
            }
        }

        let callback_names = match self.index_of(name) {
            Some(idx) => self.plugins[idx]
                .callback_names()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };
        let message = if callback_names.is_empty() {
            format!("Plugin '{name}' loaded")
        } else {
            format!("Plugin '{name}' loaded ({})", callback_names.join(", "))
        };
        tracing::info!(plugin = %name, "plugin loaded");
        self.notify_all(&message);
        Ok(true)
    }

    /// Unload the named plugin.
    ///
    /// With `force` false the request is refused silently while other
    /// plugins depend on this one. Returns whether the plugin was
    /// removed (or was already gone mid-teardown).
    pub fn unload_plugin(&mut self, name: &str, force: bool) -> bool {
        let Some(idx) = self.index_of(name) else {
            return false;
        };

        if !force && !self.plugins[idx].dependents.is_empty() {
            tracing::debug!(plugin = %name, "unload refused, dependents present");
            return false;
        }

        for dependent in self.plugins[idx].dependents.clone() {
            let message = format!("Plugin '{dependent}' depends on '{name}' and might crash");
            self.notify_all(&message);
        }

        // The warning broadcasts ran plugin code; re-resolve.
        let Some(idx) = self.index_of(name) else {
            return true;
        };
        if let Some(callback) = self.plugins[idx].on_unload {
            let plugin = self.plugins[idx].handle_ptr();
            let mut cmd = CmdData::new();
            match invoke(callback, plugin, &mut cmd) {
                CallOutcome::Completed { failed: false } => {}
                CallOutcome::Completed { failed: true } => {
                    let message = HostError::CallbackFailed {
                        plugin: name.to_string(),
                        callback: ON_UNLOAD.to_string(),
                    }
                    .to_string();
                    self.notify_all(&message);
                }
                CallOutcome::Panicked { message } => {
                    // Teardown continues; the handle still closes.
                    tracing::error!(plugin = %name, payload = %message, "onUnload crashed");
                    let message = HostError::CallbackPanicked {
                        plugin: name.to_string(),
                        callback: ON_UNLOAD.to_string(),
                        message,
                    }
                    .to_string();
                    self.notify_all(&message);
                }
            }
        }

        let Some(idx) = self.index_of(name) else {
            return true;
        };
        let mut record = self.plugins.remove(idx);
        let depends = std::mem::take(&mut record.depends);
        tracing::info!(plugin = %name, path = %record.lib_path.display(), "plugin unloaded");

        // Free plugin-scoped data while its destructor is still mapped.
        record.handle.data.free();
        drop(record);

        for dep in &depends {
            if let Some(dep_idx) = self.index_of(dep) {
                self.plugins[dep_idx].dependents.remove(name);
            }
        }

        self.notify_all(&format!("Plugin '{name}' unloaded"));
        true
    }

    /// Unload everything, leaves first: non-forced passes until a
    /// fixpoint, then a forced pass for whatever cycles remain.
    pub(crate) fn unload_all(&mut self) {
        loop {
            let before = self.plugins.len();
            if before == 0 {
                return;
            }
            for name in self.snapshot_names() {
                self.unload_plugin(&name, false);
            }
            if self.plugins.is_empty() {
                return;
            }
            if self.plugins.len() == before {
                for name in self.snapshot_names() {
                    self.unload_plugin(&name, true);
                }
                return;
            }
        }
    }

    /// Replace the live library with its freshly-compiled sidecar.
    ///
    /// Falls back to the surviving old library (with a notify) when the
    /// rename fails but the old copy is still there.
    fn replace_library(&mut self, sidecar: &Path, target: &Path) -> Result<PathBuf, HostError> {
        for attempt in 1..=REPLACE_ATTEMPTS {
            match std::fs::remove_file(target) {
                Ok(()) => break,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => break,
                Err(error) => {
                    tracing::debug!(
                        path = %target.display(),
                        attempt,
                        %error,
                        "could not delete live library"
                    );
                    if attempt < REPLACE_ATTEMPTS {
                        std::thread::sleep(REPLACE_BACKOFF);
                    }
                }
            }
        }

        match std::fs::rename(sidecar, target) {
            Ok(()) => Ok(target.to_path_buf()),
            Err(error) if target.exists() => {
                let message = HostError::Replace {
                    path: target.to_path_buf(),
                    reason: format!("{error}; loading previous build"),
                }
                .to_string();
                self.notify_all(&message);
                Ok(target.to_path_buf())
            }
            Err(error) => Err(HostError::Replace {
                path: target.to_path_buf(),
                reason: error.to_string(),
            }),
        }
    }
}

fn is_sidecar(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "new")
}

/// `plg1.so.new` → `plg1.so`; anything else unchanged
fn strip_sidecar(path: &Path) -> PathBuf {
    if is_sidecar(path) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testutil::{self, TestPlugin};
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C-unwind" fn noop(_p: *mut PluginHandle, _c: *mut CmdData) {}

    unsafe extern "C-unwind" fn failing(_p: *mut PluginHandle, cmd: *mut CmdData) {
        unsafe { &mut *cmd }.fail();
    }

    unsafe extern "C-unwind" fn panicking(_p: *mut PluginHandle, _c: *mut CmdData) {
        panic!("unload crash");
    }

    #[test]
    fn test_strip_sidecar() {
        assert_eq!(
            strip_sidecar(Path::new("/p/plg1.so.new")),
            PathBuf::from("/p/plg1.so")
        );
        assert_eq!(
            strip_sidecar(Path::new("/p/plg1.so")),
            PathBuf::from("/p/plg1.so")
        );
    }

    #[test]
    fn test_missing_dependency_defers_with_single_notify() {
        let _guard = testutil::serialize_notifies();
        let mut manager = testutil::manager();
        testutil::install_recorder(&mut manager, "recorder");
        testutil::install_half(
            &mut manager,
            "plg1",
            vec!["plg2".to_string()],
            vec![("onLoad", noop as dock_plugin_api::PluginCallback)],
        );
        testutil::take_notifies();

        assert!(!manager.init_plugin("plg1").unwrap());
        assert_eq!(
            testutil::take_notifies(),
            vec!["Plugin 'plg1' dependency 'plg2' not loaded".to_string()]
        );

        // Retries stay silent.
        assert!(!manager.init_plugin("plg1").unwrap());
        assert!(!manager.init_plugin("plg1").unwrap());
        assert!(testutil::take_notifies().is_empty());
        assert_eq!(manager.plugin_names(), vec!["recorder", "plg1"]);
    }

    #[test]
    fn test_init_completes_once_dependency_appears() {
        unsafe extern "C-unwind" fn on_load(plugin: *mut PluginHandle, _c: *mut CmdData) {
            unsafe { &mut *plugin }.declare(["plg1test"]);
        }

        let _guard = testutil::serialize_notifies();
        let mut manager = testutil::manager();
        testutil::install_recorder(&mut manager, "recorder");
        testutil::install_half(
            &mut manager,
            "plg1",
            vec!["plg2".to_string()],
            vec![
                ("onLoad", on_load as dock_plugin_api::PluginCallback),
                ("plg1test", noop as dock_plugin_api::PluginCallback),
            ],
        );
        testutil::take_notifies();

        assert!(!manager.init_plugin("plg1").unwrap());
        testutil::install(&mut manager, "plg2", TestPlugin::default());
        manager.retry_deferred();

        let notifies = testutil::take_notifies();
        assert_eq!(
            notifies,
            vec![
                "Plugin 'plg1' dependency 'plg2' not loaded".to_string(),
                "Plugin 'plg1' loaded (plg1test)".to_string(),
            ]
        );

        // Reciprocal edge appeared with initialization.
        let dep_idx = manager.index_of("plg2").unwrap();
        assert!(manager.plugins[dep_idx].dependents.contains("plg1"));

        // The resolved callback is claimable.
        let mut cmd = CmdData::new();
        assert!(manager.call("plg1test", &mut cmd));
    }

    #[test]
    fn test_missing_on_load_removes_plugin() {
        let _guard = testutil::serialize_notifies();
        let mut manager = testutil::manager();
        testutil::install_half(&mut manager, "plg1", vec![], vec![]);

        let err = manager.init_plugin("plg1").unwrap_err();
        assert!(matches!(err, HostError::SymbolMissing { .. }));
        assert!(manager.plugin_names().is_empty());
    }

    #[test]
    fn test_on_load_failure_unloads() {
        let _guard = testutil::serialize_notifies();
        let mut manager = testutil::manager();
        testutil::install_half(
            &mut manager,
            "plg1",
            vec![],
            vec![("onLoad", failing as dock_plugin_api::PluginCallback)],
        );

        let err = manager.init_plugin("plg1").unwrap_err();
        assert!(matches!(err, HostError::CallbackFailed { .. }));
        assert!(manager.plugin_names().is_empty());
    }

    #[test]
    fn test_undeclared_symbols_dropped_with_notify() {
        unsafe extern "C-unwind" fn on_load(plugin: *mut PluginHandle, _c: *mut CmdData) {
            unsafe { &mut *plugin }.declare(["real", "phantom"]);
        }

        let _guard = testutil::serialize_notifies();
        let mut manager = testutil::manager();
        testutil::install_recorder(&mut manager, "recorder");
        testutil::install_half(
            &mut manager,
            "plg1",
            vec![],
            vec![
                ("onLoad", on_load as dock_plugin_api::PluginCallback),
                ("real", noop as dock_plugin_api::PluginCallback),
            ],
        );
        testutil::take_notifies();

        assert!(manager.init_plugin("plg1").unwrap());
        let notifies = testutil::take_notifies();
        assert_eq!(
            notifies,
            vec![
                "Plugin 'plg1' callback 'phantom' not found".to_string(),
                "Plugin 'plg1' loaded (real)".to_string(),
            ]
        );

        let mut cmd = CmdData::new();
        assert!(manager.call("real", &mut cmd));
        let mut cmd = CmdData::new();
        assert!(!manager.call("phantom", &mut cmd));
    }

    #[test]
    fn test_cyclic_dependencies_stay_half_initialized() {
        let _guard = testutil::serialize_notifies();
        let mut manager = testutil::manager();
        testutil::install_half(
            &mut manager,
            "a",
            vec!["b".to_string()],
            vec![("onLoad", noop as dock_plugin_api::PluginCallback)],
        );
        testutil::install_half(
            &mut manager,
            "b",
            vec!["a".to_string()],
            vec![("onLoad", noop as dock_plugin_api::PluginCallback)],
        );
        testutil::take_notifies();

        for _ in 0..5 {
            manager.retry_deferred();
        }

        assert_eq!(manager.plugin_names(), vec!["a", "b"]);
        for name in ["a", "b"] {
            let idx = manager.index_of(name).unwrap();
            assert!(!manager.plugins[idx].initialized, "{name} must not load");
        }
    }

    #[test]
    fn test_unload_refused_while_dependents_exist() {
        let mut manager = testutil::manager();
        testutil::install(&mut manager, "base", TestPlugin::default());
        testutil::install(
            &mut manager,
            "user",
            TestPlugin {
                depends: vec!["base".to_string()],
                ..TestPlugin::default()
            },
        );

        assert!(!manager.unload_plugin("base", false));
        assert_eq!(manager.plugin_names(), vec!["base", "user"]);
    }

    #[test]
    fn test_forced_unload_warns_dependents() {
        let _guard = testutil::serialize_notifies();
        let mut manager = testutil::manager();
        testutil::install_recorder(&mut manager, "recorder");
        testutil::install(&mut manager, "base", TestPlugin::default());
        testutil::install(
            &mut manager,
            "user",
            TestPlugin {
                depends: vec!["base".to_string()],
                ..TestPlugin::default()
            },
        );
        testutil::take_notifies();

        assert!(manager.unload_plugin("base", true));
        let notifies = testutil::take_notifies();
        assert_eq!(
            notifies,
            vec![
                "Plugin 'user' depends on 'base' and might crash".to_string(),
                "Plugin 'base' unloaded".to_string(),
            ]
        );
    }

    #[test]
    fn test_unload_prunes_reciprocal_edges() {
        let mut manager = testutil::manager();
        testutil::install(&mut manager, "base", TestPlugin::default());
        testutil::install(
            &mut manager,
            "user",
            TestPlugin {
                depends: vec!["base".to_string()],
                ..TestPlugin::default()
            },
        );

        assert!(manager.unload_plugin("user", false));
        let idx = manager.index_of("base").unwrap();
        assert!(manager.plugins[idx].dependents.is_empty());
    }

    #[test]
    fn test_on_unload_crash_does_not_stop_teardown() {
        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "grim",
            TestPlugin {
                on_unload: Some(panicking),
                ..TestPlugin::default()
            },
        );

        assert!(manager.unload_plugin("grim", true));
        assert!(manager.plugin_names().is_empty());
    }

    #[test]
    fn test_unload_all_drains_leaves_first() {
        static ORDER: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());

        unsafe extern "C-unwind" fn record_unload(plugin: *mut PluginHandle, _c: *mut CmdData) {
            let plugin = unsafe { &mut *plugin };
            ORDER.lock().unwrap().push(plugin.name().to_string());
        }

        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "base",
            TestPlugin {
                on_unload: Some(record_unload),
                ..TestPlugin::default()
            },
        );
        testutil::install(
            &mut manager,
            "user",
            TestPlugin {
                depends: vec!["base".to_string()],
                on_unload: Some(record_unload),
                ..TestPlugin::default()
            },
        );

        ORDER.lock().unwrap().clear();
        manager.unload_all();
        assert!(manager.plugin_names().is_empty());
        assert_eq!(*ORDER.lock().unwrap(), vec!["user", "base"]);
    }

    #[test]
    fn test_unload_all_forces_cycles() {
        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "a",
            TestPlugin {
                depends: vec!["b".to_string()],
                ..TestPlugin::default()
            },
        );
        testutil::install(
            &mut manager,
            "b",
            TestPlugin {
                depends: vec!["a".to_string()],
                ..TestPlugin::default()
            },
        );
        // Close the cycle: b was not present when a was installed, so
        // a's edge onto b is wired by hand.
        let idx = manager.index_of("b").unwrap();
        manager.plugins[idx].dependents.insert("a".to_string());

        manager.unload_all();
        assert!(manager.plugin_names().is_empty());
    }

    #[test]
    fn test_reload_counter() {
        // Round-trip: unload then re-init leaves one record, freshly
        // initialized each time.
        static LOADS: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C-unwind" fn counting_load(_p: *mut PluginHandle, _c: *mut CmdData) {
            LOADS.fetch_add(1, Ordering::SeqCst);
        }

        let _guard = testutil::serialize_notifies();
        let mut manager = testutil::manager();
        testutil::install_half(
            &mut manager,
            "plg1",
            vec![],
            vec![("onLoad", counting_load as dock_plugin_api::PluginCallback)],
        );
        assert!(manager.init_plugin("plg1").unwrap());
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);

        assert!(manager.unload_plugin("plg1", false));
        assert!(manager.plugin_names().is_empty());

        testutil::install_half(
            &mut manager,
            "plg1",
            vec![],
            vec![("onLoad", counting_load as dock_plugin_api::PluginCallback)],
        );
        assert!(manager.init_plugin("plg1").unwrap());
        assert_eq!(LOADS.load(Ordering::SeqCst), 2);
        assert_eq!(manager.plugin_names(), vec!["plg1"]);
    }

    #[test]
    fn test_load_plugin_rejects_garbage_library() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir
            .path()
            .join(format!("junk.{}", std::env::consts::DLL_EXTENSION));
        std::fs::write(&path, b"not a shared object").unwrap();

        let mut manager = testutil::manager();
        let err = manager.load_plugin(&path).unwrap_err();
        assert!(matches!(err, HostError::LibraryLoad(_)));
        assert!(manager.plugin_names().is_empty());
    }

    #[test]
    fn test_sidecar_replaces_live_library() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir
            .path()
            .join(format!("plg1.{}", std::env::consts::DLL_EXTENSION));
        let sidecar = crate::monitor::sidecar_path(&target);
        std::fs::write(&target, b"old").unwrap();
        std::fs::write(&sidecar, b"new").unwrap();

        let mut manager = testutil::manager();
        let resolved = manager.replace_library(&sidecar, &target).unwrap();
        assert_eq!(resolved, target);
        assert!(!sidecar.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn test_sidecar_missing_and_no_fallback_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir
            .path()
            .join(format!("plg1.{}", std::env::consts::DLL_EXTENSION));
        let sidecar = crate::monitor::sidecar_path(&target);

        let mut manager = testutil::manager();
        let err = manager.replace_library(&sidecar, &target).unwrap_err();
        assert!(matches!(err, HostError::Replace { .. }));
    }
}
