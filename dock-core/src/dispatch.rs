//! Callback dispatch: broadcasts, named calls, crash containment.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use dock_plugin_api::{CmdData, ON_NOTIFY, ON_READY, ON_TICK, PluginCallback, PluginHandle};

use crate::error::HostError;
use crate::manager::Manager;

/// What happened when a plugin callback was invoked
pub(crate) enum CallOutcome {
    /// The callback returned; `failed` mirrors the envelope flag
    Completed { failed: bool },
    /// The callback panicked; the payload is stringified
    Panicked { message: String },
}

/// Invoke a plugin callback behind the containment barrier.
///
/// Free function on purpose: no manager reference may be live while
/// foreign code runs, so callbacks can reenter the manager through the
/// host vtable.
pub(crate) fn invoke(
    callback: PluginCallback,
    plugin: *mut PluginHandle,
    cmd: &mut CmdData,
) -> CallOutcome {
    let cmd_ptr: *mut CmdData = &mut *cmd;
    let result = catch_unwind(AssertUnwindSafe(|| unsafe { callback(plugin, cmd_ptr) }));
    match result {
        Ok(()) => CallOutcome::Completed { failed: cmd.failed },
        Err(payload) => CallOutcome::Panicked {
            message: panic_message(payload.as_ref()),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

impl Manager {
    /// Broadcast a notify message: every loaded plugin's `onNotify` in
    /// insertion order, then the message on standard output.
    ///
    /// The stdout line prints the envelope's first parameter *after*
    /// fan-out; a callee that mutates `params[0]` changes what is
    /// printed. Long-standing behavior, kept.
    pub fn notify_all(&mut self, message: &str) {
        tracing::debug!(%message, "notify");
        let mut cmd = CmdData::with_params([message]);

        for name in self.snapshot_names() {
            let Some(idx) = self.index_of(&name) else {
                continue;
            };
            let record = &mut self.plugins[idx];
            let Some(callback) = record.on_notify else {
                continue;
            };
            let plugin = record.handle_ptr();

            match invoke(callback, plugin, &mut cmd) {
                CallOutcome::Completed { failed: false } => {}
                CallOutcome::Completed { failed: true } => {
                    cmd.failed = false;
                    // Reporting through another broadcast would reenter
                    // the same failing callback.
                    tracing::warn!(plugin = %name, "onNotify reported failure");
                }
                CallOutcome::Panicked { message: panic } => {
                    if let Some(idx) = self.index_of(&name) {
                        self.plugins[idx].on_notify = None;
                    }
                    self.crash_unload(&name, ON_NOTIFY, &panic);
                }
            }
        }

        println!("{}", cmd.first_param().unwrap_or_default());
    }

    /// One-shot broadcast fired when the monitor first reports ready
    pub(crate) fn ready_all(&mut self) {
        self.broadcast(ON_READY);
    }

    /// Per-sync broadcast to every plugin's `onTick`
    pub(crate) fn tick_all(&mut self) {
        self.broadcast(ON_TICK);
    }

    fn broadcast(&mut self, which: &'static str) {
        for name in self.snapshot_names() {
            let Some(idx) = self.index_of(&name) else {
                continue;
            };
            let record = &mut self.plugins[idx];
            let slot = match which {
                ON_READY => record.on_ready,
                ON_TICK => record.on_tick,
                _ => None,
            };
            let Some(callback) = slot else {
                continue;
            };
            let plugin = record.handle_ptr();
            let mut cmd = CmdData::new();

            match invoke(callback, plugin, &mut cmd) {
                CallOutcome::Completed { failed: false } => {}
                CallOutcome::Completed { failed: true } => {
                    let message = HostError::CallbackFailed {
                        plugin: name.clone(),
                        callback: which.to_string(),
                    }
                    .to_string();
                    self.notify_all(&message);
                }
                CallOutcome::Panicked { message } => {
                    if which == ON_READY && let Some(idx) = self.index_of(&name) {
                        self.plugins[idx].on_ready = None;
                    }
                    self.crash_unload(&name, which, &message);
                }
            }
        }
    }

    /// Invoke the first plugin (in insertion order) claiming `callback`.
    /// Returns false and sets `cmd.failed` when no plugin does.
    pub fn call(&mut self, callback: &str, cmd: &mut CmdData) -> bool {
        let target = self.plugins.iter().find_map(|record| {
            record
                .callbacks
                .get(callback)
                .map(|cb| (record.name().to_string(), *cb))
        });
        let Some((name, cb)) = target else {
            cmd.failed = true;
            return false;
        };

        self.invoke_user(&name, callback, cb, cmd);
        true
    }

    /// Invoke `callback` on the plugin named `plugin`; noop when either
    /// is absent.
    pub fn call_plugin(&mut self, plugin: &str, callback: &str, cmd: &mut CmdData) {
        let Some(idx) = self.index_of(plugin) else {
            return;
        };
        let Some(cb) = self.plugins[idx].callbacks.get(callback).copied() else {
            return;
        };
        let name = plugin.to_string();
        self.invoke_user(&name, callback, cb, cmd);
    }

    fn invoke_user(
        &mut self,
        name: &str,
        callback: &str,
        cb: PluginCallback,
        cmd: &mut CmdData,
    ) {
        let Some(idx) = self.index_of(name) else {
            return;
        };
        let plugin = self.plugins[idx].handle_ptr();

        match invoke(cb, plugin, cmd) {
            CallOutcome::Completed { failed: false } => {}
            CallOutcome::Completed { failed: true } => {
                // The caller observes the flag; the plugin stays loaded.
                let message = HostError::CallbackFailed {
                    plugin: name.to_string(),
                    callback: callback.to_string(),
                }
                .to_string();
                self.notify_all(&message);
            }
            CallOutcome::Panicked { message } => {
                cmd.failed = true;
                self.crash_unload(name, callback, &message);
            }
        }
    }

    /// Notify-and-unload policy for a crashed callback
    pub(crate) fn crash_unload(&mut self, name: &str, callback: &str, panic: &str) {
        tracing::error!(plugin = %name, callback, message = %panic, "plugin callback crashed");
        let message = HostError::CallbackPanicked {
            plugin: name.to_string(),
            callback: callback.to_string(),
            message: panic.to_string(),
        }
        .to_string();
        self.unload_plugin(name, true);
        self.notify_all(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testutil::{self, TestPlugin};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C-unwind" fn panicking(_plugin: *mut PluginHandle, _cmd: *mut CmdData) {
        panic!("deliberate test panic");
    }

    unsafe extern "C-unwind" fn failing(_plugin: *mut PluginHandle, cmd: *mut CmdData) {
        unsafe { &mut *cmd }.fail();
    }

    #[test]
    fn test_invoke_contains_panics() {
        let mut handle = PluginHandle::new("t");
        let mut cmd = CmdData::new();
        match invoke(panicking, &mut handle, &mut cmd) {
            CallOutcome::Panicked { message } => assert!(message.contains("deliberate")),
            CallOutcome::Completed { .. } => panic!("panic escaped containment"),
        }
    }

    #[test]
    fn test_notify_dispatches_in_insertion_order() {
        static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

        unsafe extern "C-unwind" fn first(_p: *mut PluginHandle, _c: *mut CmdData) {
            ORDER.lock().unwrap().push("first");
        }
        unsafe extern "C-unwind" fn second(_p: *mut PluginHandle, _c: *mut CmdData) {
            ORDER.lock().unwrap().push("second");
        }

        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "plg1",
            TestPlugin {
                on_notify: Some(first),
                ..TestPlugin::default()
            },
        );
        testutil::install(
            &mut manager,
            "plg2",
            TestPlugin {
                on_notify: Some(second),
                ..TestPlugin::default()
            },
        );

        manager.notify_all("hello");
        assert_eq!(*ORDER.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_notify_crash_unloads_and_nulls_slot() {
        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "bad",
            TestPlugin {
                on_notify: Some(panicking),
                ..TestPlugin::default()
            },
        );
        testutil::install(&mut manager, "good", TestPlugin::default());

        manager.notify_all("boom trigger");
        assert_eq!(manager.plugin_names(), vec!["good"]);
    }

    #[test]
    fn test_notify_failure_keeps_plugin_loaded() {
        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "grumpy",
            TestPlugin {
                on_notify: Some(failing),
                ..TestPlugin::default()
            },
        );

        manager.notify_all("hello");
        manager.notify_all("again");
        assert_eq!(manager.plugin_names(), vec!["grumpy"]);
    }

    #[test]
    fn test_tick_crash_unloads_offender() {
        static TICKS: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C-unwind" fn counting(_p: *mut PluginHandle, _c: *mut CmdData) {
            TICKS.fetch_add(1, Ordering::SeqCst);
        }

        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "crasher",
            TestPlugin {
                on_tick: Some(panicking),
                ..TestPlugin::default()
            },
        );
        testutil::install(
            &mut manager,
            "steady",
            TestPlugin {
                on_tick: Some(counting),
                ..TestPlugin::default()
            },
        );

        manager.tick_all();
        assert_eq!(manager.plugin_names(), vec!["steady"]);
        assert_eq!(TICKS.load(Ordering::SeqCst), 1, "survivor still ticked");

        manager.tick_all();
        assert_eq!(TICKS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ready_crash_nulls_slot_and_unloads() {
        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "eager",
            TestPlugin {
                on_ready: Some(panicking),
                ..TestPlugin::default()
            },
        );

        manager.ready_all();
        assert!(manager.plugin_names().is_empty());
    }

    #[test]
    fn test_call_hits_first_claimant_only() {
        static HITS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

        unsafe extern "C-unwind" fn claimant_a(_p: *mut PluginHandle, cmd: *mut CmdData) {
            HITS.lock().unwrap().push("a");
            unsafe { &mut *cmd }.push_return("from-a");
        }
        unsafe extern "C-unwind" fn claimant_b(_p: *mut PluginHandle, _c: *mut CmdData) {
            HITS.lock().unwrap().push("b");
        }

        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "plg1",
            TestPlugin {
                callbacks: vec![("shared", claimant_a)],
                ..TestPlugin::default()
            },
        );
        testutil::install(
            &mut manager,
            "plg2",
            TestPlugin {
                callbacks: vec![("shared", claimant_b)],
                ..TestPlugin::default()
            },
        );

        let mut cmd = CmdData::with_params(["testmain"]);
        assert!(manager.call("shared", &mut cmd));
        assert_eq!(cmd.first_return(), Some("from-a"));
        assert!(!cmd.failed);
        assert_eq!(*HITS.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_call_unknown_sets_failed() {
        let mut manager = testutil::manager();
        testutil::install(&mut manager, "plg1", TestPlugin::default());

        let mut cmd = CmdData::new();
        assert!(!manager.call("noSuchCallback", &mut cmd));
        assert!(cmd.failed);
    }

    #[test]
    fn test_call_plugin_is_noop_when_absent() {
        let mut manager = testutil::manager();
        let mut cmd = CmdData::new();
        manager.call_plugin("ghost", "anything", &mut cmd);
        assert!(!cmd.failed);
    }

    #[test]
    fn test_user_callback_crash_unloads_plugin() {
        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "fragile",
            TestPlugin {
                callbacks: vec![("explode", panicking)],
                ..TestPlugin::default()
            },
        );

        let mut cmd = CmdData::new();
        manager.call("explode", &mut cmd);
        assert!(cmd.failed);
        assert!(manager.plugin_names().is_empty());
    }

    #[test]
    fn test_unload_during_broadcast_skips_unloaded_peer() {
        static LATE_CALLS: AtomicUsize = AtomicUsize::new(0);
        static EVICTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

        // plg1 unloads plg2 from inside the broadcast, before plg2's
        // turn. The flag keeps the eviction from re-firing on the notify
        // broadcasts the unload itself produces.
        unsafe extern "C-unwind" fn evict_peer(plugin: *mut PluginHandle, _c: *mut CmdData) {
            if EVICTED.swap(true, Ordering::SeqCst) {
                return;
            }
            let plugin = unsafe { &mut *plugin };
            let mut cmd = CmdData::with_params(["punload", "plg2"]);
            plugin.command(&mut cmd);
        }
        unsafe extern "C-unwind" fn late(_p: *mut PluginHandle, _c: *mut CmdData) {
            LATE_CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let mut manager = testutil::manager();
        testutil::install(
            &mut manager,
            "plg1",
            TestPlugin {
                on_notify: Some(evict_peer),
                ..TestPlugin::default()
            },
        );
        testutil::install(
            &mut manager,
            "plg2",
            TestPlugin {
                on_notify: Some(late),
                ..TestPlugin::default()
            },
        );

        manager.notify_all("go");
        assert_eq!(manager.plugin_names(), vec!["plg1"]);
        assert_eq!(
            LATE_CALLS.load(Ordering::SeqCst),
            0,
            "plg2 was unloaded mid-broadcast and must not be called"
        );
    }
}
