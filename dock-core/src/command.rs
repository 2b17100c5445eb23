//! Command router: reserved verbs plus delegation to plugin callbacks.
//!
//! The reserved verbs live in an internal callback table installed at
//! `init`; anything else is forwarded to [`Manager::call`] with the verb
//! token stripped. This is the single ingress for textual control, shared
//! by the host and every plugin.

use dock_plugin_api::CmdData;

use crate::manager::Manager;
use crate::monitor::RunState;

pub(crate) type InternalFn = fn(&mut Manager, &mut CmdData);

/// One reserved verb in the internal callback table
pub(crate) struct InternalCommand {
    pub name: &'static str,
    pub run: InternalFn,
}

/// The reserved verb table, installed into the manager at `init`
pub(crate) fn internal_table() -> Vec<InternalCommand> {
    [
        ("quit", cmd_quit as InternalFn),
        ("exit", cmd_quit),
        ("notify", cmd_notify),
        ("getVersion", cmd_get_version),
        ("getVersionBanner", cmd_get_version_banner),
        ("plist", cmd_plist),
        ("pload", cmd_pload),
        ("preload", cmd_pload),
        ("punload", cmd_punload),
        ("ppause", cmd_ppause),
        ("presume", cmd_presume),
        ("pstop", cmd_pstop),
    ]
    .into_iter()
    .map(|(name, run)| InternalCommand { name, run })
    .collect()
}

impl Manager {
    /// Route a command envelope: reserved verbs map to manager
    /// operations, anything else is offered to the plugins.
    pub fn call_command(&mut self, cmd: &mut CmdData) {
        let Some(verb) = cmd.params.first().cloned() else {
            cmd.failed = true;
            return;
        };
        if verb.is_empty() {
            cmd.failed = true;
            return;
        }

        if let Some(run) = self
            .internal
            .iter()
            .find(|command| command.name == verb)
            .map(|command| command.run)
        {
            tracing::debug!(%verb, "reserved verb");
            run(self, cmd);
        } else {
            cmd.params.remove(0);
            self.call(&verb, cmd);
        }
    }

    /// Tokenize a command line and route it
    pub fn run_command(&mut self, line: &str) -> CmdData {
        let mut cmd = CmdData::with_params(line.split_whitespace());
        self.call_command(&mut cmd);
        cmd
    }

    // ─── Typed verbs ─────────────────────────────────────────────────

    /// Set the run state to `Stopped`; the host loop observes it
    pub fn quit(&mut self) {
        self.state = RunState::Stopped;
    }

    /// The embedded build identifier
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Version plus compile date/time and toolchain tag
    pub fn version_banner(&self) -> String {
        format!(
            "dock {} ({}, {})",
            self.version(),
            env!("DOCK_BUILD_TIMESTAMP"),
            env!("DOCK_RUSTC_VERSION"),
        )
    }

    /// Re-pick the named plugins on the next scan; all of them when
    /// `names` is empty
    pub fn pload(&mut self, names: &[String]) {
        if names.is_empty() {
            self.monitor.clear_processed();
        } else {
            self.monitor.mark_unprocessed(names);
        }
    }

    /// Unload the named plugins (warning for unknown names); everything
    /// when `names` is empty
    pub fn punload(&mut self, names: &[String]) {
        if names.is_empty() {
            self.unload_all();
            return;
        }
        for name in names {
            if !self.unload_plugin(name, true) {
                let message = format!("Plugin '{name}' not loaded");
                self.notify_all(&message);
            }
        }
    }

    /// Pause directory scanning
    pub fn ppause(&self) {
        self.monitor.pause();
    }

    /// Resume directory scanning
    pub fn presume(&self) {
        self.monitor.resume();
    }

    /// Stop the monitor thread; plugins stay loaded
    pub fn pstop(&self) {
        self.monitor.stop();
    }
}

fn cmd_quit(manager: &mut Manager, _cmd: &mut CmdData) {
    manager.quit();
}

fn cmd_notify(manager: &mut Manager, cmd: &mut CmdData) {
    let message = cmd.params[1..].join(" ");
    manager.notify_all(&message);
}

fn cmd_get_version(manager: &mut Manager, cmd: &mut CmdData) {
    let version = manager.version();
    cmd.push_return(version);
}

fn cmd_get_version_banner(manager: &mut Manager, cmd: &mut CmdData) {
    let banner = manager.version_banner();
    cmd.push_return(banner);
}

fn cmd_plist(manager: &mut Manager, cmd: &mut CmdData) {
    for name in manager.plugin_names() {
        cmd.push_return(name);
    }
}

fn cmd_pload(manager: &mut Manager, cmd: &mut CmdData) {
    let names = cmd.params[1..].to_vec();
    manager.pload(&names);
}

fn cmd_punload(manager: &mut Manager, cmd: &mut CmdData) {
    let names = cmd.params[1..].to_vec();
    manager.punload(&names);
}

fn cmd_ppause(manager: &mut Manager, _cmd: &mut CmdData) {
    manager.ppause();
}

fn cmd_presume(manager: &mut Manager, _cmd: &mut CmdData) {
    manager.presume();
}

fn cmd_pstop(manager: &mut Manager, _cmd: &mut CmdData) {
    manager.pstop();
}
