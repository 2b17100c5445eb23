//! Minimal dock plugin: answers `greet` calls and counts the notify
//! broadcasts it has seen in its plugin-scoped slot.

use dock_plugin_api::{CmdData, PluginHandle, export_callbacks};

fn on_load(plugin: &mut PluginHandle, _cmd: &mut CmdData) {
    plugin.declare(["greet"]);
    plugin.data.store(0u64);
    plugin.notify("hello plugin is up");
}

fn on_notify(plugin: &mut PluginHandle, _cmd: &mut CmdData) {
    if let Some(seen) = unsafe { plugin.data.get_ref::<u64>() } {
        *seen += 1;
    }
}

fn greet_impl(_plugin: &mut PluginHandle, cmd: &mut CmdData) {
    let who = cmd.first_param().unwrap_or("world").to_string();
    cmd.push_return(format!("hello, {who}"));
}

export_callbacks! {
    onLoad => on_load,
    onNotify => on_notify,
    greet => greet_impl,
}
