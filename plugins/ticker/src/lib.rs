//! Demonstration dock plugin that depends on the hello plugin.
//!
//! Its tick counter lives in the manager-scoped data slot, so the count
//! survives hot reloads of this library.

use dock_plugin_api::{CmdData, PluginHandle, export_callbacks};

fn on_depends(_plugin: &mut PluginHandle, cmd: &mut CmdData) {
    cmd.push_return("hello");
}

fn on_load(plugin: &mut PluginHandle, _cmd: &mut CmdData) {
    plugin.declare(["tickCount"]);

    if let Some(slot) = plugin.shared_slot()
        && slot.is_empty()
    {
        slot.store(0u64);
    }

    // The dependency is guaranteed loaded by now.
    let mut call = CmdData::new();
    call.push_param(plugin.name().to_string());
    if plugin.call("greet", &mut call)
        && let Some(reply) = call.first_return()
    {
        let reply = reply.to_string();
        plugin.notify(&reply);
    }
}

fn on_tick(plugin: &mut PluginHandle, _cmd: &mut CmdData) {
    if let Some(slot) = plugin.shared_slot()
        && let Some(count) = unsafe { slot.get_ref::<u64>() }
    {
        *count += 1;
    }
}

fn on_ready(plugin: &mut PluginHandle, _cmd: &mut CmdData) {
    plugin.notify("ticker ready");
}

fn tick_count(plugin: &mut PluginHandle, cmd: &mut CmdData) {
    let count = plugin
        .shared_slot()
        .and_then(|slot| unsafe { slot.get_ref::<u64>() }.map(|c| *c))
        .unwrap_or(0);
    cmd.push_return(count.to_string());
}

export_callbacks! {
    onDepends => on_depends,
    onLoad => on_load,
    onTick => on_tick,
    onReady => on_ready,
    tickCount => tick_count,
}
