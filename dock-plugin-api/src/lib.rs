//! dock-plugin-api - Plugin ABI for the dock plugin host
//!
//! This crate defines everything a plugin and the host share: the
//! [`CmdData`] call envelope, the [`PluginHandle`] record plugin callbacks
//! receive, the [`HostVtbl`] through which plugins reach the manager, and
//! the symbol contract.
//!
//! A plugin is a `cdylib` exporting `extern "C-unwind"` symbols with the
//! [`PluginCallback`] signature: a required `onLoad`, the optional
//! lifecycle entries (`onUnload`, `onTick`, `onNotify`, `onReady`,
//! `onDepends`), and any number of user-defined entries whose names the
//! plugin writes into `plugin.cindex` during `onLoad`.
//!
//! # Example
//!
//! ```ignore
//! use dock_plugin_api::{CmdData, PluginHandle, export_callbacks};
//!
//! fn on_load(plugin: &mut PluginHandle, _cmd: &mut CmdData) {
//!     plugin.declare(["greet"]);
//!     plugin.notify("hello plugin loaded");
//! }
//!
//! fn greet(_plugin: &mut PluginHandle, cmd: &mut CmdData) {
//!     cmd.push_return("hello!");
//! }
//!
//! export_callbacks! {
//!     onLoad => on_load,
//!     greet => greet,
//! }
//! ```

mod cmd;
mod handle;

pub use cmd::CmdData;
pub use handle::{DataDropFn, DataSlot, HostVtbl, PluginHandle};

/// Signature of every plugin callback, lifecycle or user-defined.
pub type PluginCallback = unsafe extern "C-unwind" fn(*mut PluginHandle, *mut CmdData);

/// Required entry, invoked once all declared dependencies are loaded.
pub const ON_LOAD: &str = "onLoad";
/// Optional, invoked before the library is closed.
pub const ON_UNLOAD: &str = "onUnload";
/// Optional, invoked once per host sync.
pub const ON_TICK: &str = "onTick";
/// Optional, invoked for every notify broadcast.
pub const ON_NOTIFY: &str = "onNotify";
/// Optional, invoked once when the host finishes its initial load pass.
pub const ON_READY: &str = "onReady";
/// Optional, invoked right after the library opens to declare dependencies.
pub const ON_DEPENDS: &str = "onDepends";

/// Export plugin callbacks under their ABI symbol names.
///
/// Each entry maps an exported symbol to a plain Rust function taking
/// `(&mut PluginHandle, &mut CmdData)`. The generated wrappers carry the
/// `extern "C-unwind"` ABI so panics unwind into the host's containment
/// barrier instead of aborting.
///
/// ```ignore
/// export_callbacks! {
///     onLoad => on_load,
///     onTick => on_tick,
///     myCallback => my_callback,
/// }
/// ```
#[macro_export]
macro_rules! export_callbacks {
    ($($symbol:ident => $func:path),+ $(,)?) => {
        $(
            #[unsafe(no_mangle)]
            #[allow(non_snake_case)]
            pub unsafe extern "C-unwind" fn $symbol(
                plugin: *mut $crate::PluginHandle,
                cmd: *mut $crate::CmdData,
            ) {
                let (Some(plugin), Some(cmd)) =
                    (unsafe { plugin.as_mut() }, unsafe { cmd.as_mut() })
                else {
                    return;
                };
                $func(plugin, cmd)
            }
        )+
    };
}
