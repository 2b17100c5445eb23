//! PluginHandle - the plugin-facing half of a loaded plugin's record

use std::collections::BTreeSet;
use std::ffi::c_void;

use crate::CmdData;

/// Destructor hook for an opaque data slot.
pub type DataDropFn = unsafe extern "C-unwind" fn(*mut c_void);

/// An opaque storage slot.
///
/// The slot owns a raw pointer and an optional destructor hook. The host
/// never interprets the bytes; it only honors the lifetime rule: the
/// destructor runs on an explicit [`free`](DataSlot::free) (or when the
/// slot is overwritten), at a time the code behind the hook is still
/// loaded.
///
/// A slot dropped without an explicit free deliberately leaks its
/// contents: the destructor may point into a library that has already
/// been unloaded, so running it late is never safe.
#[derive(Debug)]
pub struct DataSlot {
    ptr: *mut c_void,
    drop_fn: Option<DataDropFn>,
}

impl DataSlot {
    /// An unoccupied slot
    pub const fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            drop_fn: None,
        }
    }

    /// Whether the slot holds anything
    pub fn is_empty(&self) -> bool {
        self.ptr.is_null()
    }

    /// The stored pointer (null when empty)
    pub fn get(&self) -> *mut c_void {
        self.ptr
    }

    /// Store a pointer and its destructor hook, freeing any previous value
    pub fn set(&mut self, ptr: *mut c_void, drop_fn: Option<DataDropFn>) {
        self.free();
        self.ptr = ptr;
        self.drop_fn = drop_fn;
    }

    /// Store an owned value, deriving the destructor from its type
    pub fn store<T>(&mut self, value: T) {
        unsafe extern "C-unwind" fn drop_box<T>(ptr: *mut c_void) {
            unsafe { drop(Box::from_raw(ptr as *mut T)) };
        }
        self.set(Box::into_raw(Box::new(value)) as *mut c_void, Some(drop_box::<T>));
    }

    /// Borrow the stored value as `T`.
    ///
    /// # Safety
    /// The slot must hold a pointer produced by [`store::<T>`](DataSlot::store)
    /// (or an equivalent allocation of `T`).
    pub unsafe fn get_ref<T>(&self) -> Option<&mut T> {
        unsafe { (self.ptr as *mut T).as_mut() }
    }

    /// Run the destructor hook and reset the slot
    pub fn free(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        if let Some(drop_fn) = self.drop_fn {
            unsafe { drop_fn(self.ptr) };
        }
        self.ptr = std::ptr::null_mut();
        self.drop_fn = None;
    }
}

impl Default for DataSlot {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for DataSlot {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            tracing::debug!("data slot dropped without free; contents leaked");
        }
    }
}

/// Function table through which plugin code reaches the manager.
///
/// Installed by the host when the plugin's library is opened. Plugins use
/// the safe wrappers on [`PluginHandle`] instead of calling through this
/// directly.
#[derive(Clone, Copy)]
pub struct HostVtbl {
    /// Opaque manager pointer threaded through every entry
    pub host: *mut c_void,
    /// Invoke the first claimant of a named callback; false if unclaimed
    pub call: unsafe fn(*mut c_void, &str, &mut CmdData) -> bool,
    /// Invoke a named callback on a specific plugin
    pub call_plugin: unsafe fn(*mut c_void, &str, &str, &mut CmdData),
    /// Broadcast a notify message
    pub notify: unsafe fn(*mut c_void, &str),
    /// Route a textual command
    pub command: unsafe fn(*mut c_void, &mut CmdData),
    /// Manager-scoped data slot for the named plugin
    pub shared_slot: unsafe fn(*mut c_void, &str) -> *mut DataSlot,
}

/// The half of a plugin's record that plugin code sees and mutates.
///
/// A stable pointer to this struct is the first argument of every
/// callback. Plugins write their user-defined callback names into
/// [`cindex`](PluginHandle::declare) during `onLoad`, stash per-instance
/// state in [`data`](PluginHandle::data), and reach the manager through
/// the installed host table.
pub struct PluginHandle {
    name: String,
    /// Names of the user-defined callbacks this plugin exports
    pub cindex: BTreeSet<String>,
    /// Plugin-scoped opaque storage, destroyed with the plugin
    pub data: DataSlot,
    host: Option<HostVtbl>,
}

impl PluginHandle {
    /// Create a handle for the named plugin (host-side)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cindex: BTreeSet::new(),
            data: DataSlot::empty(),
            host: None,
        }
    }

    /// The plugin's unique name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare user-defined callback names for symbol resolution.
    ///
    /// Call from `onLoad`; the host resolves each declared name against
    /// the library's exports right after `onLoad` returns.
    pub fn declare<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cindex.extend(names.into_iter().map(Into::into));
    }

    /// Install the host table (host-side, at load)
    pub fn install_host(&mut self, vtbl: HostVtbl) {
        self.host = Some(vtbl);
    }

    /// Invoke the first plugin claiming `callback`; false if none does
    pub fn call(&mut self, callback: &str, cmd: &mut CmdData) -> bool {
        match self.host {
            Some(v) => unsafe { (v.call)(v.host, callback, cmd) },
            None => false,
        }
    }

    /// Invoke `callback` on the plugin named `plugin`; noop if absent
    pub fn call_plugin(&mut self, plugin: &str, callback: &str, cmd: &mut CmdData) {
        if let Some(v) = self.host {
            unsafe { (v.call_plugin)(v.host, plugin, callback, cmd) };
        }
    }

    /// Broadcast a notify message through the manager
    pub fn notify(&mut self, message: &str) {
        if let Some(v) = self.host {
            unsafe { (v.notify)(v.host, message) };
        }
    }

    /// Route a textual command through the manager
    pub fn command(&mut self, cmd: &mut CmdData) {
        if let Some(v) = self.host {
            unsafe { (v.command)(v.host, cmd) };
        }
    }

    /// This plugin's manager-scoped data slot.
    ///
    /// The slot is keyed by plugin name and survives unload/reload
    /// cycles; use it for state that must outlive a hot reload.
    pub fn shared_slot(&mut self) -> Option<&mut DataSlot> {
        let v = self.host?;
        unsafe { (v.shared_slot)(v.host, &self.name).as_mut() }
    }
}
