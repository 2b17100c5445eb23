//! CmdData - the parameter/return envelope for a single callback invocation

use std::ffi::c_void;

/// Call envelope passed to every plugin callback.
///
/// The caller creates one, the callee mutates it, the caller consumes it
/// after the call returns. Parameters and return values come in two
/// flavors: strings for anything human-shaped, raw pointers for opaque
/// payloads the host never interprets.
///
/// The raw-pointer fields make this type `!Send`; an envelope never
/// crosses a thread boundary.
#[derive(Debug, Default)]
pub struct CmdData {
    /// Ordered string parameters
    pub params: Vec<String>,
    /// Ordered opaque pointer parameters
    pub ptr_params: Vec<*mut c_void>,
    /// Set by the callee to report failure
    pub failed: bool,
    /// Ordered string return values
    pub returned: Vec<String>,
    /// Ordered opaque pointer return values
    pub ptr_returned: Vec<*mut c_void>,
}

impl CmdData {
    /// Create an empty envelope
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an envelope with string parameters already in place
    pub fn with_params<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// First string parameter, if any
    pub fn first_param(&self) -> Option<&str> {
        self.params.first().map(String::as_str)
    }

    /// First string return value, if any
    pub fn first_return(&self) -> Option<&str> {
        self.returned.first().map(String::as_str)
    }

    /// Append a string parameter
    pub fn push_param(&mut self, param: impl Into<String>) -> &mut Self {
        self.params.push(param.into());
        self
    }

    /// Append a string return value
    pub fn push_return(&mut self, value: impl Into<String>) -> &mut Self {
        self.returned.push(value.into());
        self
    }

    /// Mark the call as failed
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Clear return values and the failed flag, keeping parameters.
    ///
    /// Useful when one envelope is re-dispatched to several callees.
    pub fn reset_results(&mut self) {
        self.returned.clear();
        self.ptr_returned.clear();
        self.failed = false;
    }
}
