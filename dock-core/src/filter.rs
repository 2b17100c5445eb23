//! allow.ini / block.ini name filter

use std::collections::HashSet;
use std::path::Path;

/// Whitelist/blacklist over plugin names, re-read every scan cycle.
///
/// Each file holds one name per line; blank lines and `#` comments are
/// ignored. An absent or empty file imposes no constraint.
#[derive(Debug, Default)]
pub struct NameFilter {
    allow: Option<HashSet<String>>,
    block: HashSet<String>,
}

impl NameFilter {
    /// Read both filter files; missing files mean "no constraint"
    pub fn load(allow_path: &Path, block_path: &Path) -> Self {
        Self {
            allow: read_names(allow_path),
            block: read_names(block_path).unwrap_or_default(),
        }
    }

    /// Whether the named plugin passes both filters
    pub fn permits(&self, name: &str) -> bool {
        if self.block.contains(name) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.contains(name),
            None => true,
        }
    }
}

/// Parse a filter file; `None` when the file is absent or names nothing
fn read_names(path: &Path) -> Option<HashSet<String>> {
    let content = std::fs::read_to_string(path).ok()?;
    let names: HashSet<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect();
    (!names.is_empty()).then_some(names)
}
