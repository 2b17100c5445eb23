//! Background monitor: scans plugin directories, compiles stale sources,
//! and publishes load requests to the host thread.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::SystemTime;

use crate::compile::Compiler;
use crate::config::{ManagerConfig, ScanMode};
use crate::filter::NameFilter;

/// Run state shared by the manager and the monitor worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Executing,
    Paused,
    Stopped,
}

/// The single record shared between the monitor thread and the host
/// thread. Every field is accessed under the lock; the lock is only ever
/// held for bookkeeping, never across directory walks or compiles.
#[derive(Debug)]
pub(crate) struct MonitorShared {
    pub state: RunState,
    pub paths: Vec<PathBuf>,
    /// Load requests for the host. Entries that do not name an existing
    /// file are error messages.
    pub queue: BTreeSet<String>,
    /// Plugin names already handled this scan generation
    pub processed: HashSet<String>,
    /// All initial candidates handled at least once
    pub ready: bool,
}

/// Owns the monitor worker thread and its shared record.
pub struct Monitor {
    shared: Arc<Mutex<MonitorShared>>,
    worker: Option<JoinHandle<()>>,
}

fn lock(shared: &Mutex<MonitorShared>) -> MutexGuard<'_, MonitorShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Monitor {
    /// Spawn the worker over the configured directories
    pub fn start(config: &ManagerConfig) -> Self {
        let mut monitor = Self::unstarted(config);
        let shared = Arc::clone(&monitor.shared);
        let config = config.clone();
        let worker = std::thread::Builder::new()
            .name("dock-monitor".into())
            .spawn(move || worker_loop(&shared, &config))
            .expect("failed to spawn monitor thread");
        monitor.worker = Some(worker);
        monitor
    }

    /// Shared record without a worker; scan cycles are driven manually
    pub(crate) fn unstarted(config: &ManagerConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MonitorShared {
                state: RunState::Executing,
                paths: config.paths.clone(),
                queue: BTreeSet::new(),
                processed: HashSet::new(),
                ready: false,
            })),
            worker: None,
        }
    }

    pub fn state(&self) -> RunState {
        lock(&self.shared).state
    }

    pub fn pause(&self) {
        self.set_state(RunState::Paused);
    }

    pub fn resume(&self) {
        self.set_state(RunState::Executing);
    }

    /// Ask the worker to exit at its next wake
    pub fn stop(&self) {
        self.set_state(RunState::Stopped);
    }

    fn set_state(&self, state: RunState) {
        tracing::debug!(?state, "monitor state change");
        lock(&self.shared).state = state;
    }

    /// Join the worker after [`stop`](Monitor::stop)
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("monitor thread panicked");
        }
    }

    /// Take everything out of the load queue (non-blocking)
    pub fn drain(&self) -> Vec<String> {
        let mut guard = lock(&self.shared);
        std::mem::take(&mut guard.queue).into_iter().collect()
    }

    /// Whether the initial load pass has completed
    pub fn is_ready(&self) -> bool {
        lock(&self.shared).ready
    }

    /// Forget that the named plugins were handled, so the next scan
    /// re-picks them
    pub fn mark_unprocessed(&self, names: &[String]) {
        let mut guard = lock(&self.shared);
        for name in names {
            guard.processed.remove(name);
        }
    }

    /// Forget every handled plugin (reload all)
    pub fn clear_processed(&self) {
        lock(&self.shared).processed.clear();
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Mutex<MonitorShared>> {
        Arc::clone(&self.shared)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn worker_loop(shared: &Mutex<MonitorShared>, config: &ManagerConfig) {
    let compiler = Compiler::new(&config.compiler);
    let mut failed = HashMap::new();

    loop {
        let ready = lock(shared).ready;
        std::thread::sleep(config.poll_delay(ready));

        match lock(shared).state {
            RunState::Stopped => break,
            RunState::Paused => continue,
            RunState::Executing => {}
        }

        run_cycle(shared, config, &compiler, &mut failed);
    }
    tracing::debug!("monitor thread exiting");
}

/// One scan cycle. Reads an unlocked snapshot of the shared record,
/// stages results into local buffers, and publishes them under a short
/// re-acquire at the end.
pub(crate) fn run_cycle(
    shared: &Mutex<MonitorShared>,
    config: &ManagerConfig,
    compiler: &Compiler,
    failed: &mut HashMap<PathBuf, SystemTime>,
) {
    let (paths, processed) = {
        let guard = lock(shared);
        (guard.paths.clone(), guard.processed.clone())
    };

    let filter = NameFilter::load(&config.allow_file, &config.block_file);
    let extension = match config.mode {
        ScanMode::Binary => std::env::consts::DLL_EXTENSION,
        ScanMode::Source => config.source_extension.as_str(),
    };

    let mut candidates: Vec<(String, PathBuf)> = Vec::new();
    for dir in &paths {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(dir = %dir.display(), %error, "cannot scan plugin directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
                candidates.push((plugin_name(&path), path));
            }
        }
    }
    candidates.sort_by(|a, b| a.1.cmp(&b.1));

    let mut now_processed: Vec<String> = Vec::new();
    let mut enqueue: Vec<String> = Vec::new();

    for (name, path) in &candidates {
        if !filter.permits(name) {
            // Filtered names still count as handled so readiness can be
            // reached.
            now_processed.push(name.clone());
            continue;
        }

        match config.mode {
            ScanMode::Binary => {
                if !processed.contains(name) {
                    now_processed.push(name.clone());
                    enqueue.push(path.display().to_string());
                }
            }
            ScanMode::Source => {
                let library = library_path_for(path);
                let stale = is_stale(path, &library, &config.source_extension);

                if processed.contains(name) && !stale {
                    continue;
                }

                if !stale {
                    // Fresh candidate whose library is already current.
                    now_processed.push(name.clone());
                    enqueue.push(library.display().to_string());
                    continue;
                }

                // Don't re-run a compile that already failed for this
                // exact source state.
                if let (Some(at_failure), Some(current)) = (failed.get(path), mtime(path))
                    && current <= *at_failure
                {
                    continue;
                }

                let sidecar = sidecar_path(&library);
                match compiler.compile(path, &sidecar) {
                    Ok(()) => {
                        failed.remove(path);
                        now_processed.push(name.clone());
                        enqueue.push(sidecar.display().to_string());
                    }
                    Err(error) => {
                        if let Some(time) = mtime(path) {
                            failed.insert(path.clone(), time);
                        }
                        enqueue.push(error.to_string());
                    }
                }
            }
        }
    }

    let candidate_names: HashSet<&String> = candidates.iter().map(|(name, _)| name).collect();

    let mut guard = lock(shared);
    guard.processed.extend(now_processed);
    guard.queue.extend(enqueue);
    if !guard.ready && candidate_names.iter().all(|name| guard.processed.contains(*name)) {
        guard.ready = true;
        tracing::info!(
            plugins = candidate_names.len(),
            "initial plugin scan complete"
        );
    }
}

/// Plugin name for a library or source path: the file stem with any
/// platform library prefix stripped.
pub(crate) fn plugin_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = std::env::consts::DLL_PREFIX;
    match stem.strip_prefix(prefix) {
        Some(bare) if !prefix.is_empty() && !bare.is_empty() => bare.to_string(),
        _ => stem,
    }
}

/// Library path derived from a source path: same directory and stem,
/// platform dynamic-library extension.
pub(crate) fn library_path_for(source: &Path) -> PathBuf {
    source.with_extension(std::env::consts::DLL_EXTENSION)
}

/// Sidecar path a recompile targets: the library path with `.new`
/// appended.
pub(crate) fn sidecar_path(library: &Path) -> PathBuf {
    let mut name = library.as_os_str().to_os_string();
    name.push(".new");
    PathBuf::from(name)
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// A source is stale when no library exists, the source is newer than the
/// library, or a sibling directory with the same stem holds source
/// fragments newer than the library.
fn is_stale(source: &Path, library: &Path, source_ext: &str) -> bool {
    let Some(library_time) = mtime(library) else {
        return true;
    };
    if mtime(source).is_some_and(|t| t > library_time) {
        return true;
    }

    let fragments = source.with_extension("");
    if fragments.is_dir()
        && let Ok(entries) = std::fs::read_dir(&fragments)
    {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == source_ext)
                && mtime(&path).is_some_and(|t| t > library_time)
            {
                return true;
            }
        }
    }
    false
}
