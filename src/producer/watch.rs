// src/producer/watch.rs
use crate::bus::EventBus;
use crate::event::ChangeEvent;
use crate::paths;
use crate::producer::RecentMutations;
use anyhow::{Context, Result};
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::Watcher as _;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often the watcher thread checks whether the bus has been shut down.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Settings for the filesystem-watch producer.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Replicated root directory.
    pub root: PathBuf,
    /// Quiet period before a burst of raw notifications is reported.
    pub debounce: Duration,
}

/// A raw watch signal, already classified as file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchSignal {
    FileAdded(PathBuf),
    FileChanged(PathBuf),
    DirAdded(PathBuf),
    FileRemoved(PathBuf),
    DirRemoved(PathBuf),
}

/// Starts the filesystem-watch producer on a dedicated thread.
///
/// The debouncer and the recursive watch on the root are set up before this
/// returns, so a root that cannot be watched is reported to the caller. The
/// thread then runs until the bus is shut down, publishing a
/// [`ChangeEvent`] for every change under the root except hidden
/// (dot-prefixed) paths and paths the CRUD layer mutated recently.
pub fn spawn_watcher(
    options: WatchOptions,
    bus: EventBus,
    recent: RecentMutations,
) -> Result<JoinHandle<()>> {
    let root = options
        .root
        .canonicalize()
        .with_context(|| format!("Cannot resolve watch root {}", options.root.display()))?;
    if !root.is_dir() {
        anyhow::bail!("Watch root is not a directory: {}", root.display());
    }

    // std channel between the debouncer's own thread and ours.
    let (debouncer_tx, debouncer_rx) = std::sync::mpsc::channel::<DebounceEventResult>();
    let mut debouncer = new_debouncer(options.debounce, None, debouncer_tx)
        .context("Failed to create debouncer")?;
    debouncer
        .watcher()
        .watch(&root, notify::RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    debouncer
        .cache()
        .add_root(&root, notify::RecursiveMode::Recursive);

    let mut state = WatchState::new(root, bus, recent);
    info!(
        "[WatcherThread] Watching {} ({} known directories)",
        state.root.display(),
        state.known_dirs.len()
    );

    let handle = std::thread::Builder::new()
        .name("dropmirror-watch".to_string())
        .spawn(move || {
            loop {
                if state.bus.is_closed() {
                    info!("[WatcherThread] Event bus closed, stopping watcher.");
                    break;
                }
                match debouncer_rx.recv_timeout(SHUTDOWN_POLL) {
                    Ok(Ok(events)) => {
                        for debounced in events {
                            state.handle_event(&debounced.event);
                        }
                    }
                    Ok(Err(errors)) => {
                        for error in errors {
                            error!("[WatcherThread] Debouncer reported error: {:?}", error);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        error!("[WatcherThread] Debouncer channel closed. Watcher thread exiting.");
                        break;
                    }
                }
            }
            // The debouncer lives exactly as long as this thread.
            drop(debouncer);
        })
        .context("Failed to spawn watcher thread")?;

    Ok(handle)
}

struct WatchState {
    root: PathBuf,
    bus: EventBus,
    recent: RecentMutations,
    /// Directories believed to exist; removals often arrive without a kind hint.
    known_dirs: HashSet<PathBuf>,
}

impl WatchState {
    fn new(root: PathBuf, bus: EventBus, recent: RecentMutations) -> Self {
        let known_dirs = walk(&root)
            .into_iter()
            .filter_map(|(path, is_dir)| is_dir.then_some(path))
            .collect();
        WatchState {
            root,
            bus,
            recent,
            known_dirs,
        }
    }

    fn handle_event(&mut self, event: &notify::Event) {
        for signal in classify(event, &self.known_dirs) {
            match signal {
                WatchSignal::DirAdded(ref dir) => {
                    let dir = dir.clone();
                    self.known_dirs.insert(dir.clone());
                    self.emit(signal);
                    // Contents of a directory moved in as a whole never get their own notifications.
                    for (path, is_dir) in walk(&dir) {
                        if is_dir {
                            self.known_dirs.insert(path.clone());
                            self.emit(WatchSignal::DirAdded(path));
                        } else {
                            self.emit(WatchSignal::FileAdded(path));
                        }
                    }
                }
                WatchSignal::DirRemoved(ref dir) => {
                    let dir = dir.clone();
                    self.known_dirs.retain(|known| !known.starts_with(&dir));
                    self.emit(signal);
                }
                other => self.emit(other),
            }
        }
    }

    fn emit(&self, signal: WatchSignal) {
        let abs = match &signal {
            WatchSignal::FileAdded(p)
            | WatchSignal::FileChanged(p)
            | WatchSignal::DirAdded(p)
            | WatchSignal::FileRemoved(p)
            | WatchSignal::DirRemoved(p) => p,
        };
        let Some(rel) = paths::to_relative(&self.root, abs) else {
            debug!("[WatcherThread] Ignoring path outside root: {}", abs.display());
            return;
        };
        if paths::is_hidden(&rel) {
            return;
        }
        if self.recent.is_recent(&rel) {
            debug!(
                "[WatcherThread] Suppressing {:?}, already published by CRUD layer",
                signal
            );
            return;
        }

        let event = match &signal {
            WatchSignal::FileAdded(path) => {
                read_body(path).and_then(|body| ChangeEvent::create_file(rel.as_str(), body).ok())
            }
            WatchSignal::FileChanged(path) => {
                read_body(path).and_then(|body| ChangeEvent::update(rel.as_str(), body).ok())
            }
            WatchSignal::DirAdded(_) => ChangeEvent::create_dir(rel.as_str()).ok(),
            WatchSignal::FileRemoved(_) => ChangeEvent::delete(rel.as_str(), false).ok(),
            WatchSignal::DirRemoved(_) => ChangeEvent::delete(rel.as_str(), true).ok(),
        };

        if let Some(event) = event {
            debug!("[WatcherThread] Produced event: {} {}", event.kind(), event.path());
            self.bus.publish(event);
        }
    }
}

/// Reads a file whose add/change notification just fired. The file may
/// already be gone again; that is logged and skipped.
fn read_body(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(body) => Some(body),
        Err(e) => {
            warn!(
                "[WatcherThread] Could not read {}: {}. Event skipped.",
                path.display(),
                e
            );
            None
        }
    }
}

fn added(path: &Path) -> Option<WatchSignal> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if meta.is_dir() {
        Some(WatchSignal::DirAdded(path.to_path_buf()))
    } else if meta.is_file() {
        Some(WatchSignal::FileAdded(path.to_path_buf()))
    } else {
        None
    }
}

fn removed(path: &Path, known_dirs: &HashSet<PathBuf>) -> WatchSignal {
    if known_dirs.contains(path) {
        WatchSignal::DirRemoved(path.to_path_buf())
    } else {
        WatchSignal::FileRemoved(path.to_path_buf())
    }
}

/// Maps one notify event onto zero or more classified signals.
fn classify(event: &notify::Event, known_dirs: &HashSet<PathBuf>) -> Vec<WatchSignal> {
    let paths = &event.paths;
    match event.kind {
        EventKind::Create(CreateKind::File) => paths
            .iter()
            .map(|p| WatchSignal::FileAdded(p.clone()))
            .collect(),
        EventKind::Create(CreateKind::Folder) => paths
            .iter()
            .map(|p| WatchSignal::DirAdded(p.clone()))
            .collect(),
        EventKind::Create(_) => paths.iter().filter_map(|p| added(p)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut signals = vec![removed(&paths[0], known_dirs)];
            signals.extend(added(&paths[1]));
            signals
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().map(|p| removed(p, known_dirs)).collect()
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|p| added(p).unwrap_or_else(|| removed(p, known_dirs)))
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths
            .iter()
            .filter(|p| p.is_file())
            .map(|p| WatchSignal::FileChanged(p.clone()))
            .collect(),
        EventKind::Remove(RemoveKind::File) => paths
            .iter()
            .map(|p| WatchSignal::FileRemoved(p.clone()))
            .collect(),
        EventKind::Remove(RemoveKind::Folder) => paths
            .iter()
            .map(|p| WatchSignal::DirRemoved(p.clone()))
            .collect(),
        EventKind::Remove(_) => paths.iter().map(|p| removed(p, known_dirs)).collect(),
        _ => {
            debug!(
                "[WatcherThread] Unhandled or ignored event kind: {:?} for {:?}",
                event.kind, paths
            );
            Vec::new()
        }
    }
}

/// Lists everything below `dir` (not `dir` itself), parents before children,
/// skipping dot-prefixed entries.
fn walk(dir: &Path) -> Vec<(PathBuf, bool)> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[WatcherThread] Cannot list {}: {}", current.display(), e);
                continue;
            }
        };
        let mut children: Vec<_> = entries.filter_map(|entry| entry.ok()).collect();
        children.sort_by_key(|entry| entry.file_name());
        for entry in children {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                out.push((path.clone(), true));
                pending.push(path);
            } else if file_type.is_file() {
                out.push((path, false));
            }
        }
    }
    out
}
