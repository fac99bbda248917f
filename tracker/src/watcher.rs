//! Workspace watcher for tracking activity without an editor plugin.
//!
//! Watches a workspace directory recursively and turns file system changes
//! into host notifications:
//!
//! | File system event | Host event |
//! |-------------------|------------|
//! | file created | [`HostEvent::Open`] |
//! | file modified | [`HostEvent::Edit`] |
//! | file removed | [`HostEvent::Close`] |
//!
//! Line counts are read from disk after every change, so the tracker sees
//! the same structured counts an editor would report. Hidden directories and
//! build output (`target`, `node_modules`) are ignored.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use codetrackr::source::SubscriptionSource;
//! use codetrackr::watcher::WorkspaceWatcher;
//!
//! # async fn demo(sink: codetrackr::source::EventSink) -> Result<(), codetrackr::source::SourceError> {
//! let mut watcher = WorkspaceWatcher::new(PathBuf::from("/home/user/projects/webapp"))?;
//! watcher.attach(sink)?;
//! # Ok(())
//! # }
//! ```

use std::path::{Component, Path, PathBuf};

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::source::{EventSink, SourceError, SubscriptionSource};
use crate::types::HostEvent;

/// Directory names never worth tracking.
const IGNORED_DIRS: &[&str] = &["target", "node_modules"];

/// Capacity of the bridge between the notify thread and the async task.
const INTERNAL_QUEUE_SIZE: usize = 1000;

/// Buffer size used when counting lines of a changed file.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Internal events from the notify callback, processed by the async task.
#[derive(Debug)]
enum InternalEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

/// Recursive file system watcher over a workspace directory.
#[derive(Debug)]
pub struct WorkspaceWatcher {
    root: PathBuf,

    /// Kept alive to maintain the watch subscription.
    watcher: Option<RecommendedWatcher>,

    task: Option<JoinHandle<()>>,
}

impl WorkspaceWatcher {
    /// Creates a watcher for `root`. Nothing is watched until
    /// [`SubscriptionSource::attach`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::PathNotFound`] if `root` is not a directory.
    pub fn new(root: PathBuf) -> Result<Self, SourceError> {
        if !root.is_dir() {
            return Err(SourceError::PathNotFound(root));
        }

        Ok(Self {
            root,
            watcher: None,
            task: None,
        })
    }

    /// Returns the directory being watched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true once the watcher has been attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.watcher.is_some()
    }
}

impl SubscriptionSource for WorkspaceWatcher {
    fn attach(&mut self, sink: EventSink) -> Result<(), SourceError> {
        if self.watcher.is_some() {
            return Err(SourceError::AlreadyAttached);
        }

        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_QUEUE_SIZE);
        let watcher = create_watcher(internal_tx, self.root.clone())?;
        self.task = Some(tokio::spawn(process_internal_events(internal_rx, sink)));
        self.watcher = Some(watcher);

        info!(root = %self.root.display(), "Watching workspace");
        Ok(())
    }
}

impl Drop for WorkspaceWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Creates the underlying notify watcher with a lightweight callback.
fn create_watcher(
    internal_tx: mpsc::Sender<InternalEvent>,
    root: PathBuf,
) -> Result<RecommendedWatcher, SourceError> {
    let callback_root = root.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            handle_notify_event(res, &callback_root, &internal_tx);
        },
        Config::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;
    debug!(root = %root.display(), "Started recursive file watch");

    Ok(watcher)
}

/// Filters notify events and forwards them to the async task.
///
/// Runs on the notify thread, so it never blocks and never touches the disk.
fn handle_notify_event(
    res: Result<Event, notify::Error>,
    root: &Path,
    internal_tx: &mpsc::Sender<InternalEvent>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "File watcher error");
            return;
        }
    };

    trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

    for path in &event.paths {
        if is_ignored(root, path) {
            continue;
        }

        let internal_event = match event.kind {
            EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
                InternalEvent::Created(path.clone())
            }
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                InternalEvent::Modified(path.clone())
            }
            EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
                InternalEvent::Removed(path.clone())
            }
            _ => continue,
        };

        // Dropping an event only delays the next line count observation.
        if let Err(e) = internal_tx.try_send(internal_event) {
            warn!(error = %e, "Failed to queue file event, channel may be full");
        }
    }
}

/// Reads line counts and forwards host events to the tracker.
async fn process_internal_events(mut rx: mpsc::Receiver<InternalEvent>, sink: EventSink) {
    while let Some(event) = rx.recv().await {
        let host_event = match event {
            InternalEvent::Created(path) => match read_line_count(&path).await {
                Some(line_count) => HostEvent::Open {
                    file: path,
                    line_count: Some(line_count),
                    language: None,
                },
                None => continue,
            },
            InternalEvent::Modified(path) => match read_line_count(&path).await {
                Some(line_count) => HostEvent::Edit {
                    file: path,
                    line_count: Some(line_count),
                    changes: Vec::new(),
                    language: None,
                },
                None => continue,
            },
            InternalEvent::Removed(path) => HostEvent::Close { file: path },
        };

        if sink.send(host_event).await.is_err() {
            debug!("Tracker closed, stopping workspace watcher");
            break;
        }
    }

    debug!("Workspace event processor shutting down");
}

/// Returns the line count of a regular file, or `None` for directories and
/// files that vanished before they could be read.
async fn read_line_count(path: &Path) -> Option<usize> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return None,
        Err(e) => {
            trace!(path = %path.display(), error = %e, "File disappeared before read");
            return None;
        }
    }

    match count_file_lines(path).await {
        Ok(lines) => Some(lines),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read file");
            None
        }
    }
}

/// Streams the file in fixed-size chunks so large files are never held in
/// memory. Counts lines the way editors do: an empty document has one line.
async fn count_file_lines(path: &Path) -> std::io::Result<usize> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::with_capacity(READ_CHUNK_SIZE, file);
    let mut newlines = 0;

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }
        let len = chunk.len();
        newlines += count_newlines(chunk);
        reader.consume(len);
    }

    Ok(newlines + 1)
}

fn count_newlines(chunk: &[u8]) -> usize {
    chunk.iter().filter(|&&b| b == b'\n').count()
}

/// Returns true for paths inside hidden or build output directories.
#[must_use]
pub fn is_ignored(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| name.starts_with('.') || IGNORED_DIRS.contains(&name)),
        _ => false,
    })
}
