//! Event sources feeding the tracker.
//!
//! A [`SubscriptionSource`] is anything that can observe the host editor (or
//! a stand-in for it) and push notifications into an [`EventSink`]. The sink
//! is a cheap, cloneable handle onto the tracker's command queue.
//!
//! Two sources ship with the crate:
//!
//! - [`JsonLinesFeed`]: newline-delimited [`HostEvent`] JSON from any async
//!   reader, e.g. an editor plugin piping into stdin
//! - [`crate::watcher::WorkspaceWatcher`]: file system changes under a
//!   workspace directory

use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::line_tracker::ContentChange;
use crate::scheduler::Command;
use crate::types::HostEvent;

/// Errors raised by event sources.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The tracker has shut down.
    #[error("tracker is no longer running")]
    Closed,

    /// The tracker's queue is full; the event was dropped.
    #[error("tracker event queue is full")]
    Full,

    /// The source was already attached to a sink.
    #[error("source is already attached")]
    AlreadyAttached,

    /// The watched path does not exist.
    #[error("path does not exist: {0}")]
    PathNotFound(PathBuf),

    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that delivers host notifications to an [`EventSink`].
pub trait SubscriptionSource {
    /// Starts forwarding notifications into `sink`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError` if the source cannot start or was already
    /// attached.
    fn attach(&mut self, sink: EventSink) -> Result<(), SourceError>;
}

/// Handle used by sources to notify the tracker.
#[derive(Debug, Clone)]
pub struct EventSink {
    commands: mpsc::Sender<Command>,
}

impl EventSink {
    pub(crate) fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    /// Sends an event, waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the tracker has shut down.
    pub async fn send(&self, event: HostEvent) -> Result<(), SourceError> {
        self.commands
            .send(Command::Host(event))
            .await
            .map_err(|_| SourceError::Closed)
    }

    /// Sends an event without waiting. Usable from synchronous callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Full`] or [`SourceError::Closed`].
    pub fn try_send(&self, event: HostEvent) -> Result<(), SourceError> {
        self.commands
            .try_send(Command::Host(event))
            .map_err(|e| match e {
                TrySendError::Full(_) => SourceError::Full,
                TrySendError::Closed(_) => SourceError::Closed,
            })
    }

    /// Reports an edit. Pass `line_count: None` when the document's line
    /// count could not be read; `changes` are then used instead.
    pub async fn on_edit(
        &self,
        file: impl Into<PathBuf>,
        line_count: Option<usize>,
        changes: Vec<ContentChange>,
        language: Option<String>,
    ) -> Result<(), SourceError> {
        self.send(HostEvent::Edit {
            file: file.into(),
            line_count,
            changes,
            language,
        })
        .await
    }

    pub async fn on_open(
        &self,
        file: impl Into<PathBuf>,
        line_count: Option<usize>,
        language: Option<String>,
    ) -> Result<(), SourceError> {
        self.send(HostEvent::Open {
            file: file.into(),
            line_count,
            language,
        })
        .await
    }

    pub async fn on_save(
        &self,
        file: impl Into<PathBuf>,
        line_count: Option<usize>,
        language: Option<String>,
    ) -> Result<(), SourceError> {
        self.send(HostEvent::Save {
            file: file.into(),
            line_count,
            language,
        })
        .await
    }

    /// Reports a change of active editor; `None` when focus left all editors.
    pub async fn on_focus_change(
        &self,
        file: Option<PathBuf>,
        line_count: Option<usize>,
        language: Option<String>,
    ) -> Result<(), SourceError> {
        self.send(HostEvent::FocusChange {
            file,
            line_count,
            language,
        })
        .await
    }

    pub async fn on_close(&self, file: impl Into<PathBuf>) -> Result<(), SourceError> {
        self.send(HostEvent::Close { file: file.into() }).await
    }
}

/// Reads newline-delimited [`HostEvent`] JSON from an async reader.
///
/// Blank lines are skipped; malformed lines are logged and skipped. The feed
/// ends at end of input or when the tracker shuts down.
///
/// ```no_run
/// use codetrackr::source::{JsonLinesFeed, SubscriptionSource};
/// # async fn demo(sink: codetrackr::source::EventSink) -> Result<(), Box<dyn std::error::Error>> {
/// let mut feed = JsonLinesFeed::new(tokio::io::stdin());
/// feed.attach(sink)?;
/// let forwarded = feed.finished().await;
/// println!("forwarded {forwarded} events");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct JsonLinesFeed<R> {
    reader: Option<R>,
    task: Option<JoinHandle<usize>>,
}

impl<R> JsonLinesFeed<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            task: None,
        }
    }

    /// Waits for the feed to end and returns how many events were forwarded.
    ///
    /// Returns 0 if the feed was never attached.
    pub async fn finished(&mut self) -> usize {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Host event feed task failed");
                0
            }),
            None => 0,
        }
    }
}

impl<R> SubscriptionSource for JsonLinesFeed<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn attach(&mut self, sink: EventSink) -> Result<(), SourceError> {
        let reader = self.reader.take().ok_or(SourceError::AlreadyAttached)?;
        self.task = Some(tokio::spawn(forward_lines(reader, sink)));
        Ok(())
    }
}

async fn forward_lines<R>(reader: R, sink: EventSink) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut forwarded = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read host event stream");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: HostEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed host event");
                continue;
            }
        };

        if sink.send(event).await.is_err() {
            debug!("Tracker closed, stopping host event feed");
            break;
        }
        forwarded += 1;
    }

    info!(forwarded, "Host event feed ended");
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Command;

    fn sink() -> (EventSink, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(16);
        (EventSink::new(tx), rx)
    }

    fn host_event(command: Command) -> HostEvent {
        match command {
            Command::Host(event) => event,
            _ => panic!("expected a host event"),
        }
    }

    #[tokio::test]
    async fn feed_forwards_valid_lines_and_skips_garbage() {
        let input = concat!(
            r#"{"kind":"open","file":"/w/a.rs","lineCount":10}"#,
            "\n\n",
            "not json\n",
            r#"{"kind":"edit","file":"/w/a.rs","lineCount":12}"#,
            "\n",
            r#"{"kind":"close","file":"/w/a.rs"}"#,
            "\n",
        );
        let (sink, mut rx) = sink();

        let mut feed = JsonLinesFeed::new(input.as_bytes());
        feed.attach(sink).unwrap();
        assert_eq!(feed.finished().await, 3);

        let first = host_event(rx.recv().await.unwrap());
        assert_eq!(
            first,
            HostEvent::Open {
                file: PathBuf::from("/w/a.rs"),
                line_count: Some(10),
                language: None
            }
        );
        assert!(matches!(
            host_event(rx.recv().await.unwrap()),
            HostEvent::Edit {
                line_count: Some(12),
                ..
            }
        ));
        assert!(matches!(
            host_event(rx.recv().await.unwrap()),
            HostEvent::Close { .. }
        ));
    }

    #[tokio::test]
    async fn feed_cannot_attach_twice() {
        let (sink, _rx) = sink();
        let mut feed = JsonLinesFeed::new(&b""[..]);
        feed.attach(sink.clone()).unwrap();
        assert!(matches!(
            feed.attach(sink),
            Err(SourceError::AlreadyAttached)
        ));
    }

    #[tokio::test]
    async fn sink_reports_closed_tracker() {
        let (sink, rx) = sink();
        drop(rx);
        assert!(matches!(
            sink.on_close("/w/a.rs").await,
            Err(SourceError::Closed)
        ));
        assert!(matches!(
            sink.try_send(HostEvent::Close {
                file: PathBuf::from("/w/a.rs")
            }),
            Err(SourceError::Closed)
        ));
    }

    #[tokio::test]
    async fn try_send_reports_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        sink.try_send(HostEvent::Close {
            file: PathBuf::from("a"),
        })
        .unwrap();
        assert!(matches!(
            sink.try_send(HostEvent::Close {
                file: PathBuf::from("b"),
            }),
            Err(SourceError::Full)
        ));
    }
}
