//! The tracker task: periodic flushing and event handling.
//!
//! A single [`Tracker`] task owns the [`Session`], the [`LineDeltaTracker`]
//! and the periodic flush timer, so every state change is serialized without
//! locks. Everything else talks to it through a cloneable [`TrackerHandle`]:
//!
//! ```text
//!  sources ──EventSink──┐
//!                       ├──▶ commands ──▶ Tracker ──spawn──▶ Deliver
//!  CLI ──TrackerHandle──┘                   ▲                   │
//!                                           └──── reports ◀─────┘
//! ```
//!
//! Deliveries run as spawned tasks and report back over a second channel, so
//! edits keep updating the session while a request is in flight.
//!
//! # Example
//!
//! ```no_run
//! use codetrackr::delivery::{DeliveryClient, DeliveryConfig};
//! use codetrackr::scheduler::{Tracker, TrackerSettings};
//! use codetrackr::utils::SystemClock;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DeliveryClient::new(DeliveryConfig::new("https://codetrackr.example.com", None, None))?;
//!     let (tracker, handle, mut notices) =
//!         Tracker::new(TrackerSettings::default(), client, SystemClock::new());
//!     let task = tokio::spawn(tracker.run());
//!
//!     handle.start().await?;
//!     handle.sink().on_open("/work/app/src/main.rs", Some(120), None).await?;
//!
//!     while let Some(notice) = notices.recv().await {
//!         eprintln!("{notice}");
//!     }
//!     task.await?;
//!     Ok(())
//! }
//! ```

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::delivery::{Deliver, DeliveryError, Receipt};
use crate::line_tracker::{LineDeltaTracker, DEFAULT_LINE_CACHE_SIZE};
use crate::session::{
    Activity, ActivityOutcome, DeliveryDisposition, FlushInterval, Session, SessionConfig,
    SessionSnapshot, TickAction,
};
use crate::source::EventSink;
use crate::types::{HostEvent, Notice};
use crate::utils::Clock;

/// Default period of the flush timer.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the command queue shared by handles and sources.
const COMMAND_QUEUE_SIZE: usize = 1024;

/// Capacity of the delivery report queue.
const REPORT_QUEUE_SIZE: usize = 64;

/// Capacity of the notice queue. Notices are dropped when it is full.
const NOTICE_QUEUE_SIZE: usize = 64;

/// Tuning knobs for the tracker task.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    /// Period of the flush timer.
    pub flush_interval: Duration,

    /// Idle threshold and minimum flush size.
    pub session: SessionConfig,

    /// Number of files whose line counts are remembered.
    pub line_cache_size: NonZeroUsize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            session: SessionConfig::default(),
            line_cache_size: NonZeroUsize::new(DEFAULT_LINE_CACHE_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// Errors returned by [`TrackerHandle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The tracker task has exited.
    #[error("tracker is no longer running")]
    Closed,
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Outcome of a forced flush, reported once the delivery has completed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub interval: FlushInterval,
    pub result: Result<Receipt, DeliveryError>,
    pub disposition: DeliveryDisposition,
}

pub(crate) enum Command {
    Start(oneshot::Sender<StartOutcome>),
    Stop(oneshot::Sender<bool>),
    FlushNow(oneshot::Sender<Option<FlushReport>>),
    Host(HostEvent),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

struct DeliveryReport {
    interval: FlushInterval,
    result: Result<Receipt, DeliveryError>,
    reply: Option<oneshot::Sender<Option<FlushReport>>>,
}

/// Cloneable handle to a running [`Tracker`].
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    commands: mpsc::Sender<Command>,
}

impl TrackerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TrackerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| TrackerError::Closed)?;
        rx.await.map_err(|_| TrackerError::Closed)
    }

    /// Starts tracking. Starting a running tracker is a no-op.
    pub async fn start(&self) -> Result<StartOutcome, TrackerError> {
        self.request(Command::Start).await
    }

    /// Stops tracking and cancels the flush timer. Returns `false` if the
    /// tracker was already stopped.
    pub async fn stop(&self) -> Result<bool, TrackerError> {
        self.request(Command::Stop).await
    }

    /// Forces a flush of the current session and waits for its delivery.
    ///
    /// Returns `None` when there is nothing to flush (stopped or paused).
    pub async fn flush_now(&self) -> Result<Option<FlushReport>, TrackerError> {
        self.request(Command::FlushNow).await
    }

    /// Returns a read-only view of the session.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, TrackerError> {
        self.request(Command::Snapshot).await
    }

    /// Stops tracking, waits for in-flight deliveries and ends the task.
    pub async fn shutdown(&self) -> Result<(), TrackerError> {
        self.request(Command::Shutdown).await
    }

    /// Returns a sink for event sources.
    #[must_use]
    pub fn sink(&self) -> EventSink {
        EventSink::new(self.commands.clone())
    }
}

/// The tracker task.
pub struct Tracker<D, C> {
    settings: TrackerSettings,
    session: Session,
    lines: LineDeltaTracker,
    ticker: Option<Interval>,
    delivery: Arc<D>,
    clock: C,
    commands: mpsc::Receiver<Command>,
    reports_tx: mpsc::Sender<DeliveryReport>,
    reports_rx: mpsc::Receiver<DeliveryReport>,
    notices: mpsc::Sender<Notice>,
    in_flight: usize,
}

impl<D, C> Tracker<D, C>
where
    D: Deliver,
    C: Clock,
{
    /// Creates the task together with its handle and notice stream.
    ///
    /// Nothing runs until [`Tracker::run`] is polled, typically via
    /// `tokio::spawn(tracker.run())`.
    #[must_use]
    pub fn new(
        settings: TrackerSettings,
        delivery: D,
        clock: C,
    ) -> (Self, TrackerHandle, mpsc::Receiver<Notice>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_QUEUE_SIZE);
        let (notices, notices_rx) = mpsc::channel(NOTICE_QUEUE_SIZE);

        let tracker = Self {
            session: Session::new(settings.session, clock.now()),
            lines: LineDeltaTracker::new(settings.line_cache_size),
            settings,
            ticker: None,
            delivery: Arc::new(delivery),
            clock,
            commands,
            reports_tx,
            reports_rx,
            notices,
            in_flight: 0,
        };

        (
            tracker,
            TrackerHandle {
                commands: commands_tx,
            },
            notices_rx,
        )
    }

    /// Runs until [`TrackerHandle::shutdown`] is called or every handle and
    /// sink has been dropped.
    pub async fn run(mut self) {
        debug!("Tracker task started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(report) = self.reports_rx.recv() => self.handle_report(report),
                () = next_tick(&mut self.ticker) => self.handle_tick(),
            }
        }

        debug!("Tracker task finished");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.stop());
            }
            Command::FlushNow(reply) => {
                let now = self.clock.now();
                match self.session.flush_if_needed(now, true) {
                    Some(interval) => self.dispatch(interval, Some(reply)),
                    None => {
                        let _ = reply.send(None);
                    }
                }
            }
            Command::Host(event) => self.handle_host_event(event),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self) -> StartOutcome {
        if !self.session.start(self.clock.now()) {
            self.notify(Notice::AlreadyRunning);
            return StartOutcome::AlreadyRunning;
        }

        let period = self.settings.flush_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);

        info!(
            flush_interval_secs = period.as_secs_f64(),
            "Tracking started"
        );
        self.notify(Notice::Started);
        StartOutcome::Started
    }

    fn stop(&mut self) -> bool {
        self.ticker = None;
        let was_running = self.session.stop();
        if was_running {
            info!("Tracking stopped");
            self.notify(Notice::Stopped);
        }
        was_running
    }

    fn handle_host_event(&mut self, event: HostEvent) {
        trace!(event = ?event, "Host event");

        match event {
            HostEvent::Edit {
                file,
                line_count,
                changes,
                language,
            } => {
                let delta = self.lines.observe_edit(&file, line_count, &changes);
                self.session.add_lines(delta);
                self.record(Activity {
                    file: Some(file),
                    language,
                });
            }
            HostEvent::Open {
                file,
                line_count,
                language,
            }
            | HostEvent::Save {
                file,
                line_count,
                language,
            }
            | HostEvent::FocusChange {
                file: Some(file),
                line_count,
                language,
            } => {
                if let Some(count) = line_count {
                    self.lines.baseline(&file, count);
                }
                self.record(Activity {
                    file: Some(file),
                    language,
                });
            }
            HostEvent::FocusChange { file: None, .. } => {}
            HostEvent::Close { file } => self.lines.forget(&file),
        }
    }

    fn record(&mut self, activity: Activity) {
        let now = self.clock.now();
        if self.session.record_activity(now, activity) == ActivityOutcome::Resumed {
            self.notify(Notice::Resumed);
        }
    }

    fn handle_tick(&mut self) {
        let now = self.clock.now();
        match self.session.tick(now) {
            TickAction::IdlePaused(interval) => {
                self.notify(Notice::Paused);
                if let Some(interval) = interval {
                    self.dispatch(interval, None);
                }
            }
            TickAction::Flush(interval) => self.dispatch(interval, None),
            TickAction::Inactive | TickAction::Paused | TickAction::Wait => {}
        }
    }

    fn dispatch(
        &mut self,
        interval: FlushInterval,
        reply: Option<oneshot::Sender<Option<FlushReport>>>,
    ) {
        debug!(
            interval_id = %interval.id,
            kind = ?interval.kind,
            minutes = interval.minutes,
            "Dispatching interval"
        );

        self.in_flight += 1;
        let delivery = Arc::clone(&self.delivery);
        let reports = self.reports_tx.clone();

        tokio::spawn(async move {
            let result = delivery.deliver(&interval).await;
            let report = DeliveryReport {
                interval,
                result,
                reply,
            };
            if reports.send(report).await.is_err() {
                debug!("Tracker gone before delivery report");
            }
        });
    }

    fn handle_report(&mut self, report: DeliveryReport) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let DeliveryReport {
            interval,
            result,
            reply,
        } = report;

        let disposition = match &result {
            Ok(_) => {
                self.notify(Notice::Tracked {
                    duration_secs: interval.duration_seconds(),
                });
                self.session.delivery_succeeded(&interval)
            }
            Err(error) => {
                self.notify(Notice::DeliveryFailed {
                    error: error.clone(),
                });
                self.session
                    .delivery_failed(self.clock.now(), &interval, error)
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(Some(FlushReport {
                interval,
                result,
                disposition,
            }));
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.session.snapshot(self.clock.now());
        snapshot.timer_running = self.ticker.is_some();
        snapshot.in_flight = self.in_flight;
        snapshot
    }

    async fn shutdown(&mut self) {
        self.stop();

        while self.in_flight > 0 {
            match self.reports_rx.recv().await {
                Some(report) => self.handle_report(report),
                None => break,
            }
        }
        info!("Tracker shut down");
    }

    fn notify(&self, notice: Notice) {
        if let Err(e) = self.notices.try_send(notice) {
            trace!(error = %e, "Notice dropped");
        }
    }
}

/// Waits for the next timer tick, or forever if the timer is not running.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Spawns a tracker on the current runtime.
pub fn spawn<D, C>(
    settings: TrackerSettings,
    delivery: D,
    clock: C,
) -> (TrackerHandle, mpsc::Receiver<Notice>, tokio::task::JoinHandle<()>)
where
    D: Deliver,
    C: Clock,
{
    let (tracker, handle, notices) = Tracker::new(settings, delivery, clock);
    let task = tokio::spawn(tracker.run());
    (handle, notices, task)
}
