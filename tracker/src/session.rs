//! Session aggregation and flush state machine.
//!
//! A [`Session`] turns an irregular stream of activity notifications into
//! bounded, idle-aware usage intervals. It is a plain state machine: every
//! operation takes the current time explicitly and never performs I/O, so the
//! owning task (see [`crate::scheduler`]) decides when to tick and where to
//! send the resulting [`FlushInterval`]s.
//!
//! # States
//!
//! ```text
//!            start()                 tick() while idle
//! Stopped ───────────▶ Active ────────────────────────▶ Paused
//!    ▲                  │  ▲                               │
//!    │      stop()      │  └──────── activity ─────────────┘
//!    └──────────────────┘
//! ```
//!
//! While `Active` the clock runs from `started_at`; `buffered_minutes` holds
//! minutes carried over from deliveries that failed. While `Paused` no clock
//! runs and the buffer is always zero, so time spent idle is never billed.
//!
//! # Delivery contract
//!
//! Cutting an interval moves the line counters into it and restarts the clock
//! at zero buffer. If the delivery later fails with a retryable error, the
//! interval's minutes are folded back into the buffer; line counts are not.

use std::mem;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delivery::DeliveryError;
use crate::line_tracker::LineDelta;

/// Default idle threshold after which tracking pauses.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(2 * 60);

/// Default minimum number of buffered minutes before a scheduled flush.
pub const DEFAULT_MIN_FLUSH_MINUTES: f64 = 0.1;

const MILLIS_PER_MINUTE: f64 = 60_000.0;

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / MILLIS_PER_MINUTE
}

/// Lifecycle state of a tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Active,
    Paused,
}

/// Tunables injected into a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Inactivity after which the next tick pauses tracking.
    pub idle_threshold: Duration,

    /// Minimum buffered minutes before a scheduled flush is cut.
    pub min_flush_minutes: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            min_flush_minutes: DEFAULT_MIN_FLUSH_MINUTES,
        }
    }
}

/// Why an interval was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushKind {
    /// Periodic tick with enough buffered time.
    Scheduled,
    /// Explicit flush request.
    Forced,
    /// Active time flushed while pausing for idleness.
    IdlePause,
}

/// An aggregated usage interval ready for delivery.
///
/// Immutable once cut; the delivery task owns it for the duration of one
/// attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushInterval {
    /// Correlates the log lines of one delivery.
    pub id: Uuid,

    /// Session epoch the interval was cut from.
    pub epoch: u64,

    pub kind: FlushKind,

    /// Billed duration in minutes.
    pub minutes: f64,

    /// Best-known current file when the interval was cut.
    pub file: Option<PathBuf>,

    /// Language reported by the host for the last activity.
    pub language: Option<String>,

    pub lines_added: u64,
    pub lines_removed: u64,

    /// When the interval was cut.
    pub timestamp: DateTime<Utc>,
}

impl FlushInterval {
    /// Billed duration rounded to whole seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> u64 {
        (self.minutes * 60.0).round().max(0.0) as u64
    }
}

/// One observed activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activity {
    pub file: Option<PathBuf>,
    pub language: Option<String>,
}

impl Activity {
    /// Activity in a specific file.
    #[must_use]
    pub fn in_file(file: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(file.into()),
            language: None,
        }
    }

    /// Attaches the host-reported language id.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Result of recording an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// The session is stopped; nothing was recorded.
    Ignored,
    /// Activity recorded on a running session.
    Recorded,
    /// The session was paused and is now running again.
    Resumed,
}

/// What a periodic tick decided.
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    /// The session is stopped.
    Inactive,
    /// Already paused; nothing to do until the next activity.
    Paused,
    /// The idle threshold was crossed and tracking paused. Carries the
    /// pre-idle active time if it was worth flushing.
    IdlePaused(Option<FlushInterval>),
    /// Enough time is buffered; deliver this interval.
    Flush(FlushInterval),
    /// Not enough time buffered yet.
    Wait,
}

/// How a delivery report was applied to the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryDisposition {
    Delivered,
    /// Minutes were folded back into the buffer; the new buffer is carried.
    Rebuffered { buffered_minutes: f64 },
    /// The collector rejected the payload; it will not be retried.
    Discarded,
    /// The session stopped, paused or restarted since the interval was cut.
    Stale,
}

/// Read-only view of the session for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub epoch: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub buffered_minutes: f64,
    pub total_buffered_minutes: f64,
    pub last_activity_at: DateTime<Utc>,
    pub last_known_file: Option<PathBuf>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub timer_running: bool,
    pub in_flight: usize,
}

/// The tracking session.
#[derive(Debug, Clone)]
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    epoch: u64,
    started_at: Option<DateTime<Utc>>,
    buffered_minutes: f64,
    last_activity_at: DateTime<Utc>,
    last_known_file: Option<PathBuf>,
    last_language: Option<String>,
    lines_added: u64,
    lines_removed: u64,
}

impl Session {
    /// Creates a stopped session.
    #[must_use]
    pub fn new(config: SessionConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            state: SessionState::Stopped,
            epoch: 0,
            started_at: None,
            buffered_minutes: 0.0,
            last_activity_at: now,
            last_known_file: None,
            last_language: None,
            lines_added: 0,
            lines_removed: 0,
        }
    }

    /// Starts tracking.
    ///
    /// Returns `false` without touching any state if the session is already
    /// running (active or paused).
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != SessionState::Stopped {
            debug!(state = ?self.state, "Start requested while already running");
            return false;
        }

        self.epoch += 1;
        self.state = SessionState::Active;
        self.started_at = Some(now);
        self.buffered_minutes = 0.0;
        self.last_activity_at = now;
        self.lines_added = 0;
        self.lines_removed = 0;

        info!(epoch = self.epoch, "Session started");
        true
    }

    /// Stops tracking and clears all session fields.
    ///
    /// Returns `false` if the session was already stopped. Safe to call
    /// repeatedly.
    pub fn stop(&mut self) -> bool {
        let was_running = self.state != SessionState::Stopped;

        self.state = SessionState::Stopped;
        self.started_at = None;
        self.buffered_minutes = 0.0;
        self.last_known_file = None;
        self.last_language = None;
        self.lines_added = 0;
        self.lines_removed = 0;

        if was_running {
            info!(epoch = self.epoch, "Session stopped");
        }
        was_running
    }

    /// Records an edit, open, save or focus notification.
    ///
    /// A paused session resumes with a fresh clock and an empty buffer.
    pub fn record_activity(&mut self, now: DateTime<Utc>, activity: Activity) -> ActivityOutcome {
        if self.state == SessionState::Stopped {
            return ActivityOutcome::Ignored;
        }

        self.last_activity_at = now;

        let outcome = if self.state == SessionState::Paused {
            self.state = SessionState::Active;
            self.started_at = Some(now);
            self.buffered_minutes = 0.0;
            info!("Activity resumed after idle period");
            ActivityOutcome::Resumed
        } else {
            ActivityOutcome::Recorded
        };

        match activity.file {
            Some(file) => {
                self.last_known_file = Some(file);
                self.last_language = activity.language;
            }
            None => {
                if activity.language.is_some() {
                    self.last_language = activity.language;
                }
            }
        }

        outcome
    }

    /// Adds a line delta to the running counters. Ignored while stopped.
    pub fn add_lines(&mut self, delta: LineDelta) {
        if self.state == SessionState::Stopped {
            return;
        }
        let (added, removed) = delta.split();
        self.lines_added = self.lines_added.saturating_add(added);
        self.lines_removed = self.lines_removed.saturating_add(removed);
    }

    /// Buffered minutes plus the minutes elapsed on the running clock.
    ///
    /// Zero unless the session is active.
    #[must_use]
    pub fn total_buffered_minutes(&self, now: DateTime<Utc>) -> f64 {
        match (self.state, self.started_at) {
            (SessionState::Active, Some(started_at)) => {
                self.buffered_minutes + minutes_between(started_at, now).max(0.0)
            }
            _ => 0.0,
        }
    }

    /// Minutes since the last observed activity.
    #[must_use]
    pub fn idle_minutes(&self, now: DateTime<Utc>) -> f64 {
        minutes_between(self.last_activity_at, now).max(0.0)
    }

    /// Returns true if the idle threshold has been reached.
    #[must_use]
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_activity_at)
            .to_std()
            .map(|idle| idle >= self.config.idle_threshold)
            .unwrap_or(false)
    }

    /// Runs the periodic tick: pause if idle, otherwise a scheduled flush.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickAction {
        match self.state {
            SessionState::Stopped => TickAction::Inactive,
            SessionState::Paused => TickAction::Paused,
            SessionState::Active if self.is_idle(now) => {
                TickAction::IdlePaused(self.pause_for_idle(now))
            }
            SessionState::Active => match self.flush_if_needed(now, false) {
                Some(interval) => TickAction::Flush(interval),
                None => TickAction::Wait,
            },
        }
    }

    /// Cuts an interval if one is due.
    ///
    /// Without `force`, nothing is cut while the user is idle (the pause
    /// transition owns that time) or while less than the minimum flush
    /// duration is buffered. A forced flush cuts whatever is buffered. Only
    /// an active session has a running clock, so stopped and paused sessions
    /// never produce an interval.
    pub fn flush_if_needed(&mut self, now: DateTime<Utc>, force: bool) -> Option<FlushInterval> {
        if self.state != SessionState::Active {
            return None;
        }

        if !force && self.is_idle(now) {
            debug!(
                idle_minutes = self.idle_minutes(now),
                "Skipping flush, user idle"
            );
            return None;
        }

        let total = self.total_buffered_minutes(now);
        if !force && total < self.config.min_flush_minutes {
            return None;
        }

        let kind = if force {
            FlushKind::Forced
        } else {
            FlushKind::Scheduled
        };
        let interval = self.cut_interval(now, total, kind);

        self.started_at = Some(now);
        self.buffered_minutes = 0.0;

        Some(interval)
    }

    /// Applies a successful delivery.
    pub fn delivery_succeeded(&mut self, interval: &FlushInterval) -> DeliveryDisposition {
        debug!(
            interval_id = %interval.id,
            duration_secs = interval.duration_seconds(),
            "Interval delivered"
        );
        DeliveryDisposition::Delivered
    }

    /// Applies a failed delivery.
    ///
    /// Retryable failures fold the interval's minutes back into the buffer
    /// and restart the clock, so the duration is delayed rather than lost.
    /// Reports for a session that has since stopped, paused or restarted are
    /// dropped so they cannot resurrect it.
    pub fn delivery_failed(
        &mut self,
        now: DateTime<Utc>,
        interval: &FlushInterval,
        error: &DeliveryError,
    ) -> DeliveryDisposition {
        if !error.is_retryable() {
            warn!(
                interval_id = %interval.id,
                error = %error,
                "Interval rejected, not retrying"
            );
            return DeliveryDisposition::Discarded;
        }

        if interval.epoch != self.epoch || self.state != SessionState::Active {
            warn!(
                interval_id = %interval.id,
                minutes = interval.minutes,
                state = ?self.state,
                "Dropping failed interval from an inactive session"
            );
            return DeliveryDisposition::Stale;
        }

        let buffered_minutes = self.total_buffered_minutes(now) + interval.minutes;
        self.buffered_minutes = buffered_minutes;
        self.started_at = Some(now);

        info!(
            interval_id = %interval.id,
            buffered_minutes,
            "Delivery failed, duration re-buffered"
        );
        DeliveryDisposition::Rebuffered { buffered_minutes }
    }

    /// Builds a snapshot of the session.
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            epoch: self.epoch,
            started_at: self.started_at,
            buffered_minutes: self.buffered_minutes,
            total_buffered_minutes: self.total_buffered_minutes(now),
            last_activity_at: self.last_activity_at,
            last_known_file: self.last_known_file.clone(),
            lines_added: self.lines_added,
            lines_removed: self.lines_removed,
            timer_running: false,
            in_flight: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state == SessionState::Paused
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn buffered_minutes(&self) -> f64 {
        self.buffered_minutes
    }

    #[must_use]
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    #[must_use]
    pub fn last_known_file(&self) -> Option<&Path> {
        self.last_known_file.as_deref()
    }

    #[must_use]
    pub fn lines_added(&self) -> u64 {
        self.lines_added
    }

    #[must_use]
    pub fn lines_removed(&self) -> u64 {
        self.lines_removed
    }

    /// Pauses for idleness, cutting the pre-idle active time if it exceeds
    /// the minimum flush duration.
    ///
    /// Only time between `started_at` and the last activity counts; the idle
    /// tail before detection is never billed.
    fn pause_for_idle(&mut self, now: DateTime<Utc>) -> Option<FlushInterval> {
        let active_minutes = self
            .started_at
            .take()
            .map(|started_at| minutes_between(started_at, self.last_activity_at).max(0.0))
            .unwrap_or(0.0);
        let unbilled = self.buffered_minutes + active_minutes;

        info!(
            idle_minutes = self.idle_minutes(now),
            active_minutes = unbilled,
            "Idle threshold reached, pausing tracking"
        );

        let flushed = if unbilled > self.config.min_flush_minutes {
            Some(self.cut_interval(now, unbilled, FlushKind::IdlePause))
        } else {
            None
        };

        self.buffered_minutes = 0.0;
        self.state = SessionState::Paused;

        flushed
    }

    fn cut_interval(&mut self, now: DateTime<Utc>, minutes: f64, kind: FlushKind) -> FlushInterval {
        let interval = FlushInterval {
            id: Uuid::new_v4(),
            epoch: self.epoch,
            kind,
            minutes,
            file: self.last_known_file.clone(),
            language: self.last_language.clone(),
            lines_added: mem::take(&mut self.lines_added),
            lines_removed: mem::take(&mut self.lines_removed),
            timestamp: now,
        };

        debug!(
            interval_id = %interval.id,
            kind = ?kind,
            minutes,
            lines_added = interval.lines_added,
            lines_removed = interval.lines_removed,
            "Cut flush interval"
        );
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EPSILON: f64 = 1e-9;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn session() -> Session {
        Session::new(SessionConfig::default(), at(0))
    }

    fn started() -> Session {
        let mut s = session();
        assert!(s.start(at(0)));
        s
    }

    fn unreachable() -> DeliveryError {
        DeliveryError::Unreachable {
            message: "connection refused".to_string(),
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < EPSILON,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_paused_invariant(s: &Session) {
        if s.is_paused() {
            assert!(s.started_at().is_none());
            assert_eq!(s.buffered_minutes(), 0.0);
        }
    }

    #[test]
    fn new_session_is_stopped() {
        let s = session();
        assert_eq!(s.state(), SessionState::Stopped);
        assert_eq!(s.total_buffered_minutes(at(600)), 0.0);
    }

    #[test]
    fn start_begins_clock() {
        let s = started();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.started_at(), Some(at(0)));
        assert_eq!(s.epoch(), 1);
        assert_close(s.total_buffered_minutes(at(30)), 0.5);
    }

    #[test]
    fn second_start_keeps_accrued_buffer() {
        let mut s = started();
        s.record_activity(at(30), Activity::in_file("/w/a.rs"));

        assert!(!s.start(at(40)));
        assert_eq!(s.started_at(), Some(at(0)));
        assert_eq!(s.epoch(), 1);
        assert_close(s.total_buffered_minutes(at(60)), 1.0);
    }

    #[test]
    fn total_strictly_increases_while_active() {
        let mut s = started();
        let mut previous = s.total_buffered_minutes(at(0));

        for step in 1..=20 {
            let now = at(step * 15);
            s.record_activity(now, Activity::in_file("/w/a.rs"));
            let total = s.total_buffered_minutes(now);
            assert!(total > previous, "step {step}: {total} <= {previous}");
            previous = total;
        }
    }

    #[test]
    fn scheduled_flush_waits_for_minimum() {
        let mut s = started();
        s.record_activity(at(3), Activity::in_file("/w/a.rs"));

        // 0.05 minutes buffered, minimum is 0.1
        assert_eq!(s.tick(at(3)), TickAction::Wait);

        s.record_activity(at(30), Activity::in_file("/w/a.rs"));
        match s.tick(at(30)) {
            TickAction::Flush(interval) => {
                assert_eq!(interval.kind, FlushKind::Scheduled);
                assert_close(interval.minutes, 0.5);
                assert_eq!(interval.duration_seconds(), 30);
                assert_eq!(interval.file, Some(PathBuf::from("/w/a.rs")));
            }
            other => panic!("expected flush, got {other:?}"),
        }

        assert_eq!(s.started_at(), Some(at(30)));
        assert_eq!(s.buffered_minutes(), 0.0);
        assert_eq!(s.total_buffered_minutes(at(30)), 0.0);
    }

    #[test]
    fn idle_gap_pauses_with_pre_idle_duration_only() {
        let mut s = started();
        s.add_lines(LineDelta::new(4));
        s.record_activity(at(60), Activity::in_file("/w/a.rs"));

        // 121 seconds of silence with a 120 second threshold.
        let action = s.tick(at(181));
        let interval = match action {
            TickAction::IdlePaused(Some(interval)) => interval,
            other => panic!("expected idle pause with flush, got {other:?}"),
        };

        assert_eq!(interval.kind, FlushKind::IdlePause);
        assert_close(interval.minutes, 1.0);
        assert_eq!(interval.duration_seconds(), 60);
        assert_eq!(interval.lines_added, 4);

        assert_eq!(s.state(), SessionState::Paused);
        assert_paused_invariant(&s);
        assert_eq!(s.lines_added(), 0);
    }

    #[test]
    fn idle_pause_below_minimum_keeps_lines() {
        let mut s = started();
        s.add_lines(LineDelta::new(2));
        s.record_activity(at(3), Activity::in_file("/w/a.rs"));

        assert_eq!(s.tick(at(200)), TickAction::IdlePaused(None));
        assert_paused_invariant(&s);
        assert_eq!(s.lines_added(), 2);
    }

    #[test]
    fn idle_pause_right_after_flush_bills_nothing() {
        let mut s = started();
        s.record_activity(at(25), Activity::in_file("/w/a.rs"));
        assert!(matches!(s.tick(at(30)), TickAction::Flush(_)));

        // Last activity predates the restarted clock.
        assert_eq!(s.tick(at(150)), TickAction::IdlePaused(None));
    }

    #[test]
    fn paused_tick_is_noop() {
        let mut s = started();
        assert!(matches!(s.tick(at(130)), TickAction::IdlePaused(_)));
        assert_eq!(s.tick(at(160)), TickAction::Paused);
        assert_eq!(s.tick(at(190)), TickAction::Paused);
        assert_paused_invariant(&s);
    }

    #[test]
    fn scheduled_flush_is_skipped_while_idle() {
        let mut s = started();
        s.record_activity(at(10), Activity::in_file("/w/a.rs"));

        assert!(s.flush_if_needed(at(200), false).is_none());
        assert_eq!(s.state(), SessionState::Active);

        let forced = s.flush_if_needed(at(200), true).expect("forced flush");
        assert_eq!(forced.kind, FlushKind::Forced);
        assert_eq!(forced.duration_seconds(), 200);
    }

    #[test]
    fn forced_flush_reports_short_activity() {
        let mut s = started();
        s.add_lines(LineDelta::new(5));
        s.add_lines(LineDelta::new(-2));
        s.record_activity(at(10), Activity::in_file("/w/main.py").with_language("python"));

        let interval = s.flush_if_needed(at(10), true).expect("forced flush");
        assert_eq!(interval.duration_seconds(), 10);
        assert_eq!(interval.lines_added, 5);
        assert_eq!(interval.lines_removed, 2);
        assert_eq!(interval.language.as_deref(), Some("python"));

        assert_eq!(s.lines_added(), 0);
        assert_eq!(s.lines_removed(), 0);
    }

    #[test]
    fn forced_flush_on_paused_or_stopped_session_is_noop() {
        let mut s = session();
        assert!(s.flush_if_needed(at(10), true).is_none());

        s.start(at(0));
        s.tick(at(130));
        assert!(s.is_paused());
        assert!(s.flush_if_needed(at(140), true).is_none());
    }

    #[test]
    fn failed_delivery_rebuffers_duration() {
        let mut s = started();
        s.add_lines(LineDelta::new(3));
        s.record_activity(at(60), Activity::in_file("/w/a.rs"));
        let interval = s.flush_if_needed(at(60), false).expect("interval");
        assert_close(interval.minutes, 1.0);

        s.record_activity(at(80), Activity::in_file("/w/a.rs"));
        s.add_lines(LineDelta::new(1));

        // Unbilled time at the failure moment: the in-flight minute plus the
        // 30 seconds accrued since the cut.
        let expected = s.total_buffered_minutes(at(90)) + interval.minutes;
        let disposition = s.delivery_failed(at(90), &interval, &unreachable());

        assert_eq!(
            disposition,
            DeliveryDisposition::Rebuffered {
                buffered_minutes: expected
            }
        );
        assert_close(s.buffered_minutes(), 1.5);
        assert_eq!(s.started_at(), Some(at(90)));
        assert_close(s.total_buffered_minutes(at(90)), 1.5);

        // Lines were moved into the failed interval and are not restored;
        // the edit made while it was in flight is kept.
        assert_eq!(s.lines_added(), 1);
    }

    #[test]
    fn rejected_payload_is_not_rebuffered() {
        let mut s = started();
        let interval = s.flush_if_needed(at(60), true).expect("interval");

        let error = DeliveryError::BadRequest {
            message: "duration must be positive".to_string(),
        };
        assert_eq!(
            s.delivery_failed(at(65), &interval, &error),
            DeliveryDisposition::Discarded
        );
        assert_eq!(s.buffered_minutes(), 0.0);
    }

    #[test]
    fn credential_failures_are_not_rebuffered() {
        let mut s = started();

        s.record_activity(at(20), Activity::in_file("/w/a.rs"));
        let interval = s.flush_if_needed(at(30), false).expect("interval");
        assert_eq!(
            s.delivery_failed(at(30), &interval, &DeliveryError::Unauthorized),
            DeliveryDisposition::Discarded
        );
        assert_eq!(s.buffered_minutes(), 0.0);
        assert_eq!(s.started_at(), Some(at(30)));

        s.record_activity(at(50), Activity::in_file("/w/a.rs"));
        let interval = s.flush_if_needed(at(60), false).expect("interval");
        assert_close(interval.minutes, 0.5);
        assert_eq!(
            s.delivery_failed(at(60), &interval, &DeliveryError::MissingCredential),
            DeliveryDisposition::Discarded
        );
        assert_eq!(s.buffered_minutes(), 0.0);
    }

    #[test]
    fn idle_pause_bills_rebuffered_minutes() {
        let mut s = started();
        let interval = s.flush_if_needed(at(60), true).expect("interval");
        s.delivery_failed(at(60), &interval, &unreachable());
        assert_close(s.buffered_minutes(), 1.0);

        s.record_activity(at(90), Activity::in_file("/w/a.rs"));

        // The carried minute plus 30 active seconds; the idle gap is not billed.
        match s.tick(at(211)) {
            TickAction::IdlePaused(Some(interval)) => {
                assert_eq!(interval.kind, FlushKind::IdlePause);
                assert_close(interval.minutes, 1.5);
            }
            other => panic!("expected idle pause with flush, got {other:?}"),
        }
        assert_paused_invariant(&s);
    }

    #[test]
    fn failure_after_stop_does_not_resurrect_session() {
        let mut s = started();
        let interval = s.flush_if_needed(at(60), true).expect("interval");
        s.stop();

        assert_eq!(
            s.delivery_failed(at(70), &interval, &unreachable()),
            DeliveryDisposition::Stale
        );
        assert_eq!(s.state(), SessionState::Stopped);
        assert_eq!(s.buffered_minutes(), 0.0);
        assert!(s.started_at().is_none());
    }

    #[test]
    fn failure_from_previous_run_is_stale() {
        let mut s = started();
        let interval = s.flush_if_needed(at(60), true).expect("interval");
        s.stop();
        s.start(at(65));

        assert_eq!(
            s.delivery_failed(at(70), &interval, &unreachable()),
            DeliveryDisposition::Stale
        );
        assert_eq!(s.buffered_minutes(), 0.0);
        assert_eq!(s.started_at(), Some(at(65)));
    }

    #[test]
    fn failure_while_paused_keeps_invariant() {
        let mut s = started();
        let interval = s.flush_if_needed(at(60), true).expect("interval");
        s.tick(at(200));
        assert!(s.is_paused());

        assert_eq!(
            s.delivery_failed(at(210), &interval, &unreachable()),
            DeliveryDisposition::Stale
        );
        assert_paused_invariant(&s);
    }

    #[test]
    fn resume_restarts_clock_without_idle_gap() {
        let mut s = started();
        s.record_activity(at(600), Activity::in_file("/w/a.rs"));

        // Pause at minute 10 plus the detection delay.
        match s.tick(at(721)) {
            TickAction::IdlePaused(Some(interval)) => assert_close(interval.minutes, 10.0),
            other => panic!("expected idle pause, got {other:?}"),
        }

        // Five minutes after minute 10, the user comes back.
        assert_eq!(
            s.record_activity(at(900), Activity::in_file("/w/a.rs")),
            ActivityOutcome::Resumed
        );
        assert_eq!(s.started_at(), Some(at(900)));
        assert_eq!(s.buffered_minutes(), 0.0);

        let interval = s.flush_if_needed(at(960), true).expect("interval");
        assert_close(interval.minutes, 1.0);
    }

    #[test]
    fn cutting_interval_only_touches_reset_fields() {
        let mut s = started();
        s.record_activity(at(45), Activity::in_file("/w/lib.rs").with_language("rust"));
        s.add_lines(LineDelta::new(9));

        let before = s.clone();
        let interval = s.flush_if_needed(at(50), false).expect("interval");
        s.delivery_succeeded(&interval);

        assert_eq!(s.state(), before.state());
        assert_eq!(s.epoch(), before.epoch());
        assert_eq!(s.last_activity_at(), before.last_activity_at());
        assert_eq!(s.last_known_file(), before.last_known_file());
        assert_eq!(s.config(), before.config());

        assert_eq!(s.started_at(), Some(at(50)));
        assert_eq!(s.buffered_minutes(), 0.0);
        assert_eq!(s.lines_added(), 0);
    }

    #[test]
    fn stopped_session_ignores_activity_and_lines() {
        let mut s = session();
        assert_eq!(
            s.record_activity(at(5), Activity::in_file("/w/a.rs")),
            ActivityOutcome::Ignored
        );
        s.add_lines(LineDelta::new(10));
        assert_eq!(s.lines_added(), 0);
        assert!(s.last_known_file().is_none());
    }

    #[test]
    fn stop_is_idempotent_and_clears_fields() {
        let mut s = started();
        s.record_activity(at(20), Activity::in_file("/w/a.rs"));
        s.add_lines(LineDelta::new(-3));

        assert!(s.stop());
        assert!(!s.stop());
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(s.started_at().is_none());
        assert_eq!(s.lines_removed(), 0);
        assert!(s.last_known_file().is_none());
    }

    #[test]
    fn file_change_drops_stale_language() {
        let mut s = started();
        s.record_activity(at(1), Activity::in_file("/w/a.rs").with_language("rust"));
        s.record_activity(at(2), Activity::in_file("/w/notes.txt"));

        let interval = s.flush_if_needed(at(3), true).expect("interval");
        assert_eq!(interval.file, Some(PathBuf::from("/w/notes.txt")));
        assert!(interval.language.is_none());
    }
}
