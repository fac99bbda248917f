//! Per-file line count tracking.
//!
//! The tracker remembers the last observed line count of each file and turns
//! every new observation into a signed [`LineDelta`]. Comparing whole-file
//! line counts keeps the totals correct even when a document changes outside
//! of the edit notifications we see (external tools, reloads, formatters).
//!
//! When the host cannot report a line count for an edit, the delta falls back
//! to the raw content changes of that edit: each change contributes the number
//! of newlines it inserts minus the number of lines its replaced range spans.
//!
//! The cache is a bounded LRU; files are also evicted when the host reports
//! them closed.
//!
//! # Example
//!
//! ```
//! use std::num::NonZeroUsize;
//! use std::path::Path;
//! use codetrackr::line_tracker::LineDeltaTracker;
//!
//! let mut tracker = LineDeltaTracker::new(NonZeroUsize::new(16).unwrap());
//! let file = Path::new("/work/src/lib.rs");
//!
//! // First observation is the baseline.
//! assert_eq!(tracker.record_observed_line_count(file, 100).get(), 0);
//! assert_eq!(tracker.record_observed_line_count(file, 104).get(), 4);
//! assert_eq!(tracker.record_observed_line_count(file, 101).get(), -3);
//! ```

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Default number of files whose line counts are remembered.
pub const DEFAULT_LINE_CACHE_SIZE: usize = 1000;

/// Zero-based, end-inclusive line range replaced by a content change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRange {
    pub start_line: u32,
    pub end_line: u32,
}

/// A single raw content-change operation reported by the host editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChange {
    /// Text inserted by the change.
    #[serde(default)]
    pub text: String,

    /// Range of lines replaced by the change, if known.
    #[serde(default)]
    pub range: Option<LineRange>,
}

impl ContentChange {
    /// Signed line delta of this change: inserted newlines minus the replaced
    /// line span.
    #[must_use]
    pub fn line_delta(&self) -> i64 {
        let inserted = self.text.matches('\n').count() as i64;
        let replaced = self
            .range
            .map(|r| i64::from(r.end_line) - i64::from(r.start_line))
            .unwrap_or(0);
        inserted - replaced
    }
}

/// A signed change in a file's line count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineDelta(i64);

impl LineDelta {
    /// Wraps a raw signed delta.
    #[must_use]
    pub const fn new(delta: i64) -> Self {
        Self(delta)
    }

    /// Returns the raw signed delta.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Lines added (positive part of the delta).
    #[must_use]
    pub fn added(self) -> u64 {
        if self.0 > 0 {
            self.0.unsigned_abs()
        } else {
            0
        }
    }

    /// Lines removed (magnitude of the negative part of the delta).
    #[must_use]
    pub fn removed(self) -> u64 {
        if self.0 < 0 {
            self.0.unsigned_abs()
        } else {
            0
        }
    }

    /// Splits the delta into `(added, removed)`.
    #[must_use]
    pub fn split(self) -> (u64, u64) {
        (self.added(), self.removed())
    }
}

/// Sums the fallback deltas of a list of raw content changes.
#[must_use]
pub fn fallback_delta(changes: &[ContentChange]) -> LineDelta {
    LineDelta(changes.iter().map(ContentChange::line_delta).sum())
}

/// Remembers the last known line count of recently touched files.
#[derive(Debug)]
pub struct LineDeltaTracker {
    counts: LruCache<PathBuf, usize>,
}

impl LineDeltaTracker {
    /// Creates a tracker remembering at most `capacity` files.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            counts: LruCache::new(capacity),
        }
    }

    /// Records a line count without producing a delta.
    ///
    /// Used for open, save and focus notifications, which establish the
    /// baseline that later edits are compared against.
    pub fn baseline(&mut self, file: &Path, line_count: usize) {
        self.counts.put(file.to_path_buf(), line_count);
    }

    /// Records an observed line count and returns the change since the last
    /// observation.
    ///
    /// The first observation of a file is its baseline and yields a zero
    /// delta.
    pub fn record_observed_line_count(&mut self, file: &Path, line_count: usize) -> LineDelta {
        let previous = self.counts.get(file).copied().unwrap_or(line_count);
        self.counts.put(file.to_path_buf(), line_count);

        let delta = LineDelta(line_count as i64 - previous as i64);
        trace!(
            file = %file.display(),
            previous,
            current = line_count,
            delta = delta.get(),
            "Observed line count"
        );
        delta
    }

    /// Computes the delta for an edit notification.
    ///
    /// Uses the structured line count when the host could read it. Otherwise
    /// falls back to the raw content changes and shifts any cached count by
    /// the same amount so the next structured read stays consistent.
    pub fn observe_edit(
        &mut self,
        file: &Path,
        line_count: Option<usize>,
        changes: &[ContentChange],
    ) -> LineDelta {
        if let Some(count) = line_count {
            return self.record_observed_line_count(file, count);
        }

        let delta = fallback_delta(changes);
        if let Some(cached) = self.counts.get_mut(file) {
            *cached = (*cached as i64 + delta.get()).max(0) as usize;
        }

        trace!(
            file = %file.display(),
            changes = changes.len(),
            delta = delta.get(),
            "Line count unavailable, using content changes"
        );
        delta
    }

    /// Forgets a file, typically because the host closed it.
    pub fn forget(&mut self, file: &Path) {
        self.counts.pop(file);
    }

    /// Returns the cached line count for a file.
    #[must_use]
    pub fn cached(&self, file: &Path) -> Option<usize> {
        self.counts.peek(file).copied()
    }

    /// Number of files currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if no file is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for LineDeltaTracker {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_LINE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(capacity: usize) -> LineDeltaTracker {
        LineDeltaTracker::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn change(text: &str, range: Option<(u32, u32)>) -> ContentChange {
        ContentChange {
            text: text.to_string(),
            range: range.map(|(start_line, end_line)| LineRange {
                start_line,
                end_line,
            }),
        }
    }

    #[test]
    fn first_observation_is_baseline() {
        let mut t = tracker(4);
        let delta = t.record_observed_line_count(Path::new("a.rs"), 42);
        assert_eq!(delta, LineDelta::new(0));
        assert_eq!(t.cached(Path::new("a.rs")), Some(42));
    }

    #[test]
    fn signed_deltas_follow_line_counts() {
        let mut t = tracker(4);
        let file = Path::new("a.rs");
        t.baseline(file, 10);

        assert_eq!(t.record_observed_line_count(file, 15).split(), (5, 0));
        assert_eq!(t.record_observed_line_count(file, 12).split(), (0, 3));
        assert_eq!(t.record_observed_line_count(file, 12).split(), (0, 0));
    }

    #[test]
    fn external_change_is_picked_up_on_next_observation() {
        let mut t = tracker(4);
        let file = Path::new("a.rs");
        t.baseline(file, 10);

        // The document grew by 20 lines without an edit notification; the
        // next observation still accounts for the whole difference.
        let delta = t.record_observed_line_count(file, 30);
        assert_eq!(delta.get(), 20);
    }

    #[test]
    fn fallback_uses_newlines_minus_replaced_span() {
        let changes = vec![
            change("fn a() {}\nfn b() {}\n", None),
            change("", Some((3, 7))),
            change("x\n", Some((10, 11))),
        ];
        // +2, -4, +1-1
        assert_eq!(fallback_delta(&changes).get(), -2);
    }

    #[test]
    fn observe_edit_falls_back_when_line_count_missing() {
        let mut t = tracker(4);
        let file = Path::new("a.rs");
        t.baseline(file, 10);

        let delta = t.observe_edit(file, None, &[change("a\nb\nc\n", None)]);
        assert_eq!(delta.get(), 3);
        assert_eq!(t.cached(file), Some(13));

        // A structured read afterwards compares against the shifted count.
        assert_eq!(t.observe_edit(file, Some(14), &[]).get(), 1);
    }

    #[test]
    fn fallback_never_drives_cached_count_negative() {
        let mut t = tracker(4);
        let file = Path::new("a.rs");
        t.baseline(file, 1);

        let delta = t.observe_edit(file, None, &[change("", Some((0, 5)))]);
        assert_eq!(delta.get(), -5);
        assert_eq!(t.cached(file), Some(0));
    }

    #[test]
    fn fallback_without_baseline_does_not_create_entry() {
        let mut t = tracker(4);
        let delta = t.observe_edit(Path::new("new.rs"), None, &[change("\n", None)]);
        assert_eq!(delta.get(), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn forget_evicts_file() {
        let mut t = tracker(4);
        let file = Path::new("a.rs");
        t.baseline(file, 10);
        t.forget(file);

        assert!(t.cached(file).is_none());
        // After eviction the next observation is a fresh baseline.
        assert_eq!(t.record_observed_line_count(file, 50).get(), 0);
    }

    #[test]
    fn cache_is_bounded() {
        let mut t = tracker(2);
        t.baseline(Path::new("a.rs"), 1);
        t.baseline(Path::new("b.rs"), 2);
        t.baseline(Path::new("c.rs"), 3);

        assert_eq!(t.len(), 2);
        assert!(t.cached(Path::new("a.rs")).is_none());
        assert_eq!(t.cached(Path::new("c.rs")), Some(3));
    }

    #[test]
    fn line_delta_split() {
        assert_eq!(LineDelta::new(7).split(), (7, 0));
        assert_eq!(LineDelta::new(-4).split(), (0, 4));
        assert_eq!(LineDelta::default().split(), (0, 0));
    }
}
