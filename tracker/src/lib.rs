//! CodeTrackr - coding activity tracker.
//!
//! This crate turns a stream of editor notifications (edits, opens, saves,
//! focus changes) into idle-aware usage intervals and reports them to the
//! CodeTrackr collector.
//!
//! # Overview
//!
//! ```text
//! SubscriptionSource ─▶ LineDeltaTracker ─▶ Session ─▶ Tracker tick ─▶ DeliveryClient
//!                                              ▲                           │
//!                                              └────── success/failure ────┘
//! ```
//!
//! # Privacy
//!
//! Only metadata leaves the machine: file basename, extension, project name,
//! language id, duration and line counts. File contents and full paths are
//! never sent.
//!
//! # Modules
//!
//! - [`line_tracker`]: Per-file line counts and signed line deltas
//! - [`session`]: Session aggregation and flush state machine
//! - [`scheduler`]: The tracker task, its handle and periodic flushing
//! - [`delivery`]: HTTP delivery of intervals and failure classification
//! - [`credentials`]: API key format checks, storage and verification
//! - [`source`]: Event source trait, event sink and JSON lines feed
//! - [`watcher`]: Workspace file system watcher
//! - [`types`]: Wire types and status notices
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Crate-level error type
//! - [`utils`]: Clock and file metadata helpers

pub mod config;
pub mod credentials;
pub mod delivery;
pub mod error;
pub mod line_tracker;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod types;
pub mod utils;
pub mod watcher;

pub use config::{Config, ConfigError};
pub use credentials::{
    check_key_format, ApiKey, CredentialStore, CredentialVerifier, RetryPolicy, VerifyOutcome,
};
pub use delivery::{Deliver, DeliveryClient, DeliveryConfig, DeliveryError, Receipt};
pub use error::{CodeTrackrError, Result};
pub use line_tracker::{LineDelta, LineDeltaTracker};
pub use scheduler::{StartOutcome, Tracker, TrackerHandle, TrackerSettings};
pub use session::{FlushInterval, Session, SessionConfig, SessionSnapshot, SessionState};
pub use source::{EventSink, JsonLinesFeed, SourceError, SubscriptionSource};
pub use types::{ActivityPayload, HostEvent, Notice};
pub use watcher::WorkspaceWatcher;
