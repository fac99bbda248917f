//! Wire types shared with the host editor and the collector.
//!
//! - [`HostEvent`]: notifications from the host editor (newline-delimited
//!   JSON when piped in, see [`crate::source::JsonLinesFeed`])
//! - [`ActivityPayload`]: the tracked-interval body POSTed to the collector
//! - [`VerifyResponse`]: the collector's answer to a credential check
//! - [`Notice`]: transient status notifications for the user
//!
//! All collector-facing types serialize to camelCase JSON.

use std::fmt;
use std::path::PathBuf;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryError;
use crate::line_tracker::ContentChange;
use crate::session::FlushInterval;
use crate::utils::file_meta::{basename, file_type, language_for_path, parent_name};
use crate::utils::UNKNOWN_LANGUAGE;

/// File name reported when no file has been observed.
const UNKNOWN_FILE: &str = "unknown";

/// Project name reported when none can be derived.
const UNKNOWN_PROJECT: &str = "unknown";

/// A notification from the host editor.
///
/// Line counts are optional: a host that cannot read the structured line
/// count of a document sends the raw content changes instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HostEvent {
    /// The document content changed.
    #[serde(rename_all = "camelCase")]
    Edit {
        file: PathBuf,
        #[serde(default)]
        line_count: Option<usize>,
        #[serde(default)]
        changes: Vec<ContentChange>,
        #[serde(default)]
        language: Option<String>,
    },

    /// A document was opened.
    #[serde(rename_all = "camelCase")]
    Open {
        file: PathBuf,
        #[serde(default)]
        line_count: Option<usize>,
        #[serde(default)]
        language: Option<String>,
    },

    /// A document was saved.
    #[serde(rename_all = "camelCase")]
    Save {
        file: PathBuf,
        #[serde(default)]
        line_count: Option<usize>,
        #[serde(default)]
        language: Option<String>,
    },

    /// The active editor changed. `file` is absent when no editor has focus.
    #[serde(rename_all = "camelCase")]
    FocusChange {
        #[serde(default)]
        file: Option<PathBuf>,
        #[serde(default)]
        line_count: Option<usize>,
        #[serde(default)]
        language: Option<String>,
    },

    /// A document was closed.
    Close { file: PathBuf },
}

/// Identity of the key owner returned by the verification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Collector user id; some deployments use numeric ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Text(String),
    Number(i64),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(id) => write!(f, "{id}"),
            Self::Number(id) => write!(f, "{id}"),
        }
    }
}

/// Body of a successful `GET /api/extension/verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub user: UserIdentity,
}

/// Body of `POST /api/extension/track`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPayload {
    /// ISO-8601 timestamp with millisecond precision.
    pub timestamp: String,

    /// Basename of the file only; full paths never leave the machine.
    pub file_name: String,

    /// Lowercased extension including the dot, or empty.
    pub file_type: String,

    pub project_name: String,

    /// Editor language id, `"unknown"` if undetermined.
    pub language: String,

    /// Duration in whole seconds.
    pub duration: u64,

    pub lines_added: u64,
    pub lines_removed: u64,
}

impl ActivityPayload {
    /// Builds the wire payload for an interval.
    ///
    /// `project_name` overrides the project derived from the file's parent
    /// directory.
    #[must_use]
    pub fn from_interval(interval: &FlushInterval, project_name: Option<&str>) -> Self {
        let file = interval.file.as_deref();

        let file_name = file
            .and_then(basename)
            .unwrap_or_else(|| UNKNOWN_FILE.to_string());
        let file_type = file.map(file_type).unwrap_or_default();
        let project_name = project_name
            .map(str::to_string)
            .or_else(|| file.and_then(parent_name))
            .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
        let language = interval
            .language
            .clone()
            .or_else(|| file.and_then(language_for_path).map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_LANGUAGE.to_string());

        Self {
            timestamp: interval
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            file_name,
            file_type,
            project_name,
            language,
            duration: interval.duration_seconds(),
            lines_added: interval.lines_added,
            lines_removed: interval.lines_removed,
        }
    }
}

/// Transient status notifications emitted by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Started,
    AlreadyRunning,
    Stopped,
    Resumed,
    Paused,
    Tracked { duration_secs: u64 },
    DeliveryFailed { error: DeliveryError },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "CodeTrackr: started"),
            Self::AlreadyRunning => write!(f, "CodeTrackr: already running"),
            Self::Stopped => write!(f, "CodeTrackr: stopped"),
            Self::Resumed => write!(f, "CodeTrackr: tracking resumed"),
            Self::Paused => write!(f, "CodeTrackr: paused (idle)"),
            Self::Tracked { duration_secs } => {
                write!(f, "CodeTrackr: activity tracked ({duration_secs}s)")
            }
            Self::DeliveryFailed { error } => match error {
                DeliveryError::MissingCredential => write!(
                    f,
                    "CodeTrackr: no API key configured, run `codetrackr setup-key`"
                ),
                DeliveryError::Unauthorized => write!(
                    f,
                    "CodeTrackr: invalid API key, run `codetrackr setup-key` to update it"
                ),
                DeliveryError::BadRequest { message } => write!(f, "CodeTrackr: {message}"),
                DeliveryError::Unreachable { .. } => {
                    write!(f, "CodeTrackr: cannot connect to server, will retry")
                }
                DeliveryError::Unknown { status, .. } => match status {
                    Some(status) => write!(f, "CodeTrackr: flush failed ({status}), will retry"),
                    None => write!(f, "CodeTrackr: flush failed, will retry"),
                },
            },
        }
    }
}
