//! Utility modules for the CodeTrackr tracker.
//!
//! # Modules
//!
//! - [`clock`]: Monotonic time source shared by the session and scheduler
//! - [`file_meta`]: Path-derived metadata (basename, extension, language)

pub mod clock;
pub mod file_meta;

pub use clock::{Clock, SystemClock};
pub use file_meta::{basename, file_type, language_for_path, UNKNOWN_LANGUAGE};
