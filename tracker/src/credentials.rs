//! API key handling: format checks, storage and verification.
//!
//! Keys are stored in the CodeTrackr directory (`~/.codetrackr/` by default)
//! as a single file:
//!
//! - `api_key`: the trimmed key followed by a newline (file mode 0600)
//!
//! The `CODETRACKR_API_KEY` environment variable takes precedence over the
//! file. Verification asks the collector who owns the key via
//! `GET {api_base}/api/extension/verify`.
//!
//! # Example
//!
//! ```no_run
//! use codetrackr::credentials::{CredentialStore, CredentialVerifier, RetryPolicy, VerifyOutcome};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = CredentialStore::new(Path::new("/home/user/.codetrackr"));
//!     let Some((key, _source)) = store.load().unwrap() else {
//!         eprintln!("run `codetrackr setup-key` first");
//!         return;
//!     };
//!
//!     let verifier = CredentialVerifier::new("https://codetrackr.example.com").unwrap();
//!     match verifier.verify_with_retry(&key, &RetryPolicy::default()).await {
//!         VerifyOutcome::Verified(user) => println!("Connected as {}", user.name),
//!         VerifyOutcome::Exhausted { attempts, last_error } => {
//!             eprintln!("gave up after {attempts} attempts: {last_error}");
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::HeaderValue;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::delivery::API_KEY_HEADER;
use crate::types::{UserIdentity, VerifyResponse};

/// API key filename.
const API_KEY_FILE: &str = "api_key";

/// Environment variable overriding the stored key.
pub const ENV_API_KEY: &str = "CODETRACKR_API_KEY";

/// Expected key length in hexadecimal characters.
pub const KEY_LENGTH: usize = 64;

/// Path of the verification endpoint relative to the API base.
pub const VERIFY_PATH: &str = "/api/extension/verify";

/// Verification request timeout.
const VERIFY_TIMEOUT_SECS: u64 = 10;

/// Default number of retries after the first failed verification.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default fixed delay between verification attempts.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// An API key. The value is wiped from memory when dropped and never shown
/// by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wraps a key, trimming surrounding whitespace.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        let mut raw = key.into();
        let trimmed = raw.trim().to_string();
        raw.zeroize();
        Self(trimmed)
    }

    /// Returns the key for use in a request header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the key is empty after trimming.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short prefix safe to show in logs and CLI output.
    #[must_use]
    pub fn hint(&self) -> String {
        let prefix: String = self.0.chars().take(6).collect();
        format!("{prefix}…")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

impl Drop for ApiKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Why a key does not look like a CodeTrackr key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyFormatError {
    #[error("API key is empty")]
    Empty,

    #[error("API key should be {KEY_LENGTH} characters, got {length}")]
    WrongLength { length: usize },

    #[error("API key should be hexadecimal, found {character:?}")]
    NonHex { character: char },
}

/// Checks that a key is exactly 64 hexadecimal characters (either case).
///
/// The key is trimmed first. A mismatch is advisory: the user may still
/// choose to save the key.
///
/// # Errors
///
/// Returns the first problem found.
pub fn check_key_format(key: &str) -> Result<(), KeyFormatError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(KeyFormatError::Empty);
    }

    let length = key.chars().count();
    if length != KEY_LENGTH {
        return Err(KeyFormatError::WrongLength { length });
    }

    match key.chars().find(|c| !c.is_ascii_hexdigit()) {
        Some(character) => Err(KeyFormatError::NonHex { character }),
        None => Ok(()),
    }
}

/// Indicates where the API key was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Key loaded from `CODETRACKR_API_KEY`.
    EnvironmentVariable,
    /// Key loaded from the file at the given path.
    File(PathBuf),
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnvironmentVariable => write!(f, "environment variable {ENV_API_KEY}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Errors that can occur while loading or saving the key.
#[derive(Error, Debug)]
pub enum CredentialError {
    /// I/O error during key file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The environment variable is set but blank.
    #[error("environment variable {0} is set but empty")]
    EmptyEnvVar(String),

    /// The key file exists but holds no key.
    #[error("key file is empty: {0}")]
    EmptyFile(PathBuf),

    /// Refusing to store a blank key.
    #[error("refusing to save an empty API key")]
    EmptyKey,
}

/// On-disk key storage.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Creates a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Directory holding the key file.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of the key file.
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(API_KEY_FILE)
    }

    /// Checks if a key file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.key_path().exists()
    }

    /// Loads the key, trying the environment variable first, then the file.
    ///
    /// Returns `Ok(None)` when neither is present.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError` if:
    /// - The env var is set but blank (no fallback to the file)
    /// - The key file exists but cannot be read or is blank
    pub fn load(&self) -> Result<Option<(ApiKey, KeySource)>, CredentialError> {
        if let Ok(value) = std::env::var(ENV_API_KEY) {
            let key = ApiKey::new(value);
            if key.is_empty() {
                return Err(CredentialError::EmptyEnvVar(ENV_API_KEY.to_string()));
            }
            return Ok(Some((key, KeySource::EnvironmentVariable)));
        }

        let path = self.key_path();
        if !path.exists() {
            return Ok(None);
        }

        let key = ApiKey::new(fs::read_to_string(&path)?);
        if key.is_empty() {
            return Err(CredentialError::EmptyFile(path));
        }

        debug!(path = %path.display(), "Loaded API key from file");
        Ok(Some((key, KeySource::File(path))))
    }

    /// Saves the key, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError` if the key is blank, the directory cannot
    /// be created, or the file cannot be written.
    pub fn save(&self, key: &ApiKey) -> Result<PathBuf, CredentialError> {
        if key.is_empty() {
            return Err(CredentialError::EmptyKey);
        }

        fs::create_dir_all(&self.dir)?;

        let path = self.key_path();
        let mut file = File::create(&path)?;
        file.write_all(key.expose().as_bytes())?;
        file.write_all(b"\n")?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&path, perms)?;
        }

        info!(path = %path.display(), "API key saved");
        Ok(path)
    }
}

/// Errors returned by a single verification attempt.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// The collector does not recognise the key (401).
    #[error("invalid API key")]
    Unauthorized,

    /// The collector could not be reached.
    #[error("cannot reach {api_base}: {message}")]
    Unreachable { api_base: String, message: String },

    /// Any other status.
    #[error("unexpected response {status}: {message}")]
    Unexpected { status: u16, message: String },

    /// Request or decoding failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl VerifyError {
    /// A rejected key will be rejected again; other failures may be transient.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Fixed-delay retry policy for startup verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Result of verifying with retries.
#[derive(Debug)]
pub enum VerifyOutcome {
    Verified(UserIdentity),
    Exhausted { attempts: u32, last_error: VerifyError },
}

/// Checks keys against the collector.
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    api_base: String,
    client: Client,
}

impl CredentialVerifier {
    /// Creates a verifier for the given collector.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_base: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(VERIFY_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Performs one verification request.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` describing why the key could not be confirmed.
    pub async fn verify(&self, key: &ApiKey) -> Result<UserIdentity, VerifyError> {
        let url = format!("{}{}", self.api_base, VERIFY_PATH);
        let mut header = HeaderValue::from_str(key.expose()).map_err(|_| {
            warn!("API key contains characters not allowed in an HTTP header");
            VerifyError::Unauthorized
        })?;
        header.set_sensitive(true);

        debug!(url = %url, key = %key.hint(), "Verifying API key");

        let response = match self
            .client
            .get(&url)
            .header(API_KEY_HEADER, header)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Err(VerifyError::Unreachable {
                    api_base: self.api_base.clone(),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(VerifyError::Http(e)),
        };

        match response.status() {
            status if status.is_success() => {
                let body: VerifyResponse = response.json().await?;
                info!(user = %body.user.name, "API key verified");
                Ok(body.user)
            }
            StatusCode::UNAUTHORIZED => Err(VerifyError::Unauthorized),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(VerifyError::Unexpected {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    /// Verifies with a fixed delay between attempts.
    ///
    /// Makes at most `policy.max_retries + 1` attempts. A 401 ends the loop
    /// immediately.
    pub async fn verify_with_retry(&self, key: &ApiKey, policy: &RetryPolicy) -> VerifyOutcome {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let error = match self.verify(key).await {
                Ok(user) => return VerifyOutcome::Verified(user),
                Err(e) => e,
            };

            if error.is_final() || attempts > policy.max_retries {
                warn!(attempts, error = %error, "API key verification failed");
                return VerifyOutcome::Exhausted {
                    attempts,
                    last_error: error,
                };
            }

            warn!(
                attempt = attempts,
                max_retries = policy.max_retries,
                error = %error,
                "Verification failed, retrying"
            );
            tokio::time::sleep(policy.delay).await;
        }
    }
}
