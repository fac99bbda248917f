//! CodeTrackr - coding activity tracker.
//!
//! This binary hosts the tracker outside an editor: it observes a workspace
//! (or host events piped into stdin) and reports coding activity to the
//! CodeTrackr collector.
//!
//! # Commands
//!
//! - `codetrackr run`: Track a workspace until interrupted
//! - `codetrackr setup-key`: Enter, check and store an API key
//! - `codetrackr info`: Show which account the stored key belongs to
//! - `codetrackr verify`: Check the stored key once and exit
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use codetrackr::config::Config;
use codetrackr::credentials::{
    check_key_format, ApiKey, CredentialStore, CredentialVerifier, KeySource, RetryPolicy,
    VerifyOutcome,
};
use codetrackr::delivery::DeliveryClient;
use codetrackr::scheduler;
use codetrackr::source::{JsonLinesFeed, SubscriptionSource};
use codetrackr::utils::{basename, SystemClock};
use codetrackr::watcher::WorkspaceWatcher;

/// Time given to background tasks once the command has finished.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// CodeTrackr - coding activity tracker.
///
/// Tracks active coding time and line changes and reports them to the
/// CodeTrackr collector.
#[derive(Parser, Debug)]
#[command(name = "codetrackr")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    CODETRACKR_API_BASE             Collector URL (default: hosted collector)
    CODETRACKR_API_KEY              API key (overrides the stored key)
    CODETRACKR_KEY_PATH             Key directory (default: ~/.codetrackr)
    CODETRACKR_USER_ID              User identifier (default: login name)
    CODETRACKR_FLUSH_INTERVAL_SECS  Seconds between flush checks (default: 30)
    CODETRACKR_MIN_FLUSH_MINUTES    Minimum minutes per flush (default: 0.1)
    CODETRACKR_IDLE_THRESHOLD_SECS  Idle time before pausing (default: 120)
    CODETRACKR_LINE_CACHE_SIZE      Files with remembered line counts (default: 1000)
    CODETRACKR_PROJECT_NAME         Project name (default: workspace directory name)

EXAMPLES:
    # Store your API key
    codetrackr setup-key

    # Track the current directory
    codetrackr run

    # Track events sent by an editor plugin
    my-editor-plugin | codetrackr run --stdin
")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Track coding activity until interrupted.
    ///
    /// Watches the workspace directory for file changes, or reads host
    /// events as JSON lines from stdin with --stdin.
    Run {
        /// Workspace directory to watch (default: current directory).
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Read newline-delimited host events from stdin instead of
        /// watching the file system.
        #[arg(long)]
        stdin: bool,
    },

    /// Enter and store an API key.
    SetupKey,

    /// Show which account the configured API key belongs to.
    Info,

    /// Verify the configured API key once.
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// What to do after startup verification gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Retry,
    Reconfigure,
    Quit,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let result = runtime.block_on(run(cli.command));

    // A pending blocking read on stdin must not hold up exit.
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    result
}

/// Loads configuration and dispatches the subcommand.
async fn run(command: Command) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    match command {
        Command::Run { workspace, stdin } => run_tracker(config, workspace, stdin).await,
        Command::SetupKey => run_setup_key(&config).await,
        Command::Info => run_info(&config).await,
        Command::Verify => run_verify(&config).await,
    }
}

/// Runs the tracker until a shutdown signal or the end of the host event stream.
async fn run_tracker(config: Config, workspace: Option<PathBuf>, use_stdin: bool) -> Result<()> {
    info!(
        api_base = %config.api_base,
        user_id = %config.user_id,
        flush_interval_secs = config.flush_interval_secs,
        idle_threshold_secs = config.idle_threshold_secs,
        "Configuration loaded"
    );

    let store = CredentialStore::new(&config.key_path);
    let Some((mut key, source)) = store.load().context("Failed to load API key")? else {
        warn!("No API key configured");
        bail!(
            "No API key configured. Run 'codetrackr setup-key' or set CODETRACKR_API_KEY \
             (key directory: {}).",
            config.key_path.display()
        );
    };
    log_key_source(&store, &source);

    let verifier = CredentialVerifier::new(config.api_base.clone())
        .context("Failed to create HTTP client")?;

    loop {
        match verifier
            .verify_with_retry(&key, &RetryPolicy::default())
            .await
        {
            VerifyOutcome::Verified(user) => {
                info!(user = %user.name, "API key verified");
                eprintln!("CodeTrackr: connected as {}", user.name);
                break;
            }
            VerifyOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                eprintln!(
                    "CodeTrackr: could not verify API key after {attempts} attempt(s): {last_error}"
                );
                eprintln!("Check that the collector is running and the API key is correct.");

                if use_stdin {
                    bail!("API key verification failed: {last_error}");
                }

                match choose_recovery().await? {
                    Recovery::Retry => continue,
                    Recovery::Reconfigure => {
                        let Some(new_key) = prompt_for_key().await? else {
                            return Ok(());
                        };
                        store.save(&new_key).context("Failed to save API key")?;
                        key = new_key;
                    }
                    Recovery::Quit => return Ok(()),
                }
            }
        }
    }

    let workspace = match workspace {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("Workspace not found: {}", workspace.display()))?;

    let mut delivery_config = config.delivery_config(Some(key));
    if delivery_config.project_name.is_none() {
        delivery_config.project_name = basename(&workspace);
    }
    info!(
        workspace = %workspace.display(),
        project = delivery_config.project_name.as_deref().unwrap_or("unknown"),
        "Tracking workspace"
    );

    let client = DeliveryClient::new(delivery_config).context("Failed to create HTTP client")?;
    let (handle, mut notices, tracker_task) =
        scheduler::spawn(config.tracker_settings(), client, SystemClock::new());

    let notice_task = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            eprintln!("{notice}");
        }
    });

    let mut feed = None;
    let mut _watcher = None;
    if use_stdin {
        let mut stdin_feed = JsonLinesFeed::new(tokio::io::stdin());
        stdin_feed
            .attach(handle.sink())
            .context("Failed to read host events from stdin")?;
        feed = Some(stdin_feed);
    } else {
        let mut watcher = WorkspaceWatcher::new(workspace.clone())
            .context("Failed to create workspace watcher")?;
        watcher.attach(handle.sink()).with_context(|| {
            format!("Failed to watch workspace {}", workspace.display())
        })?;
        _watcher = Some(watcher);
    }

    handle.start().await.context("Tracker stopped unexpectedly")?;
    info!("Tracker running. Press Ctrl+C to stop.");

    let feed_finished = async {
        match feed.as_mut() {
            Some(feed) => {
                feed.finished().await;
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = wait_for_shutdown() => info!("Shutdown signal received"),
        _ = feed_finished => info!("Host event stream ended"),
    }

    info!("Shutting down...");

    match handle.flush_now().await {
        Ok(Some(report)) => match report.result {
            Ok(_) => info!(
                duration_secs = report.interval.duration_seconds(),
                "Final interval delivered"
            ),
            Err(e) => warn!(error = %e, "Final interval could not be delivered"),
        },
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Tracker already stopped"),
    }

    handle.shutdown().await.ok();
    drop(handle);
    drop(_watcher);

    tracker_task.await.context("Tracker task failed")?;
    notice_task.await.ok();

    info!("Tracker stopped");
    Ok(())
}

/// Runs the setup-key command: read, check, store and verify a key.
async fn run_setup_key(config: &Config) -> Result<()> {
    let store = CredentialStore::new(&config.key_path);

    let Some(key) = prompt_for_key().await? else {
        return Ok(());
    };

    let path = store.save(&key).context("Failed to save API key")?;
    eprintln!("API key saved to {}, verifying...", path.display());

    match config.verify_key(&key).await {
        Ok(user) => println!("Welcome, {}!", user.name),
        Err(e) => {
            eprintln!("API key saved but verification failed: {e}");
            eprintln!("Check that the collector at {} is running.", config.api_base);
        }
    }

    Ok(())
}

/// Runs the info command.
async fn run_info(config: &Config) -> Result<()> {
    let store = CredentialStore::new(&config.key_path);
    let Some((key, source)) = store.load().context("Failed to load API key")? else {
        println!("No API key configured.");
        println!();
        println!("Run 'codetrackr setup-key' or set CODETRACKR_API_KEY.");
        return Ok(());
    };

    println!("Collector: {}", config.api_base);
    println!("API key:   {} (from {source})", key.hint());

    match config.verify_key(&key).await {
        Ok(user) => println!("Connected as {} ({})", user.name, user.email),
        Err(e) => println!("Not connected: {e}"),
    }

    Ok(())
}

/// Runs the verify command. Fails with a non-zero exit status if the key is
/// missing or rejected.
async fn run_verify(config: &Config) -> Result<()> {
    let store = CredentialStore::new(&config.key_path);
    let Some((key, _)) = store.load().context("Failed to load API key")? else {
        bail!("No API key configured. Run 'codetrackr setup-key' first.");
    };

    let user = config
        .verify_key(&key)
        .await
        .context("API key verification failed")?;

    println!("OK: {} ({}), user id {}", user.name, user.email, user.id);
    Ok(())
}

/// Reads a key from stdin and checks its format.
///
/// Returns `None` if the user entered nothing or declined to save a key that
/// fails the format check.
async fn prompt_for_key() -> Result<Option<ApiKey>> {
    let key = ApiKey::new(prompt("Enter your CodeTrackr API key: ").await?);
    if key.is_empty() {
        eprintln!("No API key entered.");
        return Ok(None);
    }

    if let Err(e) = check_key_format(key.expose()) {
        eprintln!("Warning: {e}. CodeTrackr keys are 64 hexadecimal characters.");
        let answer = prompt("Save anyway? [y/N] ").await?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            eprintln!("Aborted.");
            return Ok(None);
        }
    }

    Ok(Some(key))
}

/// Asks what to do after startup verification gave up.
async fn choose_recovery() -> Result<Recovery> {
    let answer = prompt("[r]etry, re[c]onfigure the key, or [q]uit? ").await?;
    Ok(match answer.trim().to_ascii_lowercase().as_str() {
        "r" | "retry" => Recovery::Retry,
        "c" | "reconfigure" => Recovery::Reconfigure,
        _ => Recovery::Quit,
    })
}

/// Prints a prompt on stderr and reads one line from stdin.
async fn prompt(message: &str) -> Result<String> {
    let message = message.to_string();
    tokio::task::spawn_blocking(move || -> io::Result<String> {
        eprint!("{message}");
        io::stderr().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input)
    })
    .await
    .context("Prompt task failed")?
    .context("Failed to read from stdin")
}

fn log_key_source(store: &CredentialStore, source: &KeySource) {
    match source {
        KeySource::EnvironmentVariable => {
            if store.exists() {
                info!(
                    ignored_path = %store.key_path().display(),
                    "Key file exists but CODETRACKR_API_KEY takes precedence"
                );
            }
            info!(source = "environment", "API key loaded");
        }
        KeySource::File(path) => {
            info!(source = "file", path = %path.display(), "API key loaded");
        }
    }
}

/// Initializes the logging subsystem. Logs go to stderr so stdout stays
/// free for command output.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_level(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_workspace_and_stdin() {
        let cli = Cli::parse_from(["codetrackr", "run", "--workspace", "/tmp/ws", "--stdin"]);
        match cli.command {
            Command::Run { workspace, stdin } => {
                assert_eq!(workspace.as_deref(), Some(Path::new("/tmp/ws")));
                assert!(stdin);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn log_format_is_global() {
        let cli = Cli::parse_from(["codetrackr", "verify", "--log-format", "json"]);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
