//! Logging setup: terse console output plus a persistent log file under
//! `~/.c8ylp/`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing. Returns the log file path when one could be opened.
///
/// `RUST_LOG` overrides the verbosity chosen by `--verbose`.
pub fn init(verbose: bool) -> Option<PathBuf> {
    let default_filter = if verbose {
        "c8ylp=debug,c8ylp_cli=debug,c8ylp_proxy=debug,c8ylp_core=debug"
    } else {
        "c8ylp=warn,c8ylp_cli=warn,c8ylp_proxy=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_layer, log_path) = match open_log_file() {
        Some((file, path)) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    log_path
}

/// Append-only log file at `~/.c8ylp/localproxy.log`.
fn open_log_file() -> Option<(std::fs::File, PathBuf)> {
    let dir = dirs::home_dir()?.join(".c8ylp");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("localproxy.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .ok()?;
    Some((file, path))
}
