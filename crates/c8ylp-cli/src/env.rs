//! Dotenv handling.
//!
//! The env file is loaded before clap parses the command line, so its
//! values act as defaults below both the process environment and explicit
//! flags. After a successful login the session token can be written back.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Find `--env-file` in the raw arguments before clap runs.
///
/// Supports both `--env-file path` and `--env-file=path`, and falls back
/// to the `C8YLP_ENV_FILE` variable.
pub fn early_env_file(args: &[String]) -> Option<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--env-file" {
            return iter.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(value));
        }
    }
    std::env::var_os("C8YLP_ENV_FILE").map(PathBuf::from)
}

/// Load a dotenv file without overriding existing process variables.
pub fn load(path: &Path) -> Result<()> {
    dotenvy::from_path(path)
        .with_context(|| format!("failed to load env file {}", path.display()))?;
    debug!(path = %path.display(), "env file loaded");
    Ok(())
}

/// Upsert `key=value` pairs into a dotenv file, creating it if missing.
///
/// The file is only rewritten when something actually changed; returns
/// whether it was.
pub fn save(path: &Path, pairs: &[(&str, &str)]) -> Result<bool> {
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
    let mut changed = false;

    for (key, value) in pairs {
        let entry = format!("{key}={value}");
        let found = lines.iter_mut().find(|line| {
            line.split_once('=')
                .map(|(name, _)| name.trim() == *key)
                .unwrap_or(false)
        });
        match found {
            Some(line) if *line != entry => {
                *line = entry;
                changed = true;
            }
            Some(_) => {}
            None => {
                lines.push(entry);
                changed = true;
            }
        }
    }

    if changed {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    Ok(changed)
}
