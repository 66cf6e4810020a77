use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log to the console and append to `log_file`.
///
/// `RUST_LOG` overrides the default `info` filter. With `json` set the file
/// receives one JSON object per event instead of plain lines.
pub fn init_tracing(log_file: &Path, json: bool) -> Result<()> {
    if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().with_target(false).compact();

    let (text_file, json_file) = if json {
        let layer = fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .json();
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false);
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file)
        .with(json_file)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_log_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("logs").join("backup.log");

        // A second subscriber in the same test binary fails to install; the
        // file is still created before that point.
        let _ = init_tracing(&log_file, false);
        assert!(log_file.exists());
    }
}
