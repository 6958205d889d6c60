use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Sets up the global tracing subscriber with a fmt formatter and env filter.
///
/// The caller provides a fallback filter string that is used when `RUST_LOG` is
/// not set. When `log_dir` is given, a second debug-level layer writes to a
/// timestamped file in that directory; its path is returned.
pub fn init_tracing(
    default_filter: &str,
    log_dir: Option<&Path>,
) -> Result<Option<PathBuf>, anyhow::Error> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let console = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_filter(console_filter);

    let (file_layer, file_path) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let path = dir.join(format!(
                "steam_price_{}.log",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            ));
            let file = File::create(&path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file))
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;
    Ok(file_path)
}
