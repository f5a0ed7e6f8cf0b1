//! Operator-facing logging for the kernel process.
//!
//! The event store is the authoritative record of kernel decisions; tracing
//! output exists for an operator tailing a live process. A running kernel
//! (`start`) writes JSON lines to a daily-rotated file named after the
//! agent, carrying the structured fields kernel modules attach at call
//! sites (`episode_id`, `call_id`, `tool`, `invariant`), plus compact
//! human-readable stderr. One-shot subcommands (`check-config`, `baseline`)
//! log to stderr only.
//!
//! `RUST_LOG` overrides the default filter, which keeps dependency noise at
//! `warn` while kernel modules log at `info`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive for the process lifetime.
/// Dropping it flushes pending entries and closes the file.
pub struct LoggingGuard {
    _file_writer: WorkerGuard,
}

/// Kernel modules at `info`, everything else at `warn`.
fn default_filter() -> EnvFilter {
    EnvFilter::new("warn,straylight=info")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter())
}

/// Initialise logging for a running kernel.
///
/// JSON lines land in `{logs_dir}/{agent_name}.jsonl.YYYY-MM-DD` with daily
/// rotation, one file per agent so side-by-side kernels on one host never
/// interleave. The current span is omitted from file output: the kernel
/// identifies work by the `episode_id`/`call_id` fields on each record,
/// not by span nesting.
///
/// Returns a [`LoggingGuard`] that must be kept alive for log flushing.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_service(logs_dir: &Path, agent_name: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, format!("{agent_name}.jsonl"));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard {
        _file_writer: guard,
    })
}

/// Stderr-only logging for one-shot subcommands. No file, no rotation.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
