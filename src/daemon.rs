//! Process plumbing: tracing setup and shutdown signals.

use anyhow::Context as _;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{FormatFields, format};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::Path;

/// Longest `message` field written before it is cut with `...`.
const MAX_MESSAGE_CHARS: usize = 280;

/// Field names whose values are never written to the log.
const REDACTED_FIELDS: &[&str] = &["token", "api_key", "authorization"];

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

fn field_format() -> impl for<'writer> FormatFields<'writer> + 'static {
    format::debug_fn(|writer, field, value| {
        let field_name = field.name();

        if REDACTED_FIELDS.contains(&field_name) {
            write!(writer, "{field_name}=<redacted> ")
        } else if field_name == "message" {
            let formatted = format!("{value:?}");
            let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
            if was_truncated {
                write!(writer, "{truncated}... ")
            } else {
                write!(writer, "{formatted} ")
            }
        } else {
            write!(writer, "{field_name}={value:?} ")
        }
    })
}

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--debug`.
fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
}

/// Install the global subscriber: compact terminal output plus a daily
/// rolling `dashbot.log` in `log_dir`.
///
/// The returned guard flushes the file writer when dropped; hold it for the
/// life of the process.
pub fn init_tracing(log_dir: &Path, debug: bool) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "dashbot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .fmt_fields(field_format())
        .compact();
    let terminal_layer = tracing_subscriber::fmt::layer()
        .fmt_fields(field_format())
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(terminal_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
