//! Logging setup for catchup
//!
//! Console output always goes through [`progress::ProgressWriter`] so log
//! lines never tear a progress bar. With `--debug-log` a full trace of the
//! engine is also written to `catchup-{session_id}.log` in the temp dir.

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::progress;

/// Everything from our crates, only warnings from dependencies
const TRACE_FILTER: &str = "warn,catchup=trace,catchup_core=trace,catchup_transport=trace";

/// Keeps the background file writer alive; drop it last
pub struct DebugLog {
    pub path: PathBuf,
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

fn console_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

fn env_filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Console-only logging. `RUST_LOG` overrides the level chosen by `verbose`.
pub fn init_console(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter_or(&console_level(verbose).to_string()))
        .with_writer(progress::ProgressWriter)
        .with_target(false)
        .init();
}

/// Console logging plus a trace file for this run.
pub fn init(verbose: bool) -> DebugLog {
    let dir = std::env::temp_dir();
    let file_name = format!("catchup-{}.log", uuid::Uuid::new_v4());
    let path = dir.join(&file_name);

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &file_name));

    let trace = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
        .with_filter(env_filter_or(TRACE_FILTER));

    let console = tracing_subscriber::fmt::layer()
        .with_writer(progress::ProgressWriter)
        .with_target(false)
        .with_filter(console_level(verbose));

    tracing_subscriber::registry()
        .with(trace)
        .with(console)
        .init();

    DebugLog {
        path,
        _guard: guard,
    }
}
