//! Cargo-style progress output for catchup
//!
//! ```text
//!   Comparing [===========>             ] src/main.rs
//!    Resolved 12 files in 1.4s
//! ```

use std::io::Write as _;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use catchup_core::{CancelFlag, Monitor};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::fmt::MakeWriter;

/// Status verbs for cargo-style output (right-aligned to 12 chars)
pub struct Status;

impl Status {
    pub const COMPARING: &str = "Comparing";
    pub const COMPARED: &str = "Compared";
    pub const RESOLVING: &str = "Resolving";
    pub const RESOLVED: &str = "Resolved";
    pub const IMPORTED: &str = "Imported";
    pub const FETCHING: &str = "Fetching";
    pub const UNSETTLED: &str = "Unsettled";
    pub const CANCELLED: &str = "Cancelled";
    pub const FAILED: &str = "Failed";
}

static MULTI: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    print_styled(console::Style::new().green().bold(), status, message);
}

/// Print a status line in warning colors
pub fn print_warning(status: &str, message: &str) {
    print_styled(console::Style::new().yellow().bold(), status, message);
}

pub fn print_error(status: &str, message: &str) {
    print_styled(console::Style::new().red().bold(), status, message);
}

fn print_styled(style: console::Style, status: &str, message: &str) {
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

/// Format the time since `start` the way the summary lines show it
pub fn elapsed(start: Instant) -> String {
    let elapsed = start.elapsed();
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// Progress display that doubles as the engine's cancellation monitor
pub struct ProgressMonitor {
    flag: CancelFlag,
    bar: ProgressBar,
}

impl ProgressMonitor {
    /// Spinner for work of unknown size
    pub fn spinner(flag: CancelFlag, verb: &str) -> Self {
        let bar = MULTI.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg:>12} {prefix:.dim}")
                .expect("valid template"),
        );
        bar.set_message(verb.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { flag, bar }
    }

    /// Bar over `total` units of work
    pub fn bar(flag: CancelFlag, verb: &str, total: u64) -> Self {
        let bar = MULTI.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} {msg:>12} [{bar:25.cyan/dim}] {pos}/{len} {prefix:.dim}",
                )
                .expect("valid template")
                .progress_chars("=> "),
        );
        bar.set_message(verb.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { flag, bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Monitor for ProgressMonitor {
    fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }

    fn worked(&self, units: u64) {
        self.flag.worked(units);
        self.bar.inc(units);
    }

    fn sub_task(&self, label: &str) {
        self.flag.sub_task(label);
        self.bar.set_prefix(label.to_string());
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

/// Log writer that keeps tracing output from tearing progress bars
#[derive(Clone, Copy, Default)]
pub struct ProgressWriter;

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        MULTI.suspend(|| std::io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}
