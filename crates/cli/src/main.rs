//! catchup: bring a working tree up to date with a versioned repository
//!
//! Compares the working tree with the repository against the state recorded
//! at the last synchronization, shows what changed on which side and
//! resolves whole folders in one go.

mod debug_log;
mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tracing::{debug, info, warn};

use catchup_core::{
    BaseState, CancelFlag, CatchupConfig, ContentPolicy, Direction, FilterMask, FilterToggles,
    Granularity, MergeDirection, NodeId, RepositoryLocation, Session, SessionOptions, SyncKind,
    SyncMode, Tag,
};
use catchup_transport::{LocalRepository, LocalWorkspace};

use crate::progress::{ProgressMonitor, Status, print_error, print_status, print_warning};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "catchup")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Catch up a working tree with a versioned repository")]
#[command(long_about = r#"
catchup compares a working tree with a repository, using the state recorded
at the last synchronization to tell incoming, outgoing and conflicting
changes apart.

Examples:
  catchup import ./project /srv/repo      Create a repository from a tree
  catchup status                          Show what differs
  catchup status --mode incoming          Only show remote changes
  catchup resolve src --direction remote  Take the repository's version of src/
  catchup log src/main.rs                 Show a file's history
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write a detailed trace log to the temp dir
    #[arg(long, global = true)]
    debug_log: bool,

    /// Working tree root
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    #[command(flatten)]
    compare: CompareArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for values read from .catchup.toml
#[derive(Args)]
struct CompareArgs {
    /// Repository location (`:local:/path` or a plain path)
    #[arg(long, global = true)]
    repository: Option<String>,

    /// Compare against `HEAD`, `branch:NAME`, `version:NAME` or `date:SECS`
    #[arg(long, global = true)]
    tag: Option<String>,

    /// Treat files as unchanged while their modification time matches
    #[arg(long, global = true)]
    timestamps: bool,

    /// Ignore whitespace when both sides changed a file
    #[arg(long, global = true)]
    ignore_whitespace: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how the working tree differs from the repository
    Status {
        /// Which changes to show
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Only show conflicts
        #[arg(long)]
        conflicts_only: bool,

        /// Hide incoming changes
        #[arg(long)]
        no_incoming: bool,

        /// Hide outgoing changes
        #[arg(long)]
        no_outgoing: bool,
    },

    /// Resolve every difference under a path
    Resolve {
        /// Path relative to the working-tree root (the whole tree if omitted)
        path: Option<String>,

        /// Which side wins
        #[arg(short, long, value_enum, default_value = "remote")]
        direction: DirectionArg,
    },

    /// Show the repository history of a file
    Log {
        /// Path relative to the working-tree root
        file: String,
    },

    /// Check a directory into a (new) local repository
    Import {
        /// Directory to import
        source: PathBuf,

        /// Repository directory
        repo: PathBuf,

        /// Comment recorded with every imported file
        #[arg(short, long, default_value = "initial import")]
        message: String,
    },

    /// Show version and build info
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Incoming,
    Outgoing,
    Both,
    Merge,
    Compare,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Incoming => Self::Incoming,
            ModeArg::Outgoing => Self::Outgoing,
            ModeArg::Both => Self::Both,
            ModeArg::Merge => Self::Merge,
            ModeArg::Compare => Self::Compare,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    /// The repository's version replaces the local one
    Remote,
    /// The local version is kept and becomes the new baseline
    Local,
}

impl From<DirectionArg> for MergeDirection {
    fn from(direction: DirectionArg) -> Self {
        match direction {
            DirectionArg::Remote => Self::RemoteWinsLocal,
            DirectionArg::Local => Self::LocalWinsRemote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let _log_guard = if cli.debug_log {
        let log = debug_log::init(cli.verbose);
        info!("debug log at {}", log.path.display());
        Some(log)
    } else {
        debug_log::init_console(cli.verbose);
        None
    };

    match &cli.command {
        Commands::Version => {
            eprintln!("catchup {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Import {
            source,
            repo,
            message,
        } => import_command(source, repo, message)?,
        Commands::Status {
            mode,
            conflicts_only,
            no_incoming,
            no_outgoing,
        } => {
            let toggles = FilterToggles {
                incoming: !no_incoming,
                outgoing: !no_outgoing,
                conflicts_only: *conflicts_only,
            };
            status_command(&cli, mode.map(SyncMode::from), toggles).await?;
        }
        Commands::Resolve { path, direction } => {
            resolve_command(&cli, path.as_deref(), (*direction).into()).await?;
        }
        Commands::Log { file } => log_command(&cli, file).await?,
    }

    Ok(())
}

/// Cancel `flag` when the user presses Ctrl-C
fn cancel_on_interrupt(flag: &CancelFlag) {
    let flag = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current file");
            flag.cancel();
        }
    });
}

/// Session settings from .catchup.toml with command-line overrides applied
fn session_options(cli: &Cli, config: &CatchupConfig) -> Result<SessionOptions> {
    let repository = cli
        .compare
        .repository
        .clone()
        .or_else(|| config.repository.clone())
        .ok_or_else(|| eyre!("no repository configured; pass --repository or set it in .catchup.toml"))?;
    let location: RepositoryLocation = repository.parse()?;

    let tag = cli
        .compare
        .tag
        .as_deref()
        .or(config.tag.as_deref())
        .map(|t| t.parse::<Tag>().unwrap_or_default())
        .unwrap_or_default();

    let mut compare = config.compare();
    if cli.compare.timestamps {
        compare.granularity = Granularity::Timestamp;
    }
    if cli.compare.ignore_whitespace {
        compare.policy = ContentPolicy::IgnoreWhitespace;
    }

    Ok(SessionOptions {
        repository: location,
        tag,
        remote_path: config.module_path(),
        compare,
        fetch_concurrency: config.fetch_concurrency.max(1),
    })
}

async fn open_session(
    cli: &Cli,
    config: &CatchupConfig,
    monitor: &ProgressMonitor,
) -> Result<Session> {
    let options = session_options(cli, config)?;
    info!(
        repository = %options.repository,
        tag = %options.tag,
        root = %cli.dir.display(),
        "opening session"
    );

    let transport = catchup_transport::connect(&options.repository)?;
    let workspace = config
        .ignore
        .iter()
        .fold(LocalWorkspace::new(&cli.dir)?, |workspace, file| {
            workspace.with_ignore(cli.dir.join(file).to_string_lossy())
        });
    let base = BaseState::load(&cli.dir)?;

    let session = Session::open(transport, Arc::new(workspace), base, options, monitor).await?;
    Ok(session)
}

fn import_command(source: &Path, repo: &Path, message: &str) -> Result<()> {
    let start = Instant::now();
    if !source.is_dir() {
        bail!("{} is not a directory", source.display());
    }

    let repository = LocalRepository::create(repo)?;
    let count = repository.import(source, message)?;
    print_status(
        Status::IMPORTED,
        &format!(
            "{count} files into {} in {}",
            repository.location(),
            progress::elapsed(start)
        ),
    );
    Ok(())
}

/// Marker and style for one classification
fn describe(kind: SyncKind) -> (&'static str, console::Style) {
    if kind.is_pseudo_conflict() {
        return ("~", console::Style::new().dim());
    }
    match kind.direction() {
        Some(Direction::Incoming) => ("<", console::Style::new().cyan()),
        Some(Direction::Outgoing) => (">", console::Style::new().green()),
        Some(Direction::Conflicting) => ("!", console::Style::new().red().bold()),
        None => (" ", console::Style::new()),
    }
}

#[derive(Default)]
struct Tally {
    incoming: usize,
    outgoing: usize,
    conflicts: usize,
    local_bytes: u64,
}

async fn status_command(cli: &Cli, mode: Option<SyncMode>, toggles: FilterToggles) -> Result<()> {
    let start = Instant::now();
    let config = CatchupConfig::load(&cli.dir)?;
    let mask = FilterMask::for_mode(mode.unwrap_or(config.mode), toggles);
    debug!(?mask, "status filter");

    let flag = CancelFlag::new();
    cancel_on_interrupt(&flag);
    let monitor = ProgressMonitor::spinner(flag, Status::COMPARING);
    let mut session = open_session(cli, &config, &monitor).await?;
    monitor.finish();

    let mut tally = Tally::default();
    let mut stack: Vec<NodeId> = session
        .visible_children(session.root(), mask)?
        .into_iter()
        .rev()
        .collect();
    while let Some(id) = stack.pop() {
        let node = session.node(id)?;
        let kind = node.kind();
        let label = if node.is_folder() {
            format!("{}/", node.path())
        } else {
            node.path().to_string()
        };

        if node.is_folder() {
            let children = session.visible_children(id, mask)?;
            stack.extend(children.into_iter().rev());
            if kind.is_in_sync() {
                continue;
            }
        } else {
            tally.local_bytes += node.local().map_or(0, |l| l.size);
            match kind.direction() {
                Some(Direction::Incoming) => tally.incoming += 1,
                Some(Direction::Outgoing) => tally.outgoing += 1,
                Some(Direction::Conflicting) => tally.conflicts += 1,
                None => {}
            }
        }

        let (marker, style) = describe(kind);
        println!("{} {label:<50} {kind}", style.apply_to(marker));
    }

    print_status(
        Status::COMPARED,
        &format!(
            "{} incoming, {} outgoing, {} conflicting ({} local) in {}",
            tally.incoming,
            tally.outgoing,
            tally.conflicts,
            humansize::format_size(tally.local_bytes, humansize::BINARY),
            progress::elapsed(start)
        ),
    );
    Ok(())
}

async fn resolve_command(cli: &Cli, path: Option<&str>, direction: MergeDirection) -> Result<()> {
    let start = Instant::now();
    let config = CatchupConfig::load(&cli.dir)?;

    let flag = CancelFlag::new();
    cancel_on_interrupt(&flag);
    let scanning = ProgressMonitor::spinner(flag.clone(), Status::COMPARING);
    let mut session = open_session(cli, &config, &scanning).await?;
    scanning.finish();

    let target = match path {
        Some(path) => session
            .find(path.trim_matches('/'))
            .ok_or_else(|| eyre!("{path} is neither in the working tree nor in the repository"))?,
        None => session.root(),
    };
    let total = session.tree().leaves(target).len() as u64;

    let monitor = ProgressMonitor::bar(flag, Status::RESOLVING, total);
    let report = session.resolve(target, direction, &monitor).await?;
    monitor.finish();

    session.base_state().save(&cli.dir)?;

    for (path, kind) in &report.resolved {
        debug!(path, %kind, "resolved");
    }
    for (path, err) in &report.failed {
        print_error(Status::FAILED, &format!("{path}: {err}"));
    }
    for (path, kind) in &report.unsettled {
        print_warning(Status::UNSETTLED, &format!("{path}: {kind}"));
    }

    if report.cancelled {
        print_warning(
            Status::CANCELLED,
            &format!(
                "{} resolved, {} not visited",
                report.resolved.len(),
                report.unvisited.len()
            ),
        );
        bail!("resolution cancelled");
    }
    if !report.failed.is_empty() {
        bail!(
            "some items could not be resolved ({} of {})",
            report.failed.len(),
            report.failed.len() + report.resolved.len() + report.unsettled.len()
        );
    }
    if !report.unsettled.is_empty() {
        bail!(
            "{} of {} files are still out of sync",
            report.unsettled.len(),
            report.unsettled.len() + report.resolved.len()
        );
    }

    print_status(
        Status::RESOLVED,
        &format!(
            "{} files ({} already in sync) in {}",
            report.resolved.len(),
            report.skipped,
            progress::elapsed(start)
        ),
    );
    Ok(())
}

fn format_date(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map_or_else(|| secs.to_string(), |d| d.format("%Y-%m-%d %H:%M:%S").to_string())
}

async fn log_command(cli: &Cli, file: &str) -> Result<()> {
    let config = CatchupConfig::load(&cli.dir)?;
    let flag = CancelFlag::new();
    cancel_on_interrupt(&flag);
    let monitor = ProgressMonitor::spinner(flag, Status::FETCHING);
    let session = open_session(cli, &config, &monitor).await?;

    let node = session
        .find(file.trim_matches('/'))
        .ok_or_else(|| eyre!("{file} is not in the repository"))?;
    let entries = session.history(node, &monitor).await?;
    monitor.finish();

    let revision_style = console::Style::new().yellow();
    for entry in entries.iter().rev() {
        let tags = if entry.tags.is_empty() {
            String::new()
        } else {
            format!(" ({})", entry.tags.join(", "))
        };
        println!(
            "{}{tags}  {}  {}",
            revision_style.apply_to(&entry.revision),
            format_date(entry.date_secs),
            entry.author
        );
        for line in entry.comment.lines() {
            println!("    {line}");
        }
    }
    Ok(())
}
