//! Directory-backed repository speaking the engine's transport contract
//!
//! Every versioned file is a history directory named after the file with a
//! `,v` suffix:
//!
//! ```text
//! <root>/src/a.txt,v/
//!     log.json          history entries, oldest first, plus the binary flag
//!     revisions/1.1     content of each revision
//!     revisions/1.2
//! ```
//!
//! Plain directories are folders. The last history entry is the head.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use catchup_core::error::TransportError;
use catchup_core::transport::{
    Command, CommandKind, CommandOption, ListingEntry, ListingKind, LogEntry, Outcome,
    RepositoryLocation, ResponseHandler, SERVER_SEPARATOR, Transport,
};
use catchup_core::{Monitor, Scanner};

/// Suffix of a file's history directory
pub const HISTORY_SUFFIX: &str = ",v";

const LOG_FILE: &str = "log.json";
const REVISIONS_DIR: &str = "revisions";

/// Stored history of one file
#[derive(Debug, Default, Serialize, Deserialize)]
struct History {
    binary: bool,
    entries: Vec<LogEntry>,
}

impl History {
    fn head(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    fn revision(&self, revision: &str) -> Option<&LogEntry> {
        self.entries.iter().find(|e| e.revision == revision)
    }

    /// Entry selected by the command's options; head when none select
    fn select(&self, command: &Command) -> std::result::Result<Option<&LogEntry>, TransportError> {
        if let Some(revision) = command.revision() {
            return Ok(self.revision(revision));
        }
        for option in &command.local_options {
            match option {
                CommandOption::Tag(name) => {
                    return Ok(self.entries.iter().rev().find(|e| e.tags.contains(name)));
                }
                CommandOption::Date(date) => {
                    let limit: i64 = date.parse().map_err(|_| {
                        TransportError::protocol(format!("unsupported date selector {date:?}"))
                    })?;
                    return Ok(self.entries.iter().rev().find(|e| e.date_secs <= limit));
                }
                _ => {}
            }
        }
        Ok(self.head())
    }
}

/// A repository stored in a local directory
pub struct LocalRepository {
    root: PathBuf,
    commands: AtomicUsize,
}

fn is_binary(contents: &[u8]) -> bool {
    contents.contains(&0)
}

fn segments(path: &str) -> Vec<String> {
    path.split(SERVER_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Next revision after `previous` (`1.1` when there is none)
fn next_revision(previous: Option<&str>) -> String {
    let Some((major, minor)) = previous.and_then(|p| p.split_once('.')) else {
        return "1.1".to_string();
    };
    let minor: u64 = minor.parse().unwrap_or(0);
    format!("{major}.{}", minor + 1)
}

impl LocalRepository {
    /// Open an existing repository directory
    ///
    /// # Errors
    /// Returns an error if `root` is not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("repository {} does not exist", root.display());
        }
        Ok(Self {
            root,
            commands: AtomicUsize::new(0),
        })
    }

    /// Create the repository directory if needed and open it
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Self::open(root)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn location(&self) -> RepositoryLocation {
        RepositoryLocation::local(self.root.to_string_lossy())
    }

    /// Number of commands executed so far
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    fn history_dir(&self, segments: &[String]) -> PathBuf {
        let mut dir = self.root.clone();
        if let Some((name, parents)) = segments.split_last() {
            for parent in parents {
                dir.push(parent);
            }
            dir.push(format!("{name}{HISTORY_SUFFIX}"));
        }
        dir
    }

    fn load_history(dir: &Path) -> std::result::Result<History, TransportError> {
        let log_path = dir.join(LOG_FILE);
        if !log_path.is_file() {
            return Err(TransportError::not_found(format!(
                "no history at {}",
                dir.display()
            )));
        }
        let content = std::fs::read_to_string(&log_path)?;
        serde_json::from_str(&content)
            .map_err(|e| TransportError::protocol(format!("corrupt history {}: {e}", dir.display())))
    }

    fn save_history(dir: &Path, history: &History) -> Result<()> {
        std::fs::create_dir_all(dir.join(REVISIONS_DIR))?;
        std::fs::write(dir.join(LOG_FILE), serde_json::to_string_pretty(history)?)?;
        Ok(())
    }

    /// Record a new revision of `path` and return its number
    ///
    /// # Errors
    /// Returns an error if the history cannot be read or written.
    pub fn check_in(&self, path: &str, contents: &[u8], comment: &str) -> Result<String> {
        self.check_in_at(path, contents, comment, chrono::Utc::now().timestamp())
    }

    /// Like [`LocalRepository::check_in`] with an explicit commit time
    ///
    /// # Errors
    /// Returns an error if the history cannot be read or written.
    pub fn check_in_at(
        &self,
        path: &str,
        contents: &[u8],
        comment: &str,
        date_secs: i64,
    ) -> Result<String> {
        let segments = segments(path);
        if segments.is_empty() {
            bail!("cannot check in an empty path");
        }
        let dir = self.history_dir(&segments);
        let mut history = match Self::load_history(&dir) {
            Ok(history) => history,
            Err(err) if err.kind == catchup_core::TransportErrorKind::NotFound => History::default(),
            Err(err) => return Err(eyre!(err)),
        };

        let revision = next_revision(history.head().map(|e| e.revision.as_str()));
        history.binary |= is_binary(contents);
        history.entries.push(LogEntry {
            revision: revision.clone(),
            author: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            date_secs,
            comment: comment.to_string(),
            tags: Vec::new(),
        });

        Self::save_history(&dir, &history)?;
        std::fs::write(dir.join(REVISIONS_DIR).join(&revision), contents)?;
        debug!(path, %revision, "checked in");
        Ok(revision)
    }

    /// Attach a symbolic name to one revision of `path`
    ///
    /// # Errors
    /// Returns an error if the file or revision does not exist.
    pub fn tag(&self, path: &str, revision: &str, name: &str) -> Result<()> {
        let dir = self.history_dir(&segments(path));
        let mut history = Self::load_history(&dir)?;
        let entry = history
            .entries
            .iter_mut()
            .find(|e| e.revision == revision)
            .ok_or_else(|| eyre!("{path} has no revision {revision}"))?;
        if !entry.tags.iter().any(|t| t == name) {
            entry.tags.push(name.to_string());
        }
        Self::save_history(&dir, &history)
    }

    /// Remove `path` and its history from the repository
    ///
    /// # Errors
    /// Returns an error if the history cannot be deleted.
    pub fn remove(&self, path: &str) -> Result<()> {
        let dir = self.history_dir(&segments(path));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Check in every file of `source` as a new revision
    ///
    /// # Errors
    /// Returns an error if scanning or checking in fails.
    pub fn import(&self, source: &Path, comment: &str) -> Result<usize> {
        let entries = Scanner::new(source).scan()?;
        for entry in &entries {
            let contents = std::fs::read(source.join(&entry.path))?;
            let path = catchup_core::base::path_key(&entry.path);
            self.check_in(&path, &contents, comment)?;
        }
        info!(files = entries.len(), root = %self.root.display(), "imported");
        Ok(entries.len())
    }

    fn update(
        &self,
        command: &Command,
        handler: &mut dyn ResponseHandler,
    ) -> std::result::Result<(), TransportError> {
        for target in &command.targets {
            let mut path = command.context.clone();
            path.push(target.clone());
            let dir = self.history_dir(&path);
            let history = Self::load_history(&dir)?;

            let entry = history.select(command)?.ok_or_else(|| {
                TransportError::not_found(format!("{} has no matching revision", path.join("/")))
            })?;
            let revision_path = dir.join(REVISIONS_DIR).join(&entry.revision);
            let size = std::fs::metadata(&revision_path)?.len();
            let mut file = File::open(&revision_path)?;
            handler.receive_content(target, &mut file, size, history.binary)?;
        }
        Ok(())
    }

    fn log(
        &self,
        command: &Command,
        handler: &mut dyn ResponseHandler,
    ) -> std::result::Result<(), TransportError> {
        for target in &command.targets {
            let mut path = command.context.clone();
            path.push(target.clone());
            let history = Self::load_history(&self.history_dir(&path))?;
            for entry in history.entries {
                handler.log_entry(entry);
            }
        }
        Ok(())
    }

    fn list(
        &self,
        command: &Command,
        handler: &mut dyn ResponseHandler,
    ) -> std::result::Result<(), TransportError> {
        let mut dir = self.root.clone();
        for segment in &command.context {
            dir.push(segment);
        }
        if !dir.is_dir() {
            return Err(TransportError::not_found(format!(
                "no folder {}",
                command.context.join("/")
            )));
        }

        let recursive = command.has_option(&CommandOption::Recursive);
        self.list_dir(&dir, &[], command, recursive, handler)
    }

    fn list_dir(
        &self,
        dir: &Path,
        prefix: &[String],
        command: &Command,
        recursive: bool,
        handler: &mut dyn ResponseHandler,
    ) -> std::result::Result<(), TransportError> {
        let mut names: Vec<(String, PathBuf)> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().is_dir())
            .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
            .collect();
        names.sort();

        for (name, path) in names {
            let mut entry_path = prefix.to_vec();
            if let Some(file_name) = name.strip_suffix(HISTORY_SUFFIX) {
                let history = Self::load_history(&path)?;
                let Some(entry) = history.select(command)? else {
                    continue;
                };
                entry_path.push(file_name.to_string());
                handler.listing_entry(ListingEntry {
                    path: entry_path,
                    kind: ListingKind::File {
                        revision: entry.revision.clone(),
                        binary: history.binary,
                    },
                });
            } else {
                entry_path.push(name);
                handler.listing_entry(ListingEntry {
                    path: entry_path.clone(),
                    kind: ListingKind::Folder,
                });
                if recursive {
                    self.list_dir(&path, &entry_path, command, recursive, handler)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalRepository {
    async fn execute(
        &self,
        command: &Command,
        _monitor: &dyn Monitor,
        handler: &mut dyn ResponseHandler,
    ) -> std::result::Result<Outcome, TransportError> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        debug!(
            kind = ?command.kind,
            context = %command.context.join("/"),
            targets = ?command.targets,
            "executing"
        );
        if !command.repository.is_local() {
            return Err(TransportError::protocol(format!(
                "{} is not a local repository",
                command.repository
            )));
        }

        match command.kind {
            CommandKind::Update => self.update(command, handler)?,
            CommandKind::Log => self.log(command, handler)?,
            CommandKind::List => self.list(command, handler)?,
        }
        Ok(Outcome::Ok)
    }
}
