//! Transport contract between the engine and a version-control server
//!
//! The engine only ever issues three kinds of commands:
//! - `Update`: stream the content of one file at a pinned revision
//! - `Log`: list the history of one file
//! - `List`: enumerate a folder (recursively) at a tag
//!
//! Results flow back through a [`ResponseHandler`] the engine supplies.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::monitor::Monitor;

/// Separator used in server-side paths
pub const SERVER_SEPARATOR: char = '/';

/// Command kinds understood by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Update,
    Log,
    List,
}

/// Options applying to the whole command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalOption {
    /// Suppress informational server output
    Quiet,
}

/// Options applying to the command's targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOption {
    /// Pin the target to a revision
    Revision(String),
    /// Select by symbolic name (branch or version)
    Tag(String),
    /// Select by date
    Date(String),
    /// Send a pristine copy, ignoring local modifications
    CleanCopy,
    /// Descend into sub-folders
    Recursive,
}

/// Where a repository lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryLocation {
    /// Access method (`local`, `ext`, `pserver`, ...)
    pub method: String,
    pub user: Option<String>,
    pub host: Option<String>,
    /// Repository root path on the server
    pub root: String,
}

impl RepositoryLocation {
    /// A repository on the local filesystem
    #[must_use]
    pub fn local(root: impl Into<String>) -> Self {
        Self {
            method: "local".to_string(),
            user: None,
            host: None,
            root: root.into(),
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.method == "local"
    }
}

impl FromStr for RepositoryLocation {
    type Err = TransportError;

    /// Parse `:method:[user@]host:/root`, `:local:/root` or a bare path
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix(':') else {
            return Ok(Self::local(s));
        };

        let (method, rest) = rest
            .split_once(':')
            .ok_or_else(|| TransportError::protocol(format!("missing method in {s:?}")))?;

        if method == "local" {
            return Ok(Self::local(rest));
        }

        let (authority, root) = rest.split_once(':').ok_or_else(|| {
            TransportError::protocol(format!("expected :method:[user@]host:/root, got {s:?}"))
        })?;
        let (user, host) = match authority.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host.to_string()),
            None => (None, authority.to_string()),
        };
        if host.is_empty() {
            return Err(TransportError::protocol(format!("missing host in {s:?}")));
        }

        Ok(Self {
            method: method.to_string(),
            user,
            host: Some(host),
            root: root.to_string(),
        })
    }
}

impl fmt::Display for RepositoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}:", self.method)?;
        if let Some(host) = &self.host {
            if let Some(user) = &self.user {
                write!(f, "{user}@")?;
            }
            write!(f, "{host}:")?;
        }
        write!(f, "{}", self.root)
    }
}

/// A fully described request to the transport
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub global_options: Vec<GlobalOption>,
    pub local_options: Vec<CommandOption>,
    /// Names relative to `context`
    pub targets: Vec<String>,
    /// Folder the command runs in, as server path segments
    pub context: Vec<String>,
    pub repository: RepositoryLocation,
}

impl Command {
    #[must_use]
    pub fn new(kind: CommandKind, repository: RepositoryLocation, context: Vec<String>) -> Self {
        Self {
            kind,
            global_options: Vec::new(),
            local_options: Vec::new(),
            targets: Vec::new(),
            context,
            repository,
        }
    }

    #[must_use]
    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.targets.push(name.into());
        self
    }

    #[must_use]
    pub fn option(mut self, option: CommandOption) -> Self {
        self.local_options.push(option);
        self
    }

    #[must_use]
    pub fn options(mut self, options: impl IntoIterator<Item = CommandOption>) -> Self {
        self.local_options.extend(options);
        self
    }

    #[must_use]
    pub fn global(mut self, option: GlobalOption) -> Self {
        self.global_options.push(option);
        self
    }

    /// First revision option, if any
    #[must_use]
    pub fn revision(&self) -> Option<&str> {
        self.local_options.iter().find_map(|o| match o {
            CommandOption::Revision(r) => Some(r.as_str()),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_option(&self, option: &CommandOption) -> bool {
        self.local_options.contains(option)
    }
}

/// How the server finished a command that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// Completed, but the server emitted warnings
    Warnings(Vec<String>),
}

/// One entry of a file's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub revision: String,
    pub author: String,
    /// Commit time, seconds since the UNIX epoch
    pub date_secs: i64,
    pub comment: String,
    /// Symbolic names attached to this revision
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What a listed entry is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingKind {
    Folder,
    File { revision: String, binary: bool },
}

/// One entry of a folder listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Path relative to the listed folder, name last
    pub path: Vec<String>,
    pub kind: ListingKind,
}

/// Receives the responses of a command.
///
/// Handlers only override the callbacks relevant to the command they are
/// passed with; the defaults reject unexpected content and drop the rest.
pub trait ResponseHandler: Send {
    /// Stream the content of `name`; `binary` disables line-ending translation
    fn receive_content(
        &mut self,
        name: &str,
        _reader: &mut dyn Read,
        _size: u64,
        _binary: bool,
    ) -> std::io::Result<()> {
        Err(std::io::Error::other(format!(
            "unexpected content for {name}"
        )))
    }

    fn log_entry(&mut self, _entry: LogEntry) {}

    fn listing_entry(&mut self, _entry: ListingEntry) {}

    /// Free-form server output
    fn message(&mut self, line: &str) {
        tracing::debug!(target: "catchup::server", "{line}");
    }
}

/// Executes commands against a repository
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command`, feeding responses to `handler`
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the request fails for any reason.
    async fn execute(
        &self,
        command: &Command,
        monitor: &dyn Monitor,
        handler: &mut dyn ResponseHandler,
    ) -> Result<Outcome, TransportError>;
}

/// Collects streamed file content
#[derive(Debug, Default)]
pub struct ContentReceiver {
    contents: Option<Bytes>,
    binary: bool,
}

impl ContentReceiver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Content received so far, if any
    #[must_use]
    pub fn into_contents(self) -> Option<Bytes> {
        self.contents
    }

    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.binary
    }
}

/// Convert CRLF line endings to LF
#[must_use]
pub fn normalize_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(byte);
    }
    out
}

impl ResponseHandler for ContentReceiver {
    fn receive_content(
        &mut self,
        name: &str,
        reader: &mut dyn Read,
        size: u64,
        binary: bool,
    ) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        reader.take(size).read_to_end(&mut buf)?;
        if (buf.len() as u64) < size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{name}: expected {size} bytes, got {}", buf.len()),
            ));
        }

        let data = if binary {
            buf
        } else {
            normalize_line_endings(&buf)
        };
        self.binary = binary;
        self.contents = Some(Bytes::from(data));
        Ok(())
    }
}

/// Collects history entries in server order
#[derive(Debug, Default)]
pub struct LogCollector {
    pub entries: Vec<LogEntry>,
}

impl ResponseHandler for LogCollector {
    fn log_entry(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }
}

/// Collects listing entries in server order
#[derive(Debug, Default)]
pub struct ListingCollector {
    pub entries: Vec<ListingEntry>,
}

impl ResponseHandler for ListingCollector {
    fn listing_entry(&mut self, entry: ListingEntry) {
        self.entries.push(entry);
    }
}
