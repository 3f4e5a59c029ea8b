//! catchup-transport: repository access and working-tree I/O
//!
//! Provides the directory-backed repository and the filesystem workspace the
//! engine runs against.

pub mod repository;
pub mod workspace;

use std::sync::Arc;

use color_eyre::Result;
use color_eyre::eyre::bail;

use catchup_core::{RepositoryLocation, Transport};

pub use repository::LocalRepository;
pub use workspace::LocalWorkspace;

/// Open a transport for `location`
///
/// # Errors
/// Returns an error if the access method is unsupported or the repository
/// does not exist.
pub fn connect(location: &RepositoryLocation) -> Result<Arc<dyn Transport>> {
    if !location.is_local() {
        bail!("access method {:?} is not supported", location.method);
    }
    Ok(Arc::new(LocalRepository::open(&location.root)?))
}
