//! Repository providers.
//!
//! A repository is one local mirror of one remote source. Providers resolve
//! reference strings to [`Reference`]s and materialize references into the
//! cache's object store. Two providers exist: [`GitRepo`] mirrors a git
//! remote, and [`ForgeRepo`] downloads release tarballs described by forge
//! metadata.

mod forge;
mod git;

pub use forge::{CANONICAL_FORGE_URL, ForgeClient, ForgeRepo, HttpForgeClient, normalize_forge_url};
pub use git::GitRepo;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::fsname;
use crate::reference::Reference;
use std::fmt;
use std::path::PathBuf;

/// Kind of repository provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoKind {
    Git,
    Forge,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoKind::Git => "git",
            RepoKind::Forge => "forge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "git" => Some(RepoKind::Git),
            "forge" => Some(RepoKind::Forge),
            _ => None,
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities shared by every repository provider.
pub trait Repo: Send + Sync + fmt::Debug {
    fn kind(&self) -> RepoKind;

    /// Canonical URL of the remote.
    fn url(&self) -> &str;

    /// Cache key for this repository.
    fn id(&self) -> String {
        fsname::repo_id(self.kind(), self.url())
    }

    /// Resolve a reference string, fetching at most once per run on a miss.
    fn general_ref(&self, ref_str: &str) -> Result<Reference>;

    /// Fetch unconditionally, then resolve.
    fn refreshed_ref(&self, ref_str: &str) -> Result<Reference> {
        self.freshen_now()?;
        self.general_ref(ref_str)
    }

    /// Resolve a name found under `ref/mutable/` in the cache.
    fn mutable_fs_ref(&self, ref_str: &str) -> Result<Reference>;

    /// Materialize a reference and return its reference cache path.
    fn check_out(&self, cache: &Cache, reference: &Reference) -> Result<PathBuf>;

    /// True once the repository has fetched during this run.
    fn is_fresh(&self) -> bool;

    /// Fetch, regardless of whether this run already fetched.
    fn freshen_now(&self) -> Result<()>;

    /// Fetch unless this run already fetched. Returns whether it fetched.
    fn freshen(&self) -> Result<bool> {
        if self.is_fresh() {
            Ok(false)
        } else {
            self.freshen_now()?;
            Ok(true)
        }
    }

    /// Forget memoized resolutions and the fetched-this-run flag.
    fn flush_memory(&self);

    /// Downcast to the git provider.
    fn as_git(&self) -> Option<&GitRepo> {
        None
    }
}

/// Reject reference strings that cannot name anything and could be
/// mistaken for command-line options.
pub(crate) fn validate_ref_str(ref_str: &str) -> Result<()> {
    if ref_str.is_empty() {
        return Err(Error::invalid_name("ref", ref_str, "must not be empty"));
    }
    if ref_str.starts_with('-') {
        return Err(Error::invalid_name("ref", ref_str, "must not start with '-'"));
    }
    if ref_str.contains('\0') || ref_str.contains('\n') {
        return Err(Error::invalid_name("ref", ref_str, "must not contain control characters"));
    }
    Ok(())
}
