//! # Armature Core
//!
//! Deploys Puppet environments from git repositories and forges through a
//! shared on-disk cache.
//!
//! References (branches, tags, commit ids, forge versions) are resolved
//! against local repository mirrors and materialized once per content
//! identity into an object store. Environments and their modules are
//! published as symlinks into that store, so identical content is stored
//! once however many environments use it.
//!
//! ## Features
//!
//! - Mirrored git repositories with fetch-at-most-once-per-run resolution
//! - Forge modules, downloaded as release tarballs
//! - Deduplicated checkouts keyed by content identity
//! - Atomic symlink publishing; readers never see a half-built tree
//! - Advisory file locks so many deployers can share one cache
//! - Mark-and-sweep garbage collection rooted at published environments
//!
//! ## Example
//!
//! ```no_run
//! use armature_core::{Cache, Environments, GitRepo};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Cache::open("/var/cache/armature")?;
//! let environments = Environments::open("/etc/puppetlabs/code/environments", &cache)?;
//!
//! // Deploy the production branch of the control repository
//! let control = GitRepo::from_url(&cache, "https://git.example.com/control.git")?;
//! environments.check_out_ref(control.as_ref(), "production", None)?;
//!
//! // Reclaim everything no environment uses any more
//! let stats = cache.garbage_collect(environments.path(), false)?;
//! println!("Trashed {} objects", stats.objects_trashed);
//! # Ok(())
//! # }
//! ```

mod cache;
mod environments;
mod error;
pub mod fsname;
mod gc;
pub mod lock;
mod manifest;
mod reference;
mod repo;
pub mod run;

pub use cache::Cache;
pub use environments::{
    Deployment, Environments, MANIFEST_NAME, sanitize_environment_name, validate_environment_name,
    validate_module_name,
};
pub use error::{Error, Result};
pub use gc::{GcStats, MAX_SYMLINK_DEPTH};
pub use lock::LockMode;
pub use manifest::{DEFAULT_GIT_REF, Manifest, ModuleSource, ModuleSpec};
pub use reference::{RefKind, Reference};
pub use repo::{
    CANONICAL_FORGE_URL, ForgeClient, ForgeRepo, GitRepo, HttpForgeClient, Repo, RepoKind,
    normalize_forge_url,
};
