//! Publishing environments.
//!
//! An environment is a symlink `<environments>/<name>` pointing at the
//! identity entry of a control repository checkout. Deploying resolves the
//! reference, checks it out, links the modules its `Puppetfile` declares
//! into `modules/`, and finally swaps the environment symlink.
//!
//! Module links point at reference cache entries, so refreshing a module
//! branch with [`Cache::update_mutable_refs`] reaches every environment
//! that uses it.

use crate::cache::{Cache, visible_entries};
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::manifest::{Manifest, ModuleSource};
use crate::repo::{ForgeRepo, GitRepo, Repo};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the manifest read from each checked-out environment.
pub const MANIFEST_NAME: &str = "Puppetfile";

fn is_environment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Environment names are limited to `[A-Za-z0-9_]+`.
pub fn validate_environment_name(name: &str) -> Result<()> {
    if !name.is_empty() && name.chars().all(is_environment_char) {
        Ok(())
    } else {
        Err(Error::invalid_name("environment", name, "must match [A-Za-z0-9_]+"))
    }
}

/// Replace every character not allowed in an environment name with `_`.
pub fn sanitize_environment_name(name: &str) -> String {
    name.chars()
        .map(|c| if is_environment_char(c) { c } else { '_' })
        .collect()
}

/// Module names become directory names under `modules/`.
pub fn validate_module_name(name: &str) -> Result<()> {
    if name.is_empty() {
        Err(Error::invalid_name("module", name, "must not be empty"))
    } else if name.starts_with('.') {
        Err(Error::invalid_name("module", name, "may not start with period"))
    } else if name.contains('/') || name.contains('\0') {
        Err(Error::invalid_name("module", name, "may not contain /"))
    } else {
        Ok(())
    }
}

/// Result of deploying one reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Deployment {
    /// The environment now points at a fresh checkout.
    Deployed {
        name: String,
        reference: String,
        identity: String,
        path: PathBuf,
        modules: usize,
    },
    /// The reference no longer exists, so neither does the environment.
    Removed { name: String },
}

impl Deployment {
    pub fn name(&self) -> &str {
        match self {
            Deployment::Deployed { name, .. } | Deployment::Removed { name } => name,
        }
    }
}

/// How a deploy resolves its reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolve {
    /// Fetch the repository first.
    Refresh,
    /// The repository was fetched earlier in this run.
    Fetched,
}

/// The directory Puppet reads environments from.
#[derive(Debug)]
pub struct Environments<'a> {
    path: PathBuf,
    cache: &'a Cache,
    sanitize_names: bool,
}

impl<'a> Environments<'a> {
    /// Open an existing environments directory.
    pub fn open<P: AsRef<Path>>(path: P, cache: &'a Cache) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("environments path does not exist: {}", path.display()),
            )
            .into());
        }
        Ok(Self {
            path: path.canonicalize()?,
            cache,
            sanitize_names: false,
        })
    }

    /// Replace invalid characters in environment names instead of failing.
    pub fn sanitize_names(mut self, enabled: bool) -> Self {
        self.sanitize_names = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Published environment names, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(visible_entries(&self.path)?.into_iter().map(|(name, _)| name).collect())
    }

    /// Unpublish an environment. Returns false if it did not exist.
    pub fn remove(&self, name: &str) -> Result<bool> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Error::invalid_name("environment", name, "is not a single path segment"));
        }
        match fs::remove_file(self.path.join(name)) {
            Ok(()) => {
                debug!(name, "environment deleted");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(name, "environment does not exist");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Turn a requested name into a valid environment name, or fail.
    pub fn environment_name(&self, name: &str) -> Result<String> {
        match validate_environment_name(name) {
            Ok(()) => Ok(name.to_string()),
            Err(err) if !self.sanitize_names || name.is_empty() => Err(err),
            Err(_) => {
                let sanitized = sanitize_environment_name(name);
                warn!(
                    name,
                    sanitized = %sanitized,
                    "substituting invalid characters in environment name"
                );
                Ok(sanitized)
            }
        }
    }

    /// Deploy `ref_str` from the control repository as environment `name`
    /// (defaults to `ref_str`).
    ///
    /// If the reference no longer exists the environment is removed. If
    /// anything else fails the previously published environment is left
    /// as it was.
    pub fn check_out_ref(
        &self,
        repo: &dyn Repo,
        ref_str: &str,
        name: Option<&str>,
    ) -> Result<Deployment> {
        self.deploy(repo, ref_str, name, Resolve::Refresh)
    }

    fn deploy(
        &self,
        repo: &dyn Repo,
        ref_str: &str,
        name: Option<&str>,
        resolve: Resolve,
    ) -> Result<Deployment> {
        let name = self.environment_name(name.unwrap_or(ref_str))?;

        self.cache.lock(LockMode::Shared, None, || {
            info!(ref_str, url = repo.url(), environment = %name, "deploying");

            let resolved = match resolve {
                Resolve::Refresh => repo.refreshed_ref(ref_str),
                Resolve::Fetched => repo.general_ref(ref_str),
            }
            .and_then(|reference| repo.check_out(self.cache, &reference).map(|_| reference));
            let reference = match resolved {
                Ok(reference) => reference,
                Err(err) if err.is_ref_not_found() => {
                    info!(
                        ref_str,
                        environment = %name,
                        "ref does not exist; ensuring environment is gone"
                    );
                    self.remove(&name)?;
                    return Ok(Deployment::Removed { name: name.clone() });
                }
                Err(err) => return Err(err),
            };

            // Publish the identity entry: a failure below, or a later move of
            // the branch, must not change what the environment points at.
            let published = self.cache.identity_path(&reference);
            let manifest_path = published.join(MANIFEST_NAME);
            let manifest = if manifest_path.is_file() {
                let manifest = Manifest::load(&manifest_path)?;
                debug!(environment = %name, modules = manifest.len(), "loaded Puppetfile");
                manifest
            } else {
                debug!(environment = %name, "no Puppetfile");
                Manifest::default()
            };

            self.update_modules(&published, &manifest)?;
            self.cache.atomic_symlink(&published, &self.path.join(&name))?;
            debug!(ref_str, url = repo.url(), environment = %name, "done deploying");

            Ok(Deployment::Deployed {
                name: name.clone(),
                reference: reference.to_string(),
                identity: reference.identity.clone(),
                path: published,
                modules: manifest.len(),
            })
        })
    }

    /// Deploy every branch of the control repository and remove
    /// environments whose branch is gone.
    ///
    /// The control repository is fetched once, when listing its branches.
    pub fn deploy_branches(&self, repo: &GitRepo) -> Result<Vec<Deployment>> {
        let branches = repo.branches()?;
        self.deploy_listed(repo, &branches)
    }

    /// Deploy `branches`, which were listed after fetching `repo` this run.
    fn deploy_listed(&self, repo: &dyn Repo, branches: &[String]) -> Result<Vec<Deployment>> {
        let mut wanted = HashSet::new();
        for branch in branches {
            wanted.insert(self.environment_name(branch)?);
        }

        let mut deployments = Vec::new();
        for name in self.names()? {
            if !wanted.contains(&name) {
                info!(environment = %name, "removing environment without a branch");
                self.remove(&name)?;
                deployments.push(Deployment::Removed { name });
            }
        }
        for branch in branches {
            deployments.push(self.deploy(repo, branch, None, Resolve::Fetched)?);
        }
        Ok(deployments)
    }

    /// Link every declared module into `<target>/modules/` and delete
    /// entries no longer declared.
    fn update_modules(&self, target: &Path, manifest: &Manifest) -> Result<()> {
        let modules_path = target.join("modules");
        if !modules_path.is_dir() {
            fs::create_dir(&modules_path)?;
        }

        for module in manifest.modules() {
            validate_module_name(&module.name)?;
            let (repo, ref_str) = match &module.source {
                ModuleSource::Git { url, reference } => {
                    (GitRepo::from_url(self.cache, url)?, reference.as_str())
                }
                ModuleSource::Forge {
                    forge_url,
                    full_name,
                    version,
                } => (ForgeRepo::from_url(self.cache, forge_url, full_name)?, version.as_str()),
            };

            let reference = repo.general_ref(ref_str)?;
            debug!(module = %module.name, %reference, url = repo.url(), "module");
            let module_path = repo.check_out(self.cache, &reference)?;
            self.cache.atomic_symlink(&module_path, &modules_path.join(&module.name))?;
        }

        // Dot entries are other deployers' symlinks in mid-swap.
        for (name, path) in visible_entries(&modules_path)? {
            if manifest.get(&name).is_none() {
                debug!(module = %name, "removing undeclared module");
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
