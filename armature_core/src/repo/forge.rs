//! Modules downloaded from a Puppet Forge.
//!
//! A forge "mirror" holds no content, only the coordinates of the module.
//! Release metadata is fetched at most once per run and release tarballs
//! are unpacked straight into the object store.

use super::{Repo, RepoKind, validate_ref_str};
use crate::cache::{Cache, visible_entries};
use crate::error::{Error, Result};
use crate::fsname;
use crate::reference::{RefKind, Reference};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

pub const CANONICAL_FORGE_URL: &str = "https://forge.puppet.com";

const FORGE_URLS: [&str; 7] = [
    "https://forge.puppetlabs.com",
    "https://forgeapi.puppetlabs.com",
    "https://forgeapi.puppet.com",
    "http://forge.puppetlabs.com",
    "http://forgeapi.puppetlabs.com",
    "http://forge.puppet.com",
    "http://forgeapi.puppet.com",
];

/// Map the legacy forge hostnames onto the canonical one.
pub fn normalize_forge_url(url: &str) -> String {
    let url = url.strip_suffix('/').unwrap_or(url);
    if FORGE_URLS.contains(&url) {
        CANONICAL_FORGE_URL.to_string()
    } else {
        url.to_string()
    }
}

/// HTTP access to a forge.
pub trait ForgeClient: Send + Sync + fmt::Debug {
    fn get_json(&self, url: &str) -> Result<serde_json::Value>;
    fn download(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`ForgeClient`] backed by a blocking reqwest client, built on first use.
#[derive(Debug, Default)]
pub struct HttpForgeClient {
    client: Mutex<Option<Client>>,
}

impl HttpForgeClient {
    fn client(&self) -> Result<Client> {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = client.as_ref() {
            return Ok(client.clone());
        }
        let built = Client::builder()
            .user_agent(concat!("armature/", env!("CARGO_PKG_VERSION")))
            .build()?;
        *client = Some(built.clone());
        Ok(built)
    }
}

impl ForgeClient for HttpForgeClient {
    fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        debug!(url, "GET");
        let response = self
            .client()?
            .get(url)
            .header(ACCEPT, "application/json")
            .send()?
            .error_for_status()?;
        Ok(response.json()?)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "GET");
        let response = self.client()?.get(url).send()?.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Release {
    version: String,
    file_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CurrentRelease {
    version: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ModuleMetadata {
    current_release: CurrentRelease,
    releases: Vec<Release>,
}

/// A module on a forge.
#[derive(Debug)]
pub struct ForgeRepo {
    path: PathBuf,
    url: String,
    forge_url: String,
    full_name: String,
    client: Arc<dyn ForgeClient>,
    fresh: AtomicBool,
    metadata: Mutex<Option<ModuleMetadata>>,
}

impl ForgeRepo {
    /// Get the handle for a module, recording its coordinates in the cache
    /// on first use.
    pub fn from_url(cache: &Cache, forge_url: &str, full_name: &str) -> Result<Arc<dyn Repo>> {
        validate_full_name(full_name)?;
        let forge_url = normalize_forge_url(forge_url);
        let url = format!("{forge_url}/{full_name}");
        if let Some(repo) = cache.get_repo(RepoKind::Forge, &url) {
            return Ok(repo);
        }

        let path = cache.open_repo(RepoKind::Forge, &url, |temp_path| {
            fs::write(temp_path.join("url"), format!("{url}\n"))?;
            fs::write(temp_path.join("forge_url"), format!("{forge_url}\n"))?;
            fs::write(temp_path.join("full_name"), format!("{full_name}\n"))?;
            debug!(url = %url, "created stub repo");
            Ok(())
        })?;

        let repo: Arc<dyn Repo> = Arc::new(Self::open(path, cache.forge_client())?);
        cache.register_repo(Arc::clone(&repo));
        Ok(repo)
    }

    /// Wrap an existing stub repository.
    pub(crate) fn open(path: PathBuf, client: Arc<dyn ForgeClient>) -> Result<Self> {
        let read = |name: &str| -> Result<String> {
            Ok(fs::read_to_string(path.join(name))?.trim_end().to_string())
        };
        Ok(Self {
            url: read("url")?,
            forge_url: read("forge_url")?,
            full_name: read("full_name")?,
            path,
            client,
            fresh: AtomicBool::new(false),
            metadata: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    fn metadata_url(&self) -> String {
        format!("{}/v3/modules/{}", self.forge_url, self.full_name)
    }

    fn download_metadata(&self) -> Result<ModuleMetadata> {
        let url = self.metadata_url();
        info!(url = %url, "downloading metadata");
        let value = self.client.get_json(&url)?;
        let metadata: ModuleMetadata =
            serde_json::from_value(value).map_err(|e| Error::forge_metadata(&url, e.to_string()))?;
        if let Some(release) = metadata.releases.iter().find(|r| !r.file_uri.starts_with('/')) {
            return Err(Error::forge_metadata(
                &url,
                format!("release {} has a file_uri that is not a path", release.version),
            ));
        }

        *self.metadata.lock().unwrap_or_else(PoisonError::into_inner) = Some(metadata.clone());
        self.fresh.store(true, Ordering::SeqCst);
        Ok(metadata)
    }

    fn metadata(&self) -> Result<ModuleMetadata> {
        let cached = self.metadata.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match cached {
            Some(metadata) => Ok(metadata),
            None => self.download_metadata(),
        }
    }

    fn make_ref(&self, kind: RefKind, canonical_name: &str, version: &str) -> Reference {
        Reference::new(
            fsname::repo_id(RepoKind::Forge, &self.url),
            self.url.clone(),
            kind,
            canonical_name,
            version,
            "version",
            canonical_name,
        )
    }

    /// The current release. Fetches metadata once per run.
    pub fn latest_ref(&self) -> Result<Reference> {
        self.freshen()?;
        let version = self.metadata()?.current_release.version;
        Ok(self.make_ref(RefKind::Mutable, "latest", &version))
    }

    /// A pinned release. Its existence is checked at check-out time.
    pub fn version_ref(&self, version: &str) -> Reference {
        self.make_ref(RefKind::Immutable, version, version)
    }

    fn file_uri(&self, version: &str) -> Result<String> {
        self.metadata()?
            .releases
            .into_iter()
            .find(|r| r.version == version)
            .map(|r| r.file_uri)
            .ok_or_else(|| Error::ref_not_found(version, self.url.clone()))
    }
}

/// Forge module names look like `author-name` or `author/name`.
fn validate_full_name(full_name: &str) -> Result<()> {
    let valid = full_name.split(['-', '/']).count() == 2
        && full_name
            .split(['-', '/'])
            .all(|part| {
                !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_name("forge module", full_name, "must look like author-name"))
    }
}

impl Repo for ForgeRepo {
    fn kind(&self) -> RepoKind {
        RepoKind::Forge
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn general_ref(&self, version: &str) -> Result<Reference> {
        if version.is_empty() || version == "latest" {
            self.latest_ref()
        } else {
            validate_ref_str(version)?;
            Ok(self.version_ref(version))
        }
    }

    fn mutable_fs_ref(&self, ref_str: &str) -> Result<Reference> {
        self.general_ref(ref_str)
    }

    fn check_out(&self, cache: &Cache, reference: &Reference) -> Result<PathBuf> {
        cache.open_ref(reference, |object_path| {
            let tarball_url = format!("{}{}", self.forge_url, self.file_uri(&reference.identity)?);
            info!(%reference, url = %tarball_url, "downloading release");
            let tarball = self.client.download(&tarball_url)?;

            cache.with_temp_dir(|temp_path| {
                tar::Archive::new(GzDecoder::new(tarball.as_slice())).unpack(temp_path)?;

                let (_, extract_dir) = visible_entries(temp_path)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        Error::forge_metadata(&tarball_url, "release archive is empty")
                    })?;
                for entry in fs::read_dir(&extract_dir)? {
                    let entry = entry?;
                    fs::rename(entry.path(), object_path.join(entry.file_name()))?;
                }
                Ok(())
            })
        })
    }

    fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::SeqCst)
    }

    fn freshen_now(&self) -> Result<()> {
        self.flush_memory();
        self.download_metadata().map(|_| ())
    }

    fn flush_memory(&self) {
        self.fresh.store(false, Ordering::SeqCst);
        *self.metadata.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
