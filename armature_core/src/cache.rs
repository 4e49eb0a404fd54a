//! The on-disk cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! lock                                  cache-wide lock file
//! repo/<repo-id>                        repository mirrors
//! ref/{mutable,immutable,identity}/<repo-id>/<name>
//!                                       symlinks into the object store
//! object/<ts>.<pid>.<seq>[.<hint>]      materialized trees
//! tmp/                                  staging and trash
//! ```
//!
//! Identity symlinks point at objects; mutable and immutable symlinks point
//! at identity symlinks. Two references that resolve to the same identity
//! therefore share one object.

use crate::error::{Error, Result};
use crate::fsname;
use crate::lock::{self, LockMode};
use crate::reference::{RefKind, Reference};
use crate::repo::{ForgeClient, ForgeRepo, GitRepo, HttpForgeClient, Repo, RepoKind};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use tracing::{debug, error, info};

const SUBDIRS: [&str; 6] = [
    "repo",
    "ref/mutable",
    "ref/immutable",
    "ref/identity",
    "object",
    "tmp",
];

/// Directory that collects paths to delete once the cache lock is released.
#[derive(Debug)]
struct Trash {
    path: PathBuf,
    next: u64,
}

/// Handle to an on-disk cache.
///
/// Holds the repository registry for the current run; resolutions
/// memoized by the registered repositories last until
/// [`flush_memory`](Cache::flush_memory).
#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
    process_prefix: String,
    sequence: AtomicU64,
    repos: Mutex<HashMap<String, Arc<dyn Repo>>>,
    lock_holders: Mutex<HashSet<ThreadId>>,
    trash: Mutex<Option<Trash>>,
    forge_client: Arc<dyn ForgeClient>,
}

impl Cache {
    /// Open a cache, creating its layout if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::with_forge_client(root, Arc::new(HttpForgeClient::default()))
    }

    /// Open a cache that talks to forges through `forge_client`.
    pub fn with_forge_client<P: AsRef<Path>>(
        root: P,
        forge_client: Arc<dyn ForgeClient>,
    ) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        for dir in SUBDIRS {
            fs::create_dir_all(root.join(dir))?;
        }

        let process_prefix = format!("{}.{}", Utc::now().timestamp_micros(), std::process::id());
        debug!(root = %root.display(), prefix = %process_prefix, "opened cache");

        Ok(Self {
            root,
            process_prefix,
            sequence: AtomicU64::new(0),
            repos: Mutex::new(HashMap::new()),
            lock_holders: Mutex::new(HashSet::new()),
            trash: Mutex::new(None),
            forge_client,
        })
    }

    /// Canonical cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn forge_client(&self) -> Arc<dyn ForgeClient> {
        Arc::clone(&self.forge_client)
    }

    pub(crate) fn repos_dir(&self) -> PathBuf {
        self.root.join("repo")
    }

    pub(crate) fn repo_path(&self, repo_id: &str) -> PathBuf {
        self.repos_dir().join(repo_id)
    }

    pub(crate) fn ref_kind_dir(&self, kind: RefKind) -> PathBuf {
        self.root.join("ref").join(kind.as_str())
    }

    pub(crate) fn ref_dir(&self, kind: RefKind, repo_id: &str) -> PathBuf {
        self.ref_kind_dir(kind).join(repo_id)
    }

    pub(crate) fn object_dir(&self) -> PathBuf {
        self.root.join("object")
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn next_name(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}.{}", self.process_prefix, seq)
    }

    /// A fresh path under `tmp/`. Nothing is created.
    pub fn new_temp_path(&self) -> PathBuf {
        self.tmp_dir().join(self.next_name())
    }

    /// A fresh path under `object/`, optionally tagged with a readable hint.
    pub fn new_object_path(&self, hint: Option<&str>) -> PathBuf {
        let mut name = self.next_name();
        if let Some(hint) = hint.filter(|h| !h.is_empty()) {
            name.push('.');
            name.push_str(&hint.replace('/', " "));
        }
        self.object_dir().join(name)
    }

    /// Run `f` with a temporary directory under `tmp/` that is removed
    /// afterwards.
    pub fn with_temp_dir<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        self.with_shared_lock(|| {
            let dir = tempfile::Builder::new()
                .prefix(&format!("{}.", self.next_name()))
                .tempdir_in(self.tmp_dir())?;
            f(dir.path())
        })
    }

    /// Hold the cache-wide lock for the duration of `f`.
    ///
    /// Other threads may lock through the same handle. Acquiring it again
    /// on the thread that holds it fails with `Error::LockReentry` instead
    /// of deadlocking.
    pub fn lock<T, F>(&self, mode: LockMode, message: Option<&str>, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let lock_file = self.root.join("lock");
        let thread = thread::current().id();
        if !self.holders().insert(thread) {
            return Err(Error::LockReentry { path: lock_file });
        }
        let _held = Holder {
            cache: self,
            thread,
        };
        lock::with_lock_file(&lock_file, mode, message, f)
    }

    fn holders(&self) -> std::sync::MutexGuard<'_, HashSet<ThreadId>> {
        self.lock_holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if the current thread holds the cache lock.
    pub fn holds_lock(&self) -> bool {
        self.holders().contains(&thread::current().id())
    }

    /// Run `f` under the shared cache lock, unless this thread already
    /// holds the cache lock. Staging paths are only created this way, so
    /// garbage collection never sweeps one that is in use.
    fn with_shared_lock<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if self.holds_lock() {
            f()
        } else {
            self.lock(LockMode::Shared, None, f)
        }
    }

    /// Return the mirror directory for a repository, creating it with
    /// `create` on first use.
    ///
    /// `create` populates an empty staging directory which is then renamed
    /// into place, so a mirror is either complete or absent.
    pub fn open_repo<F>(&self, kind: RepoKind, url: &str, create: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let repo_path = self.repo_path(&fsname::repo_id(kind, url));
        if repo_path.is_dir() {
            return Ok(repo_path);
        }

        debug!(kind = kind.as_str(), url, "creating repo");
        self.with_shared_lock(|| {
            lock::with_lock(&repo_path, LockMode::Exclusive, Some("create"), || {
                if repo_path.is_dir() {
                    debug!(url, "repo created by another process");
                    return Ok(());
                }

                let temp_path = self.new_temp_path();
                fs::create_dir(&temp_path)?;
                if let Err(err) = create(&temp_path) {
                    let _ = fs::remove_dir_all(&temp_path);
                    return Err(err);
                }
                fs::rename(&temp_path, &repo_path)?;
                debug!(url, path = %repo_path.display(), "created repo");
                Ok(())
            })
        })?;

        Ok(repo_path)
    }

    /// Make sure a reference is materialized and its reference cache entry
    /// points at the right identity. Returns the reference cache path.
    ///
    /// `materialize` fills an empty object directory. It runs at most once
    /// per identity, however many references resolve to it.
    pub fn open_ref<F>(&self, reference: &Reference, materialize: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if reference.canonical_name.is_empty() || reference.identity.is_empty() {
            return Err(Error::invalid_name(
                "ref",
                reference.canonical_name.clone(),
                "resolved to an empty name or identity",
            ));
        }

        let ref_dir = self.ref_dir(reference.kind, &reference.repo_id);
        let ref_path = ref_dir.join(fsname::sanitize(&reference.canonical_name));

        self.with_shared_lock(|| {
            fs::create_dir_all(&ref_dir)?;
            let identity_path = self.open_identity(reference, materialize)?;
            if identity_path != ref_path {
                self.atomic_symlink(&identity_path, &ref_path)?;
            }
            Ok(ref_path)
        })
    }

    /// Path of the identity entry a reference resolves to. Unlike a
    /// mutable reference entry it never changes target once created.
    pub fn identity_path(&self, reference: &Reference) -> PathBuf {
        self.ref_dir(RefKind::Identity, &reference.repo_id)
            .join(fsname::sanitize(&reference.identity))
    }

    fn open_identity<F>(&self, reference: &Reference, materialize: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let identity_path = self.identity_path(reference);
        if identity_path.is_dir() {
            return Ok(identity_path);
        }

        fs::create_dir_all(self.ref_dir(RefKind::Identity, &reference.repo_id))?;
        lock::with_lock(&identity_path, LockMode::Exclusive, Some("check out"), || {
            if identity_path.is_dir() {
                debug!(identity = %reference.identity, "checked out by another process");
                return Ok(());
            }

            let object_path = self.new_object_path(Some(&reference.identity));
            fs::create_dir(&object_path)?;
            debug!(
                url = %reference.repo_url,
                identity = %reference.identity,
                object = %object_path.display(),
                "checking out"
            );
            materialize(&object_path)?;
            self.atomic_symlink(&object_path, &identity_path)
        })?;

        debug!(url = %reference.repo_url, identity = %reference.identity, "finished checking out");
        Ok(identity_path)
    }

    /// Point `link` at `target`, replacing any existing link atomically.
    ///
    /// Does nothing if `link` already points at `target`. A trailing `/` on
    /// `link` is ignored so the link itself is replaced rather than its
    /// target.
    pub fn atomic_symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let link: PathBuf = link.components().collect();
        if let Ok(existing) = fs::read_link(&link)
            && existing == target
        {
            return Ok(());
        }

        let name = link
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::invalid_name("link", link.display().to_string(), "has no file name")
            })?;
        let parent = link.parent().unwrap_or(Path::new("."));
        let temp_path = parent.join(format!(".{}.{}.tmp", name, self.next_name()));

        debug!(link = %link.display(), target = %target.display(), "symlink");
        std::os::unix::fs::symlink(target, &temp_path)?;
        if let Err(err) = fs::rename(&temp_path, &link) {
            error!(link = %link.display(), error = %err, "could not replace symlink");
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(())
    }

    /// Add a repository handle to this run's registry.
    pub fn register_repo(&self, repo: Arc<dyn Repo>) {
        let id = repo.id();
        self.repos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, repo);
    }

    /// Look up a registered repository handle.
    pub fn get_repo(&self, kind: RepoKind, url: &str) -> Option<Arc<dyn Repo>> {
        self.registered(&fsname::repo_id(kind, url))
    }

    fn registered(&self, id: &str) -> Option<Arc<dyn Repo>> {
        self.repos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub(crate) fn unregister_repo(&self, id: &str) {
        self.repos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Get the handle for a repository already mirrored in the cache.
    pub fn repo_by_id(&self, id: &str) -> Result<Arc<dyn Repo>> {
        if let Some(repo) = self.registered(id) {
            return Ok(repo);
        }

        let (kind, url) = fsname::parse_repo_id(id)?;
        let path = self.repo_path(id);
        let repo: Arc<dyn Repo> = match kind {
            RepoKind::Git => Arc::new(GitRepo::open(path, &url, false)),
            RepoKind::Forge => Arc::new(ForgeRepo::open(path, self.forge_client())?),
        };
        self.register_repo(Arc::clone(&repo));
        Ok(repo)
    }

    /// Clear memoized resolutions in every registered repository.
    pub fn flush_memory(&self) {
        let repos: Vec<_> = self
            .repos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for repo in repos {
            repo.flush_memory();
        }
    }

    /// Re-resolve every mutable reference in the cache and materialize any
    /// new identities. References that no longer exist upstream are skipped.
    ///
    /// Returns the number of references brought up to date.
    pub fn update_mutable_refs(&self) -> Result<usize> {
        self.lock(LockMode::Shared, None, || {
            let mut updated = 0;
            for (repo_id, repo_dir) in visible_entries(&self.ref_kind_dir(RefKind::Mutable))? {
                let repo = self.repo_by_id(&repo_id)?;
                for (name, _) in visible_entries(&repo_dir)? {
                    let ref_str = fsname::unsanitize(&name);
                    let result = repo.mutable_fs_ref(&ref_str).and_then(|reference| {
                        info!(%reference, url = repo.url(), "updating");
                        repo.check_out(self, &reference)
                    });
                    match result {
                        Ok(_) => updated += 1,
                        Err(err) if err.is_ref_not_found() => {
                            info!(
                                ref_str = %ref_str,
                                url = repo.url(),
                                "ref no longer exists; skipping"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Ok(updated)
        })
    }

    /// Move a path into this run's trash directory.
    pub(crate) fn trash(&self, path: &Path) -> Result<()> {
        let mut trash = self.trash.lock().unwrap_or_else(PoisonError::into_inner);
        let usable = trash.as_ref().is_some_and(|t| t.path.is_dir());
        if !usable {
            let trash_path = self.new_temp_path();
            fs::create_dir(&trash_path)?;
            *trash = Some(Trash {
                path: trash_path,
                next: 1,
            });
        }

        if let Some(trash) = trash.as_mut() {
            let dest = trash.path.join(trash.next.to_string());
            trash.next += 1;
            debug!(path = %path.display(), trash = %dest.display(), "trashing");
            fs::rename(path, dest)?;
        }
        Ok(())
    }

    /// Path of this run's trash directory, if one was created.
    pub(crate) fn trash_path(&self) -> Option<PathBuf> {
        self.trash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|trash| trash.path.clone())
    }

    /// Delete the trash directory, if any.
    ///
    /// Runs outside the cache lock, so another collector may have swept
    /// the directory away already.
    pub(crate) fn empty_trash(&self) -> Result<()> {
        let trash = self.trash.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(trash) = trash {
            info!(path = %trash.path.display(), "emptying trash");
            match fs::remove_dir_all(&trash.path) {
                Ok(()) => debug!("trash emptied"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!("trash already gone");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Releases the current thread's claim on the cache lock.
struct Holder<'a> {
    cache: &'a Cache,
    thread: ThreadId,
}

impl Drop for Holder<'_> {
    fn drop(&mut self) {
        self.cache.holders().remove(&self.thread);
    }
}

/// Entries of `dir` whose names do not start with `.`, sorted by name.
/// A missing directory has no entries.
pub(crate) fn visible_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            entries.push((name, entry.path()));
        }
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use tempfile::TempDir;

    fn reference(repo_id: &str, kind: RefKind, name: &str, identity: &str) -> Reference {
        Reference::new(repo_id, "/srv/test", kind, name, identity, "ref", name)
    }

    fn write_marker(path: &Path, identity: &str) -> Result<()> {
        fs::write(path.join("identity"), identity)?;
        Ok(())
    }

    #[test]
    fn test_open_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path().join("cache")).unwrap();

        for dir in SUBDIRS {
            assert!(cache.root().join(dir).is_dir(), "missing {dir}");
        }
        assert!(cache.root().is_absolute());
    }

    #[test]
    fn test_new_paths_are_unique() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();

        let a = cache.new_temp_path();
        let b = cache.new_temp_path();
        assert_ne!(a, b);
        assert_eq!(a.parent().unwrap(), cache.tmp_dir());

        let object = cache.new_object_path(Some("refs/heads/master"));
        let name = object.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(".refs heads master"));
        assert_eq!(object.parent().unwrap(), cache.object_dir());
    }

    #[test]
    fn test_atomic_symlink_creates_and_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path().join("cache")).unwrap();
        let link = temp_dir.path().join("link");

        cache.atomic_symlink(Path::new("/first"), &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("/first"));

        cache.atomic_symlink(Path::new("/second"), &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("/second"));

        // Trailing slash addresses the link, not what it points at.
        let with_slash = PathBuf::from(format!("{}/", link.display()));
        cache.atomic_symlink(Path::new("/third"), &with_slash).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("/third"));

        // No temporary links left behind.
        let names: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }

    #[test]
    fn test_atomic_symlink_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path().join("cache")).unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir(&target).unwrap();
        let link = temp_dir.path().join("link");

        cache.atomic_symlink(&target, &link).unwrap();
        let before = fs::symlink_metadata(&link).unwrap().modified().unwrap();
        let seq_before = cache.sequence.load(Ordering::SeqCst);
        cache.atomic_symlink(&target, &link).unwrap();
        let after = fs::symlink_metadata(&link).unwrap().modified().unwrap();

        assert_eq!(before, after);
        assert_eq!(seq_before, cache.sequence.load(Ordering::SeqCst));
    }

    #[test]
    fn test_open_repo_creates_once() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();
        let calls = AtomicUsize::new(0);

        let create = |path: &Path| {
            calls.fetch_add(1, Ordering::SeqCst);
            fs::write(path.join("url"), "/srv/x")?;
            Ok(())
        };
        let first = cache.open_repo(RepoKind::Git, "/srv/x", create).unwrap();
        let second = cache.open_repo(RepoKind::Git, "/srv/x", create).unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.file_name().unwrap(), "git:|srv|x");
        assert!(first.join("url").is_file());
        assert!(visible_entries(&cache.tmp_dir()).unwrap().is_empty());
    }

    #[test]
    fn test_open_repo_failure_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();

        let result = cache.open_repo(RepoKind::Git, "/srv/broken", |_| {
            Err(Error::command_failed(128, "git clone", "fatal: no such repo"))
        });
        assert!(result.is_err());
        assert!(!cache.repo_path(&fsname::repo_id(RepoKind::Git, "/srv/broken")).exists());
        assert!(visible_entries(&cache.tmp_dir()).unwrap().is_empty());
    }

    #[test]
    fn test_open_ref_shares_identity() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();
        let calls = AtomicUsize::new(0);
        let materialize = |path: &Path| {
            calls.fetch_add(1, Ordering::SeqCst);
            write_marker(path, "abc123")
        };

        let branch = reference("git:x", RefKind::Mutable, "refs/heads/master", "abc123");
        let tag = reference("git:x", RefKind::Immutable, "refs/tags/v1", "abc123");
        let identity = reference("git:x", RefKind::Identity, "abc123", "abc123");

        let branch_path = cache.open_ref(&branch, materialize).unwrap();
        let tag_path = cache.open_ref(&tag, materialize).unwrap();
        let identity_path = cache.open_ref(&identity, materialize).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(branch_path, cache.ref_dir(RefKind::Mutable, "git:x").join("refs|heads|master"));
        assert_eq!(identity_path, cache.ref_dir(RefKind::Identity, "git:x").join("abc123"));
        assert_eq!(fs::read_link(&branch_path).unwrap(), identity_path);
        assert_eq!(fs::read_link(&tag_path).unwrap(), identity_path);
        assert_eq!(
            fs::canonicalize(&branch_path).unwrap(),
            fs::canonicalize(&tag_path).unwrap()
        );
        assert_eq!(fs::read_to_string(branch_path.join("identity")).unwrap(), "abc123");
        assert_eq!(visible_entries(&cache.object_dir()).unwrap().len(), 1);
    }

    #[test]
    fn test_open_ref_moves_mutable_ref() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();

        let old = reference("git:x", RefKind::Mutable, "refs/heads/master", "aaa");
        let new = reference("git:x", RefKind::Mutable, "refs/heads/master", "bbb");
        let path = cache.open_ref(&old, |p| write_marker(p, "aaa")).unwrap();
        cache.open_ref(&new, |p| write_marker(p, "bbb")).unwrap();

        assert_eq!(fs::read_to_string(path.join("identity")).unwrap(), "bbb");
        assert_eq!(visible_entries(&cache.object_dir()).unwrap().len(), 2);
    }

    #[test]
    fn test_open_ref_concurrent_checkouts_dedup() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        Cache::open(&root).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let root = root.clone();
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    let cache = Cache::open(&root).unwrap();
                    let name = format!("refs/heads/b{i}");
                    let r = reference("git:x", RefKind::Mutable, &name, "shared");
                    cache
                        .open_ref(&r, |p| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(50));
                            write_marker(p, "shared")
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            let path = handle.join().unwrap();
            assert_eq!(fs::read_to_string(path.join("identity")).unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_ref_failed_materialize_is_retried() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();
        let r = reference("git:x", RefKind::Identity, "abc", "abc");

        let result = cache.open_ref(&r, |_| Err(Error::command_failed(1, "git read-tree", "")));
        assert!(result.is_err());
        assert!(!cache.ref_dir(RefKind::Identity, "git:x").join("abc").exists());

        cache.open_ref(&r, |p| write_marker(p, "abc")).unwrap();
        assert!(cache.ref_dir(RefKind::Identity, "git:x").join("abc").is_dir());
    }

    #[test]
    fn test_lock_reentry_fails() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();

        let result = cache.lock(LockMode::Shared, None, || {
            cache.lock(LockMode::Exclusive, Some("inner"), || Ok(()))
        });
        assert!(matches!(result, Err(Error::LockReentry { .. })));

        // Released after the outer call returns.
        cache.lock(LockMode::Exclusive, Some("again"), || Ok(())).unwrap();
        assert!(cache.root().join("lock").is_file());
    }

    #[test]
    fn test_lock_shared_between_threads_of_one_handle() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();
        let barrier = std::sync::Barrier::new(2);

        thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        cache.lock(LockMode::Shared, None, || {
                            assert!(cache.holds_lock());
                            // Both threads are inside the lock at once.
                            barrier.wait();
                            Ok(())
                        })
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap().unwrap();
            }
        });
        assert!(!cache.holds_lock());
    }

    #[test]
    fn test_staging_holds_shared_lock() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();

        cache
            .open_repo(RepoKind::Git, "/srv/x", |_| {
                assert!(cache.holds_lock());
                Ok(())
            })
            .unwrap();
        cache
            .with_temp_dir(|_| {
                assert!(cache.holds_lock());
                Ok(())
            })
            .unwrap();

        // Already held: no re-entry error.
        cache
            .lock(LockMode::Shared, None, || {
                cache.with_temp_dir(|_| Ok(()))?;
                cache.open_repo(RepoKind::Git, "/srv/y", |_| Ok(()))
            })
            .unwrap();
        assert!(!cache.holds_lock());
    }

    #[test]
    fn test_with_temp_dir_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();

        let inner = cache
            .with_temp_dir(|dir| {
                fs::write(dir.join("file"), "x")?;
                Ok(dir.to_path_buf())
            })
            .unwrap();
        assert!(inner.starts_with(cache.tmp_dir()));
        assert!(!inner.exists());
    }

    #[test]
    fn test_trash_and_empty() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();
        let a = cache.new_object_path(None);
        let b = cache.new_object_path(None);
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();

        cache.trash(&a).unwrap();
        cache.trash(&b).unwrap();
        assert!(!a.exists());
        assert!(!b.exists());
        assert_eq!(visible_entries(&cache.tmp_dir()).unwrap().len(), 1);

        cache.empty_trash().unwrap();
        assert!(visible_entries(&cache.tmp_dir()).unwrap().is_empty());
        cache.empty_trash().unwrap();
    }

    #[test]
    fn test_visible_entries() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("b"), "").unwrap();
        fs::write(temp_dir.path().join("a"), "").unwrap();
        fs::write(temp_dir.path().join(".a.lock"), "").unwrap();

        let names: Vec<_> = visible_entries(temp_dir.path())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(visible_entries(&temp_dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_repo_by_id_rejects_unknown_kind() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Cache::open(temp_dir.path()).unwrap();

        assert!(matches!(
            cache.repo_by_id("svn:|srv|x"),
            Err(Error::UnknownRepoKind { .. })
        ));
    }
}
