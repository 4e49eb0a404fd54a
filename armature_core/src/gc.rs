//! Garbage collection.
//!
//! Mark and sweep rooted at the published environments: everything an
//! environment reaches through symlinks, directly or through its
//! `modules/` links, is kept. Unreached references are deleted; unreached
//! objects and unused repositories are moved to the trash and deleted once
//! the cache lock is released.
//!
//! Before marking, leftovers of interrupted runs are cleared: lock files,
//! staging and scratch directories under `tmp/`, and half-swapped
//! temporary symlinks in reference directories.

use crate::cache::{Cache, visible_entries};
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::reference::RefKind;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Longest symlink chain followed before giving up.
pub const MAX_SYMLINK_DEPTH: usize = 6;

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Stale `.name.lock` files deleted.
    pub locks_removed: usize,
    /// Leftover temporary paths removed.
    pub temps_removed: usize,
    /// Reference cache entries deleted.
    pub refs_deleted: usize,
    /// Object store entries trashed.
    pub objects_trashed: usize,
    /// Repository mirrors trashed.
    pub repos_trashed: usize,
}

impl Cache {
    /// Run garbage collection against the environments in
    /// `environments_path`.
    ///
    /// Holds the cache lock exclusively, so no deploy is in flight while
    /// the object graph is examined. If `dry_run` is true, reports what
    /// would be removed without removing anything.
    pub fn garbage_collect(&self, environments_path: &Path, dry_run: bool) -> Result<GcStats> {
        if !environments_path.is_dir() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("environments path does not exist: {}", environments_path.display()),
            )
            .into());
        }

        let message = format!("garbage_collect {}", environments_path.display());
        let result = self.lock(LockMode::Exclusive, Some(&message), || {
            let mut stats = GcStats::default();
            if !dry_run {
                stats.locks_removed = self.remove_stale_locks()?;
                stats.temps_removed = self.remove_stale_temps()?;
            }

            // Mark phase
            let referenced = self.find_all_references(environments_path)?;

            // Sweep phase
            stats.refs_deleted = self.collect_refs(&referenced, dry_run)?;
            stats.objects_trashed = self.collect_objects(&referenced, dry_run)?;
            stats.repos_trashed = self.collect_repos(&referenced, dry_run)?;
            Ok(stats)
        });

        // Trash is emptied outside the cache lock.
        let emptied = self.empty_trash();
        let stats = result?;
        emptied?;

        info!(
            dry_run,
            locks = stats.locks_removed,
            temps = stats.temps_removed,
            refs = stats.refs_deleted,
            objects = stats.objects_trashed,
            repos = stats.repos_trashed,
            "garbage collection done"
        );
        Ok(stats)
    }

    /// Lock files are only meaningful while held. Nobody holds one while we
    /// hold the cache lock exclusively.
    fn remove_stale_locks(&self) -> Result<usize> {
        let mut dirs = vec![self.repos_dir(), self.object_dir(), self.tmp_dir()];
        for kind in RefKind::ALL {
            dirs.extend(
                visible_entries(&self.ref_kind_dir(kind))?
                    .into_iter()
                    .map(|(_, path)| path),
            );
        }

        let mut removed = 0;
        for dir in dirs {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.')
                    && name.ends_with(".lock")
                    && entry.file_type()?.is_file()
                {
                    debug!(path = %entry.path().display(), "removing lock file");
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Everything under `tmp/` and every `.name.*.tmp` symlink in reference
    /// directories. Those are only created under the cache lock, which we
    /// hold exclusively.
    fn remove_stale_temps(&self) -> Result<usize> {
        let current_trash = self.trash_path();
        let mut stale = Vec::new();
        for entry in fs::read_dir(self.tmp_dir())? {
            let path = entry?.path();
            if current_trash.as_ref() != Some(&path) {
                stale.push(path);
            }
        }

        let mut removed = stale.len();
        for path in stale {
            debug!(path = %path.display(), "trashing stale temporary path");
            self.trash(&path)?;
        }

        for kind in RefKind::ALL {
            for (_, repo_dir) in visible_entries(&self.ref_kind_dir(kind))? {
                for entry in fs::read_dir(&repo_dir)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.')
                        && name.ends_with(".tmp")
                        && entry.file_type()?.is_symlink()
                    {
                        debug!(path = %entry.path().display(), "removing stale symlink");
                        fs::remove_file(entry.path())?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Every path reachable from the environments: the environment
    /// targets, their module targets, and every link in between.
    pub fn find_all_references(&self, environments_path: &Path) -> Result<HashSet<PathBuf>> {
        let mut referenced = HashSet::new();
        let mut scanned = HashSet::new();

        let environments = visible_entries(environments_path)?;
        debug!(count = environments.len(), "looking for references in environments");

        for (name, environment_path) in environments {
            let object_path = match self.follow_reference(&environment_path, &mut referenced)? {
                Some(object_path) => object_path,
                // Reached something already marked; its modules may not be.
                None => match fs::canonicalize(&environment_path) {
                    Ok(object_path) => object_path,
                    Err(_) => continue,
                },
            };
            if !scanned.insert(object_path.clone()) {
                continue;
            }

            let modules = visible_entries(&object_path.join("modules"))?;
            debug!(environment = %name, count = modules.len(), "following module references");
            for (_, module_path) in modules {
                self.follow_reference(&module_path, &mut referenced)?;
            }
        }

        Ok(referenced)
    }

    /// Follow the symlink at `path` to its final target, adding every path
    /// visited to `referenced`.
    ///
    /// Returns the final target, or `None` if the chain ran into a path
    /// that was already marked.
    pub fn follow_reference(
        &self,
        path: &Path,
        referenced: &mut HashSet<PathBuf>,
    ) -> Result<Option<PathBuf>> {
        let mut visited: Vec<PathBuf> = Vec::new();
        let mut current = path.to_path_buf();

        loop {
            let target = read_link_target(&current)?;
            if referenced.contains(&target) {
                debug!(link = %current.display(), target = %target.display(), "already marked");
                referenced.extend(visited);
                return Ok(None);
            }

            debug!(link = %current.display(), target = %target.display(), "following");
            visited.push(target.clone());

            match fs::symlink_metadata(&target) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    if visited.len() >= MAX_SYMLINK_DEPTH {
                        return Err(Error::SymlinkTooDeep {
                            max: MAX_SYMLINK_DEPTH,
                            chain: visited,
                        });
                    }
                    current = target;
                    continue;
                }
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => error!(path = %target.display(), "reference is not a directory"),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    warn!(path = %target.display(), "reference does not exist");
                }
                Err(err) => {
                    warn!(path = %target.display(), error = %err, "could not read reference")
                }
            }

            referenced.extend(visited);
            return Ok(Some(target));
        }
    }

    fn collect_refs(&self, referenced: &HashSet<PathBuf>, dry_run: bool) -> Result<usize> {
        let mut deleted = 0;
        for kind in RefKind::ALL {
            for (_, repo_dir) in visible_entries(&self.ref_kind_dir(kind))? {
                for (_, ref_path) in visible_entries(&repo_dir)? {
                    if !referenced.contains(&ref_path) {
                        debug!(path = %ref_path.display(), "deleting unreferenced ref");
                        if !dry_run {
                            fs::remove_file(&ref_path)?;
                        }
                        deleted += 1;
                    }
                }
            }
        }
        Ok(deleted)
    }

    fn collect_objects(&self, referenced: &HashSet<PathBuf>, dry_run: bool) -> Result<usize> {
        let mut trashed = 0;
        for (_, object_path) in visible_entries(&self.object_dir())? {
            if !referenced.contains(&object_path) {
                debug!(path = %object_path.display(), "trashing unreferenced object");
                if !dry_run {
                    self.trash(&object_path)?;
                }
                trashed += 1;
            }
        }
        Ok(trashed)
    }

    /// A repository is used while any of its references survive.
    fn collect_repos(&self, referenced: &HashSet<PathBuf>, dry_run: bool) -> Result<usize> {
        let mut used = HashSet::new();
        for kind in RefKind::ALL {
            for (repo_id, repo_dir) in visible_entries(&self.ref_kind_dir(kind))? {
                let live = visible_entries(&repo_dir)?
                    .iter()
                    .any(|(_, ref_path)| referenced.contains(ref_path));
                if live {
                    used.insert(repo_id);
                } else if !dry_run {
                    self.trash(&repo_dir)?;
                }
            }
        }

        let mut trashed = 0;
        for (repo_id, repo_path) in visible_entries(&self.repos_dir())? {
            if !used.contains(&repo_id) {
                debug!(path = %repo_path.display(), "trashing unused repo");
                if !dry_run {
                    self.unregister_repo(&repo_id);
                    self.trash(&repo_path)?;
                }
                trashed += 1;
            }
        }
        Ok(trashed)
    }
}

/// Read a symlink and resolve its target against the link's directory.
fn read_link_target(path: &Path) -> Result<PathBuf> {
    if !fs::symlink_metadata(path)?.file_type().is_symlink() {
        return Err(Error::NotSymlink {
            path: path.to_path_buf(),
        });
    }

    let target = fs::read_link(path)?;
    let joined = if target.is_absolute() {
        target
    } else {
        path.parent().unwrap_or(Path::new("")).join(target)
    };
    Ok(clean_path(&joined))
}

/// Remove `.` and `..` components without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::Reference;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        cache: Cache,
        environments: PathBuf,
    }

    fn setup() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let environments = temp_dir.path().join("environments");
        fs::create_dir(&environments).unwrap();
        let cache = Cache::open(temp_dir.path().join("cache")).unwrap();
        Fixture {
            _temp_dir: temp_dir,
            cache,
            environments,
        }
    }

    /// Check out a fake reference and return (ref path, identity path).
    fn check_out(
        cache: &Cache,
        repo_id: &str,
        kind: RefKind,
        name: &str,
        identity: &str,
    ) -> (PathBuf, PathBuf) {
        let reference = Reference::new(repo_id, "/srv/x", kind, name, identity, "ref", name);
        let ref_path = cache
            .open_ref(&reference, |path| {
                fs::create_dir(path.join("modules"))?;
                fs::write(path.join("identity"), identity)?;
                Ok(())
            })
            .unwrap();
        (ref_path, cache.identity_path(&reference))
    }

    fn objects(cache: &Cache) -> usize {
        visible_entries(&cache.object_dir()).unwrap().len()
    }

    #[test]
    fn test_gc_empty_cache() {
        let fixture = setup();
        let stats = fixture.cache.garbage_collect(&fixture.environments, false).unwrap();
        assert_eq!(stats, GcStats::default());
    }

    #[test]
    fn test_gc_missing_environments_dir() {
        let fixture = setup();
        let missing = fixture.environments.join("nope");
        assert!(fixture.cache.garbage_collect(&missing, false).is_err());
    }

    #[test]
    fn test_gc_keeps_reachable_and_removes_the_rest() {
        let fixture = setup();
        let cache = &fixture.cache;
        let master = "refs/heads/master";
        let (_, control_identity) = check_out(cache, "git:control", RefKind::Mutable, master, "c1");
        let (module_ref, _) = check_out(cache, "git:module", RefKind::Mutable, master, "m1");
        check_out(cache, "git:orphan", RefKind::Immutable, "refs/tags/v1", "o1");
        fs::create_dir(cache.repo_path("git:control")).unwrap();
        fs::create_dir(cache.repo_path("git:module")).unwrap();
        fs::create_dir(cache.repo_path("git:orphan")).unwrap();

        symlink(&module_ref, control_identity.join("modules").join("module")).unwrap();
        symlink(&control_identity, fixture.environments.join("production")).unwrap();
        assert_eq!(objects(cache), 3);

        let stats = cache.garbage_collect(&fixture.environments, false).unwrap();

        assert_eq!(objects(cache), 2);
        assert_eq!(stats.objects_trashed, 1);
        assert_eq!(stats.repos_trashed, 1);
        // orphan tag + orphan identity + control branch ref
        assert_eq!(stats.refs_deleted, 3);

        let production = fixture.environments.join("production");
        assert_eq!(fs::read_to_string(production.join("identity")).unwrap(), "c1");
        assert_eq!(
            fs::read_to_string(production.join("modules/module/identity")).unwrap(),
            "m1"
        );
        assert!(cache.repo_path("git:module").is_dir());
        assert!(!cache.repo_path("git:orphan").exists());
        assert!(!cache.ref_dir(RefKind::Immutable, "git:orphan").exists());
        assert!(visible_entries(&cache.tmp_dir()).unwrap().is_empty());
    }

    #[test]
    fn test_gc_converging_environments() {
        let fixture = setup();
        let cache = &fixture.cache;
        let (branch, identity) =
            check_out(cache, "git:control", RefKind::Mutable, "refs/heads/a", "same");
        let (tag, _) = check_out(cache, "git:control", RefKind::Immutable, "refs/tags/v1", "same");
        symlink(&branch, fixture.environments.join("a")).unwrap();
        symlink(&tag, fixture.environments.join("b")).unwrap();
        symlink(&identity, fixture.environments.join("c")).unwrap();

        let stats = cache.garbage_collect(&fixture.environments, false).unwrap();
        assert_eq!(stats.objects_trashed, 0);
        assert_eq!(stats.refs_deleted, 0);
        assert_eq!(objects(cache), 1);

        let referenced = cache.find_all_references(&fixture.environments).unwrap();
        assert!(referenced.contains(&branch));
        assert!(referenced.contains(&tag));
        assert!(referenced.contains(&identity));
    }

    #[test]
    fn test_gc_dry_run_changes_nothing() {
        let fixture = setup();
        let cache = &fixture.cache;
        check_out(cache, "git:orphan", RefKind::Mutable, "refs/heads/master", "o1");
        fs::create_dir(cache.repo_path("git:orphan")).unwrap();

        let stats = cache.garbage_collect(&fixture.environments, true).unwrap();
        assert_eq!(stats.objects_trashed, 1);
        assert_eq!(stats.refs_deleted, 2);
        assert_eq!(stats.repos_trashed, 1);
        assert_eq!(objects(cache), 1);
        assert!(cache.repo_path("git:orphan").is_dir());

        let stats = cache.garbage_collect(&fixture.environments, false).unwrap();
        assert_eq!(stats.objects_trashed, 1);
        assert_eq!(objects(cache), 0);
    }

    #[test]
    fn test_gc_removes_stale_locks() {
        let fixture = setup();
        let cache = &fixture.cache;
        fs::write(cache.repo_path(".git:x.lock"), "").unwrap();
        fs::write(cache.object_dir().join(".thing.lock"), "").unwrap();
        fs::create_dir_all(cache.ref_dir(RefKind::Identity, "git:x")).unwrap();
        fs::write(cache.ref_dir(RefKind::Identity, "git:x").join(".abc.lock"), "").unwrap();

        let stats = cache.garbage_collect(&fixture.environments, false).unwrap();
        assert_eq!(stats.locks_removed, 3);
        assert!(cache.root().join("lock").is_file());
    }

    #[test]
    fn test_gc_removes_leftovers_of_interrupted_runs() {
        let fixture = setup();
        let cache = &fixture.cache;
        let (branch, identity) =
            check_out(cache, "git:control", RefKind::Mutable, "refs/heads/master", "c1");
        fs::create_dir(cache.repo_path("git:control")).unwrap();
        symlink(&branch, fixture.environments.join("production")).unwrap();

        // A clone staging directory, a scratch file and a symlink swap, all
        // abandoned by a process that died.
        let staging = cache.new_temp_path();
        fs::create_dir(&staging).unwrap();
        fs::write(staging.join("HEAD"), "ref: refs/heads/master\n").unwrap();
        fs::write(cache.new_temp_path(), "scratch").unwrap();
        let swap = branch.with_file_name(".refs|heads|master.1.2.3.tmp");
        symlink(&identity, &swap).unwrap();

        let stats = cache.garbage_collect(&fixture.environments, true).unwrap();
        assert_eq!(stats.temps_removed, 0);
        assert!(staging.is_dir());

        let stats = cache.garbage_collect(&fixture.environments, false).unwrap();
        assert_eq!(stats.temps_removed, 3);
        assert!(fs::read_dir(cache.tmp_dir()).unwrap().next().is_none());
        assert!(fs::symlink_metadata(&swap).is_err());
        assert_eq!(
            fs::read_to_string(fixture.environments.join("production/identity")).unwrap(),
            "c1"
        );
    }

    #[test]
    fn test_follow_reference_depth_limit() {
        let fixture = setup();
        let dir = fixture.environments.clone();
        // a -> b -> c -> ... -> h, a chain of seven links
        let names = ["a", "b", "c", "d", "e", "f", "g", "h"];
        for pair in names.windows(2) {
            symlink(dir.join(pair[1]), dir.join(pair[0])).unwrap();
        }
        fs::create_dir(dir.join("h")).unwrap();

        let mut referenced = HashSet::new();
        assert!(matches!(
            fixture.cache.follow_reference(&dir.join("a"), &mut referenced),
            Err(Error::SymlinkTooDeep { max: MAX_SYMLINK_DEPTH, .. })
        ));

        let mut referenced = HashSet::new();
        let target = fixture.cache.follow_reference(&dir.join("c"), &mut referenced).unwrap();
        assert_eq!(target, Some(dir.join("h")));
        assert_eq!(referenced.len(), 5);
    }

    #[test]
    fn test_follow_reference_cycle() {
        let fixture = setup();
        let dir = &fixture.environments;
        symlink("b", dir.join("a")).unwrap();
        symlink("a", dir.join("b")).unwrap();

        let mut referenced = HashSet::new();
        assert!(matches!(
            fixture.cache.follow_reference(&dir.join("a"), &mut referenced),
            Err(Error::SymlinkTooDeep { .. })
        ));
        assert!(fixture.cache.garbage_collect(dir, false).is_err());
        // The cache lock was released despite the failure.
        fixture.cache.lock(LockMode::Exclusive, None, || Ok(())).unwrap();
    }

    #[test]
    fn test_follow_reference_rejects_plain_files() {
        let fixture = setup();
        let file = fixture.environments.join("plain");
        fs::write(&file, "").unwrap();

        let mut referenced = HashSet::new();
        assert!(matches!(
            fixture.cache.follow_reference(&file, &mut referenced),
            Err(Error::NotSymlink { .. })
        ));
    }

    #[test]
    fn test_dangling_environment_is_not_fatal() {
        let fixture = setup();
        symlink("/nonexistent/armature/object", fixture.environments.join("broken")).unwrap();

        let referenced = fixture.cache.find_all_references(&fixture.environments).unwrap();
        assert!(referenced.contains(Path::new("/nonexistent/armature/object")));
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(clean_path(Path::new("a/../../b")), PathBuf::from("../b"));
    }
}
