//! Git repositories, mirrored with `git clone --mirror`.

use super::{Repo, RepoKind, validate_ref_str};
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::fsname;
use crate::lock::{self, LockMode};
use crate::reference::{RefKind, Reference};
use crate::run;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Resolutions remembered for the current run.
#[derive(Debug, Default)]
struct Memo {
    refs: HashMap<String, Reference>,
    revs: HashMap<String, String>,
}

/// A mirrored git remote.
#[derive(Debug)]
pub struct GitRepo {
    path: PathBuf,
    url: String,
    id: String,
    fresh: AtomicBool,
    memo: Mutex<Memo>,
}

impl GitRepo {
    /// Get the handle for `url`, cloning the mirror on first use.
    pub fn from_url(cache: &Cache, url: &str) -> Result<Arc<dyn Repo>> {
        if let Some(repo) = cache.get_repo(RepoKind::Git, url) {
            return Ok(repo);
        }

        let mut cloned = false;
        let path = cache.open_repo(RepoKind::Git, url, |temp_path| {
            info!(url, "cloning");
            run::clean_git(&[
                OsStr::new("clone"),
                OsStr::new("--quiet"),
                OsStr::new("--mirror"),
                OsStr::new(url),
                temp_path.as_os_str(),
            ])?;
            cloned = true;
            Ok(())
        })?;

        let repo: Arc<dyn Repo> = Arc::new(Self::open(path, url, cloned));
        cache.register_repo(Arc::clone(&repo));
        Ok(repo)
    }

    /// Wrap an existing mirror. `fresh` marks a mirror fetched this run.
    pub(crate) fn open(path: PathBuf, url: &str, fresh: bool) -> Self {
        Self {
            path,
            url: url.to_string(),
            id: fsname::repo_id(RepoKind::Git, url),
            fresh: AtomicBool::new(fresh),
            memo: Mutex::new(Memo::default()),
        }
    }

    /// Path of the mirror.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, Memo> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remembered(&self, name: &str) -> Option<Reference> {
        self.memo().refs.get(name).cloned()
    }

    fn remember(&self, reference: Reference, aliases: &[&str]) -> Reference {
        let mut memo = self.memo();
        for alias in aliases {
            memo.refs.insert((*alias).to_string(), reference.clone());
        }
        memo.refs.insert(reference.canonical_name.clone(), reference.clone());
        reference
    }

    fn make_ref(
        &self,
        kind: RefKind,
        canonical_name: &str,
        sha: &str,
        human_type: &'static str,
        human_name: &str,
    ) -> Reference {
        Reference::new(
            self.id.clone(),
            self.url.clone(),
            kind,
            canonical_name,
            sha,
            human_type,
            human_name,
        )
    }

    fn git_with_env<V: AsRef<OsStr>>(
        &self,
        environment: &[(&str, V)],
        work_tree: Option<&Path>,
        args: &[&str],
    ) -> Result<String> {
        let mut argv: Vec<OsString> = Vec::with_capacity(args.len() + 2);
        let mut git_dir = OsString::from("--git-dir=");
        git_dir.push(&self.path);
        argv.push(git_dir);
        if let Some(work_tree) = work_tree {
            let mut arg = OsString::from("--work-tree=");
            arg.push(work_tree);
            argv.push(arg);
        }
        argv.extend(args.iter().map(OsString::from));
        run::clean_git_with_env(environment, &argv)
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        self.git_with_env::<&str>(&[], None, args)
    }

    /// Resolve a revision to a full commit id.
    fn rev_parse(&self, rev: &str) -> Result<String> {
        if let Some(sha) = self.memo().revs.get(rev) {
            return Ok(sha.clone());
        }

        let spec = format!("{rev}^{{commit}}");
        match self.git(&["rev-parse", "--verify", "--quiet", &spec]) {
            Ok(output) => {
                let sha = output.trim().to_string();
                self.memo().revs.insert(rev.to_string(), sha.clone());
                Ok(sha)
            }
            Err(Error::CommandFailed { status, .. }) if status > 0 => {
                Err(Error::ref_not_found(rev, self.url.clone()))
            }
            Err(err) => Err(err),
        }
    }

    fn try_rev_parse(&self, rev: &str) -> Result<Option<String>> {
        match self.rev_parse(rev) {
            Ok(sha) => Ok(Some(sha)),
            Err(err) if err.is_ref_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Run `f`; if the ref was missing and this run has not fetched yet,
    /// fetch and run it once more.
    fn retry_fresh<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        match f() {
            Err(err) if err.is_ref_not_found() && !self.is_fresh() => {
                debug!(url = %self.url, error = %err, "fetching to retry");
                self.freshen()?;
                f()
            }
            result => result,
        }
    }

    /// Resolve a branch. Always fetches first, once per run.
    pub fn branch_ref(&self, name: &str) -> Result<Reference> {
        let canonical = format!("refs/heads/{name}");
        if let Some(reference) = self.remembered(&canonical) {
            return Ok(reference);
        }

        self.freshen()?;
        let sha = self.rev_parse(&canonical)?;
        Ok(self.remember_branch(name, &sha))
    }

    fn remember_branch(&self, name: &str, sha: &str) -> Reference {
        let canonical = format!("refs/heads/{name}");
        let reference = self.make_ref(RefKind::Mutable, &canonical, sha, "branch", name);
        self.remember(reference, &[name])
    }

    /// Resolve a tag. Fetches only if the tag is missing.
    pub fn tag_ref(&self, name: &str) -> Result<Reference> {
        let canonical = format!("refs/tags/{name}");
        if let Some(reference) = self.remembered(&canonical) {
            return Ok(reference);
        }

        let sha = self.retry_fresh(|| self.rev_parse(&canonical))?;
        let reference = self.make_ref(RefKind::Immutable, &canonical, &sha, "tag", name);
        Ok(self.remember(reference, &[name]))
    }

    /// Resolve a full or abbreviated commit id.
    pub fn identity_ref(&self, sha: &str) -> Result<Reference> {
        if let Some(reference) = self.remembered(sha) {
            return Ok(reference);
        }

        let full = self.retry_fresh(|| {
            let full = self.rev_parse(sha)?;
            if full.starts_with(sha) {
                Ok(full)
            } else {
                Err(Error::ref_not_found(sha, self.url.clone()))
            }
        })?;
        let reference = self.make_ref(RefKind::Identity, &full, &full, "revision", &full);
        Ok(self.remember(reference, &[sha]))
    }

    /// Every branch in the mirror, fetching first once per run.
    pub fn branches(&self) -> Result<Vec<String>> {
        self.freshen()?;
        let output = self.git(&[
            "for-each-ref",
            "--format=%(objectname) %(refname)",
            "refs/heads",
        ])?;

        let mut names = Vec::new();
        for line in output.lines() {
            let Some((sha, refname)) = line.split_once(' ') else {
                continue;
            };
            if let Some(name) = refname.strip_prefix("refs/heads/") {
                self.remember_branch(name, sha);
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn clear_memo(&self) {
        let mut memo = self.memo();
        memo.refs.clear();
        memo.revs.clear();
    }
}

impl Repo for GitRepo {
    fn kind(&self) -> RepoKind {
        RepoKind::Git
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn general_ref(&self, ref_str: &str) -> Result<Reference> {
        validate_ref_str(ref_str)?;
        if let Some(reference) = self.remembered(ref_str) {
            return Ok(reference);
        }
        if let Some(name) = ref_str.strip_prefix("refs/heads/") {
            return self.branch_ref(name);
        }
        if let Some(name) = ref_str.strip_prefix("refs/tags/") {
            return self.tag_ref(name);
        }

        self.retry_fresh(|| {
            if self.try_rev_parse(&format!("refs/heads/{ref_str}"))?.is_some() {
                return self.branch_ref(ref_str);
            }
            if self.try_rev_parse(&format!("refs/tags/{ref_str}"))?.is_some() {
                return self.tag_ref(ref_str);
            }

            let sha = self.rev_parse(ref_str)?;
            if sha.starts_with(ref_str) {
                return self.identity_ref(ref_str);
            }

            let reference = self.make_ref(RefKind::Mutable, ref_str, &sha, "ref", ref_str);
            Ok(self.remember(reference, &[]))
        })
    }

    fn mutable_fs_ref(&self, ref_str: &str) -> Result<Reference> {
        validate_ref_str(ref_str)?;
        self.freshen()?;
        if let Some(reference) = self.remembered(ref_str) {
            return Ok(reference);
        }
        if let Some(name) = ref_str.strip_prefix("refs/heads/") {
            return self.branch_ref(name);
        }
        if let Some(name) = ref_str.strip_prefix("refs/tags/") {
            return self.tag_ref(name);
        }

        let sha = self.rev_parse(ref_str)?;
        let reference = self.make_ref(RefKind::Mutable, ref_str, &sha, "ref", ref_str);
        Ok(self.remember(reference, &[]))
    }

    /// Materializes through a private index file so the mirror's HEAD and
    /// refs are never touched.
    fn check_out(&self, cache: &Cache, reference: &Reference) -> Result<PathBuf> {
        debug!(%reference, url = %self.url, "checking out");
        cache.open_ref(reference, |object_path| {
            cache.with_temp_dir(|temp_path| {
                let index = temp_path.join("index");
                let environment = [("GIT_INDEX_FILE", index.as_os_str())];
                let work_tree = Some(object_path);
                self.git_with_env(&environment, work_tree, &["read-tree", &reference.identity])?;
                let checkout = ["checkout-index", "--all", "--force"];
                self.git_with_env(&environment, work_tree, &checkout)?;
                Ok(())
            })
        })
    }

    fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::SeqCst)
    }

    fn freshen_now(&self) -> Result<()> {
        self.clear_memo();
        info!(url = %self.url, "fetching");
        lock::with_lock(&self.path, LockMode::Exclusive, Some("fetch"), || {
            self.git(&["remote", "update", "--prune"]).map(|_| ())
        })?;
        self.clear_memo();
        self.fresh.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn flush_memory(&self) {
        self.clear_memo();
        self.fresh.store(false, Ordering::SeqCst);
    }

    fn as_git(&self) -> Option<&GitRepo> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// A throwaway upstream repository driven through the git CLI.
    struct Upstream {
        path: PathBuf,
    }

    impl Upstream {
        fn new(dir: &Path) -> Option<Self> {
            let path = dir.join("upstream");
            fs::create_dir(&path).unwrap();
            let upstream = Self { path };
            upstream.git(&["init", "--quiet", "--initial-branch=master"]).ok()?;
            Some(upstream)
        }

        fn git(&self, args: &[&str]) -> Result<String> {
            let mut argv = vec!["-C", self.path.to_str().unwrap()];
            argv.extend_from_slice(args);
            run::clean_git_with_env(
                &[
                    ("GIT_AUTHOR_NAME", "Test"),
                    ("GIT_AUTHOR_EMAIL", "test@example.com"),
                    ("GIT_COMMITTER_NAME", "Test"),
                    ("GIT_COMMITTER_EMAIL", "test@example.com"),
                ],
                &argv,
            )
        }

        fn commit(&self, file: &str, content: &str) -> String {
            fs::write(self.path.join(file), content).unwrap();
            self.git(&["add", file]).unwrap();
            self.git(&["commit", "--quiet", "-m", content]).unwrap();
            self.git(&["rev-parse", "HEAD"]).unwrap().trim().to_string()
        }

        fn url(&self) -> &str {
            self.path.to_str().unwrap()
        }
    }

    fn setup() -> Option<(TempDir, Upstream, Cache)> {
        let temp_dir = TempDir::new().unwrap();
        let upstream = Upstream::new(temp_dir.path())?;
        let cache = Cache::open(temp_dir.path().join("cache")).unwrap();
        Some((temp_dir, upstream, cache))
    }

    #[test]
    fn test_branch_tag_and_identity_resolution() {
        let Some((_temp_dir, upstream, cache)) = setup() else {
            return;
        };
        let first = upstream.commit("README", "one");
        upstream.git(&["tag", "v1"]).unwrap();
        let second = upstream.commit("README", "two");

        let repo = GitRepo::from_url(&cache, upstream.url()).unwrap();

        let branch = repo.general_ref("master").unwrap();
        assert_eq!(branch.kind, RefKind::Mutable);
        assert_eq!(branch.canonical_name, "refs/heads/master");
        assert_eq!(branch.identity, second);
        assert_eq!(branch.to_string(), "branch \"master\"");

        let tag = repo.general_ref("v1").unwrap();
        assert_eq!(tag.kind, RefKind::Immutable);
        assert_eq!(tag.canonical_name, "refs/tags/v1");
        assert_eq!(tag.identity, first);

        let short = &first[..10];
        let identity = repo.general_ref(short).unwrap();
        assert_eq!(identity.kind, RefKind::Identity);
        assert_eq!(identity.canonical_name, first);
        assert_eq!(repo.general_ref(&first).unwrap(), identity);

        let head = repo.general_ref("HEAD").unwrap();
        assert_eq!(head.kind, RefKind::Mutable);
        assert_eq!(head.human_type, "ref");

        assert!(repo.general_ref("nope").unwrap_err().is_ref_not_found());
    }

    #[test]
    fn test_qualified_names() {
        let Some((_temp_dir, upstream, cache)) = setup() else {
            return;
        };
        let sha = upstream.commit("README", "one");
        upstream.git(&["tag", "v1"]).unwrap();

        let repo = GitRepo::from_url(&cache, upstream.url()).unwrap();
        assert_eq!(repo.general_ref("refs/heads/master").unwrap().identity, sha);
        assert_eq!(repo.general_ref("refs/tags/v1").unwrap().identity, sha);
        assert!(repo.general_ref("refs/heads/missing").unwrap_err().is_ref_not_found());
    }

    #[test]
    fn test_memo_trusts_until_refresh() {
        let Some((_temp_dir, upstream, cache)) = setup() else {
            return;
        };
        let first = upstream.commit("README", "one");
        let repo = GitRepo::from_url(&cache, upstream.url()).unwrap();
        assert_eq!(repo.general_ref("master").unwrap().identity, first);

        let second = upstream.commit("README", "two");
        assert_eq!(repo.general_ref("master").unwrap().identity, first);

        assert_eq!(repo.refreshed_ref("master").unwrap().identity, second);
    }

    #[test]
    fn test_flush_memory_fetches_again() {
        let Some((_temp_dir, upstream, cache)) = setup() else {
            return;
        };
        upstream.commit("README", "one");
        let repo = GitRepo::from_url(&cache, upstream.url()).unwrap();
        repo.general_ref("master").unwrap();
        assert!(repo.is_fresh());

        let second = upstream.commit("README", "two");
        cache.flush_memory();
        assert!(!repo.is_fresh());
        assert_eq!(repo.general_ref("master").unwrap().identity, second);
        assert!(repo.is_fresh());
    }

    #[test]
    fn test_missing_tag_triggers_fetch() {
        let Some((temp_dir, upstream, _cache)) = setup() else {
            return;
        };
        upstream.commit("README", "one");
        let cache = Cache::open(temp_dir.path().join("cache")).unwrap();
        GitRepo::from_url(&cache, upstream.url()).unwrap();

        upstream.git(&["tag", "late"]).unwrap();
        let cache = Cache::open(temp_dir.path().join("cache")).unwrap();
        let repo = GitRepo::from_url(&cache, upstream.url()).unwrap();
        assert!(!repo.is_fresh());
        assert_eq!(repo.general_ref("late").unwrap().kind, RefKind::Immutable);
        assert!(repo.is_fresh());
    }

    #[test]
    fn test_branches() {
        let Some((_temp_dir, upstream, cache)) = setup() else {
            return;
        };
        upstream.commit("README", "one");
        upstream.git(&["branch", "production"]).unwrap();

        let repo = GitRepo::from_url(&cache, upstream.url()).unwrap();
        let git = repo.as_git().unwrap();
        assert_eq!(git.branches().unwrap(), vec!["master", "production"]);
        assert_eq!(repo.general_ref("production").unwrap().human_type, "branch");
    }

    #[test]
    fn test_check_out_leaves_mirror_untouched() {
        let Some((_temp_dir, upstream, cache)) = setup() else {
            return;
        };
        let first = upstream.commit("README", "one");
        upstream.git(&["tag", "v1"]).unwrap();
        upstream.commit("README", "two");

        let repo = GitRepo::from_url(&cache, upstream.url()).unwrap();
        let git = repo.as_git().unwrap();
        let head_before = git.git(&["rev-parse", "HEAD"]).unwrap();

        let tag = repo.general_ref("v1").unwrap();
        let path = repo.check_out(&cache, &tag).unwrap();
        assert_eq!(fs::read_to_string(path.join("README")).unwrap(), "one");
        assert_eq!(tag.identity, first);

        let master = repo.general_ref("master").unwrap();
        let path = repo.check_out(&cache, &master).unwrap();
        assert_eq!(fs::read_to_string(path.join("README")).unwrap(), "two");

        assert_eq!(git.git(&["rev-parse", "HEAD"]).unwrap(), head_before);
        assert_eq!(git.git(&["rev-parse", "refs/heads/master"]).unwrap(), head_before);
    }

    #[test]
    fn test_from_url_reuses_registered_handle() {
        let Some((_temp_dir, upstream, cache)) = setup() else {
            return;
        };
        upstream.commit("README", "one");
        let a = GitRepo::from_url(&cache, upstream.url()).unwrap();
        let b = GitRepo::from_url(&cache, upstream.url()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), fsname::repo_id(RepoKind::Git, upstream.url()));
    }

    #[test]
    fn test_rejects_option_like_refs() {
        let Some((_temp_dir, upstream, cache)) = setup() else {
            return;
        };
        upstream.commit("README", "one");
        let repo = GitRepo::from_url(&cache, upstream.url()).unwrap();
        assert!(matches!(
            repo.general_ref("--all"),
            Err(Error::InvalidName { .. })
        ));
    }
}
