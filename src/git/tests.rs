use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::{
    accessor::{AccessorError, CanonPath},
    cache::{Cache, CacheError, FileCache},
    config::FetchSettings,
    model::{Attrs, Input},
    store::{LocalStore, Store, StorePath},
};

use super::{mirror::Mirror, FetchError, GitError, GitFetcher};

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "init.defaultBranch=main"])
        .args(args)
        .env("LC_ALL", "C")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap().trim_end().to_owned()
}

fn init_repo(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "--quiet"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.org"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

fn commit_file(dir: &Path, file: &str, contents: &str) -> String {
    let path = dir.join(file);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
    git(dir, &["add", file]);
    git(dir, &["commit", "--quiet", "-m", file]);
    git(dir, &["rev-parse", "HEAD"])
}

/// Counts insertions so that tests can tell which cache tiers were written.
struct CountingCache {
    inner: FileCache,
    adds: AtomicUsize,
}

impl Cache for CountingCache {
    fn add(
        &self,
        store: &dyn Store,
        key: &Attrs,
        info: &Attrs,
        store_path: &StorePath,
        locked: bool,
    ) -> Result<(), CacheError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.inner.add(store, key, info, store_path, locked)
    }

    fn lookup(
        &self,
        store: &dyn Store,
        key: &Attrs,
    ) -> Result<Option<(Attrs, StorePath)>, CacheError> {
        self.inner.lookup(store, key)
    }
}

struct Fixture {
    dir: TempDir,
    repo: PathBuf,
    store: LocalStore,
    cache: Arc<CountingCache>,
    fetcher: GitFetcher,
}

impl Fixture {
    fn new(configure: impl FnOnce(&mut FetchSettings)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);

        let mut settings = FetchSettings::new(dir.path().join("cache"));
        configure(&mut settings);
        let store = LocalStore::new(&settings.store_dir).unwrap();
        let cache = Arc::new(CountingCache {
            inner: FileCache::new(&settings.cache_dir, settings.ttl).unwrap(),
            adds: AtomicUsize::new(0),
        });
        let fetcher = GitFetcher::new(settings, cache.clone());
        Fixture {
            dir,
            repo,
            store,
            cache,
            fetcher,
        }
    }

    fn input(&self, query: &str) -> Input {
        self.input_for(&self.repo, query)
    }

    fn input_for(&self, repo: &Path, query: &str) -> Input {
        let url = if query.is_empty() {
            format!("git+file://{}", repo.display())
        } else {
            format!("git+file://{}?{}", repo.display(), query)
        };
        Input::from_url(&url).unwrap()
    }

    fn fetch(&self, input: &Input) -> Result<(StorePath, Input), FetchError> {
        self.fetcher.fetch(&self.store, input)
    }

    fn read(&self, store_path: &StorePath, file: &str) -> String {
        fs::read_to_string(self.store.real_path(store_path).join(file)).unwrap()
    }

    fn invocations(&self) -> usize {
        self.fetcher.git().invocations()
    }

    fn network_fetches(&self) -> usize {
        self.fetcher.git().invocations_of("fetch")
    }

    fn cache_writes(&self) -> usize {
        self.cache.adds.load(Ordering::SeqCst)
    }
}

fn files_below(root: &Path) -> BTreeSet<String> {
    fn walk(root: &Path, dir: &Path, files: &mut BTreeSet<String>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, files);
            } else {
                let relative = path.strip_prefix(root).unwrap();
                files.insert(relative.to_string_lossy().into_owned());
            }
        }
    }
    let mut files = BTreeSet::new();
    walk(root, root, &mut files);
    files
}

fn set_of(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[test]
fn explicit_revision_is_served_from_the_cache() {
    let fixture = Fixture::new(|_| ());
    commit_file(&fixture.repo, "README", "hello\n");
    let rev = commit_file(&fixture.repo, "src/lib.rs", "pub fn f() {}\n");

    let input = fixture.input(&format!("ref=main&rev={rev}"));
    let (store_path, fetched) = fixture.fetch(&input).unwrap();
    assert_eq!(fixture.read(&store_path, "README"), "hello\n");
    assert_eq!(fixture.read(&store_path, "src/lib.rs"), "pub fn f() {}\n");
    assert_eq!(fetched.rev().unwrap().as_str(), rev);
    assert_eq!(fetched.git_ref(), Some("main"));
    assert_eq!(fetched.rev_count(), Some(2));
    assert!(fetched.last_modified().is_some());
    assert!(fetched.has_all_info());
    assert!(!files_below(&fixture.store.real_path(&store_path)).contains(".git/HEAD"));

    let before = fixture.invocations();
    let (again, refetched) = fixture.fetch(&input).unwrap();
    assert_eq!(fixture.invocations(), before);
    assert_eq!(again, store_path);
    assert_eq!(refetched, fetched);
}

#[test]
fn clean_working_tree_resolves_its_head() {
    let fixture = Fixture::new(|_| ());
    let rev = commit_file(&fixture.repo, "README", "hello\n");

    let (store_path, fetched) = fixture.fetch(&fixture.input("")).unwrap();
    assert_eq!(fetched.git_ref(), Some("main"));
    assert_eq!(fetched.rev().unwrap().as_str(), rev);
    assert_eq!(fixture.read(&store_path, "README"), "hello\n");
    assert_eq!(fixture.cache_writes(), 2);
}

#[test]
fn dirty_tree_contains_exactly_the_tracked_files() {
    let fixture = Fixture::new(|_| ());
    commit_file(&fixture.repo, "README", "hello\n");
    commit_file(&fixture.repo, "src/lib.rs", "pub fn f() {}\n");

    fs::write(fixture.repo.join("README"), "changed\n").unwrap();
    fs::write(fixture.repo.join("new.txt"), "staged\n").unwrap();
    git(&fixture.repo, &["add", "new.txt"]);
    fs::write(fixture.repo.join("untracked.txt"), "untracked\n").unwrap();
    fs::write(fixture.repo.join("src/scratch.rs"), "untracked\n").unwrap();
    fs::create_dir_all(fixture.repo.join("empty/nested")).unwrap();
    fs::create_dir_all(fixture.repo.join("untracked_dir")).unwrap();
    fs::write(fixture.repo.join("untracked_dir/file"), "untracked\n").unwrap();

    let (store_path, fetched) = fixture.fetch(&fixture.input("")).unwrap();
    let root = fixture.store.real_path(&store_path);
    assert_eq!(
        files_below(&root),
        set_of(&["README", "new.txt", "src/lib.rs"])
    );
    assert!(!root.join("empty").exists());
    assert!(!root.join("untracked_dir").exists());
    assert_eq!(fixture.read(&store_path, "README"), "changed\n");

    assert!(fetched.rev().is_none());
    assert!(fetched.git_ref().is_none());
    assert!(fetched.last_modified().unwrap() > 0);
    assert_eq!(fixture.cache_writes(), 0);
}

#[test]
fn repository_without_commits_is_dirty() {
    let fixture = Fixture::new(|_| ());
    fs::write(fixture.repo.join("README"), "first\n").unwrap();
    git(&fixture.repo, &["add", "README"]);

    let (store_path, fetched) = fixture.fetch(&fixture.input("")).unwrap();
    assert_eq!(fixture.read(&store_path, "README"), "first\n");
    assert_eq!(fetched.last_modified(), Some(0));
}

#[test]
fn dirty_tree_is_refused_unless_allowed() {
    let fixture = Fixture::new(|settings| settings.allow_dirty = false);
    commit_file(&fixture.repo, "README", "hello\n");
    fs::write(fixture.repo.join("README"), "changed\n").unwrap();

    let error = fixture.fetch(&fixture.input("")).unwrap_err();
    assert!(matches!(error, FetchError::DirtyTree { .. }), "{error}");

    // An explicit reference ignores the working tree.
    let (store_path, _) = fixture.fetch(&fixture.input("ref=main")).unwrap();
    assert_eq!(fixture.read(&store_path, "README"), "hello\n");
}

#[test]
fn remote_fetch_populates_mirror_and_both_cache_tiers() {
    let fixture = Fixture::new(|settings| settings.force_remote = true);
    let rev = commit_file(&fixture.repo, "README", "hello\n");

    let (store_path, fetched) = fixture.fetch(&fixture.input("ref=main")).unwrap();
    assert_eq!(fetched.rev().unwrap().as_str(), rev);
    assert_eq!(fixture.read(&store_path, "README"), "hello\n");
    assert_eq!(fixture.cache_writes(), 2);
    assert_eq!(fixture.network_fetches(), 1);

    let url = format!("file://{}", fixture.repo.display());
    let mirror = Mirror::path_for(&fixture.dir.path().join("cache"), &url);
    assert_eq!(
        fs::read_to_string(mirror.join("refs/heads/main")).unwrap().trim(),
        rev
    );

    // Both the reference and the revision are now answered by the cache.
    let before = fixture.invocations();
    let (by_ref, _) = fixture.fetch(&fixture.input("ref=main")).unwrap();
    let (by_rev, _) = fixture
        .fetch(&fixture.input(&format!("ref=main&rev={rev}")))
        .unwrap();
    assert_eq!(fixture.invocations(), before);
    assert_eq!(by_ref, store_path);
    assert_eq!(by_rev, store_path);
    assert_eq!(fixture.cache_writes(), 2);
}

#[test]
fn explicit_revision_does_not_write_the_reference_entry() {
    let fixture = Fixture::new(|settings| settings.force_remote = true);
    let rev = commit_file(&fixture.repo, "README", "hello\n");

    let input = fixture.input(&format!("ref=main&rev={rev}"));
    let (store_path, _) = fixture.fetch(&input).unwrap();
    assert_eq!(fixture.cache_writes(), 1);

    let before = fixture.invocations();
    let (again, _) = fixture.fetch(&input).unwrap();
    assert_eq!(fixture.invocations(), before);
    assert_eq!(again, store_path);
}

#[test]
fn fresh_reference_is_not_fetched_again() {
    let fixture = Fixture::new(|settings| settings.force_remote = true);
    let first = commit_file(&fixture.repo, "README", "one\n");
    fixture.fetch(&fixture.input("ref=main")).unwrap();
    assert_eq!(fixture.network_fetches(), 1);

    commit_file(&fixture.repo, "README", "two\n");
    // A different name misses the cache but shares the mirror, whose copy of
    // `main` is still within its time-to-live.
    let input = fixture.input("ref=main").with_name("other");
    let (store_path, fetched) = fixture.fetch(&input).unwrap();
    assert_eq!(fetched.rev().unwrap().as_str(), first);
    assert_eq!(fixture.read(&store_path, "README"), "one\n");
    assert_eq!(fixture.network_fetches(), 1);
}

#[test]
fn stale_reference_is_fetched() {
    let fixture = Fixture::new(|settings| {
        settings.force_remote = true;
        settings.ttl = Duration::ZERO;
    });
    commit_file(&fixture.repo, "README", "one\n");
    fixture.fetch(&fixture.input("ref=main")).unwrap();
    assert_eq!(fixture.network_fetches(), 1);

    let second = commit_file(&fixture.repo, "README", "two\n");
    let (store_path, fetched) = fixture.fetch(&fixture.input("ref=main")).unwrap();
    assert_eq!(fetched.rev().unwrap().as_str(), second);
    assert_eq!(fixture.read(&store_path, "README"), "two\n");
    assert_eq!(fixture.network_fetches(), 2);
}

#[test]
fn failed_fetch_falls_back_to_the_recorded_reference() {
    let fixture = Fixture::new(|settings| {
        settings.force_remote = true;
        settings.ttl = Duration::ZERO;
    });
    let first = commit_file(&fixture.repo, "README", "one\n");
    let (store_path, _) = fixture.fetch(&fixture.input("ref=main")).unwrap();

    let input = fixture.input("ref=main");
    fs::rename(&fixture.repo, fixture.dir.path().join("moved")).unwrap();

    let (again, fetched) = fixture.fetch(&input).unwrap();
    assert_eq!(fixture.network_fetches(), 2);
    assert_eq!(fetched.rev().unwrap().as_str(), first);
    assert_eq!(again, store_path);
}

#[test]
fn failed_fetch_without_recorded_reference_is_an_error() {
    let fixture = Fixture::new(|settings| {
        settings.force_remote = true;
        settings.ttl = Duration::ZERO;
    });
    commit_file(&fixture.repo, "README", "one\n");
    fixture.fetch(&fixture.input("ref=main")).unwrap();

    let input = fixture.input("ref=main");
    fs::remove_dir_all(&fixture.repo).unwrap();

    let mut settings = FetchSettings::new(fixture.dir.path().join("fresh-cache"));
    settings.force_remote = true;
    settings.ttl = Duration::ZERO;
    let cache = Arc::new(FileCache::new(&settings.cache_dir, settings.ttl).unwrap());
    let fetcher = GitFetcher::new(settings, cache);

    let error = fetcher.fetch(&fixture.store, &input).unwrap_err();
    assert!(
        matches!(error, FetchError::Git(GitError::Failed { .. })),
        "{error}"
    );
    assert_eq!(fetcher.git().invocations_of("fetch"), 1);
}

#[test]
fn missing_revision_is_fetched_into_the_mirror() {
    let fixture = Fixture::new(|settings| settings.force_remote = true);
    commit_file(&fixture.repo, "README", "one\n");
    fixture.fetch(&fixture.input("ref=main")).unwrap();

    // The mirror's `main` is fresh, but the new revision is not in it yet.
    let second = commit_file(&fixture.repo, "README", "two\n");
    let (store_path, fetched) = fixture
        .fetch(&fixture.input(&format!("ref=main&rev={second}")))
        .unwrap();
    assert_eq!(fetched.rev().unwrap().as_str(), second);
    assert_eq!(fixture.read(&store_path, "README"), "two\n");
}

#[test]
fn unknown_revision_is_reported() {
    let fixture = Fixture::new(|_| ());
    commit_file(&fixture.repo, "README", "hello\n");

    let rev = "0123456789abcdef0123456789abcdef01234567";
    let error = fixture
        .fetch(&fixture.input(&format!("ref=main&rev={rev}")))
        .unwrap_err();
    assert!(
        matches!(&error, FetchError::RevisionNotFound { rev: r, .. } if r == rev),
        "{error}"
    );
    assert!(error.to_string().contains("allRefs"));
    assert_eq!(fixture.cache_writes(), 0);
}

#[test]
fn shallow_repository_requires_shallow_input() {
    let fixture = Fixture::new(|_| ());
    commit_file(&fixture.repo, "README", "one\n");
    let head = commit_file(&fixture.repo, "README", "two\n");

    let shallow = fixture.dir.path().join("shallow");
    let source = format!("file://{}", fixture.repo.display());
    git(
        fixture.dir.path(),
        &["clone", "--quiet", "--depth", "1", &source, shallow.to_str().unwrap()],
    );

    let error = fixture
        .fetch(&fixture.input_for(&shallow, "ref=main"))
        .unwrap_err();
    assert!(matches!(error, FetchError::ShallowMismatch { .. }), "{error}");

    let (store_path, fetched) = fixture
        .fetch(&fixture.input_for(&shallow, "ref=main&shallow=1"))
        .unwrap();
    assert_eq!(fetched.rev().unwrap().as_str(), head);
    assert_eq!(fetched.rev_count(), None);
    assert!(fetched.has_all_info());
    assert_eq!(fixture.read(&store_path, "README"), "two\n");
}

#[test]
fn lazy_fetch_confines_working_trees_to_tracked_files() {
    let fixture = Fixture::new(|_| ());
    commit_file(&fixture.repo, "README", "hello\n");
    fs::write(fixture.repo.join("untracked.txt"), "secret\n").unwrap();

    let (accessor, input) = fixture
        .fetcher
        .lazy_fetch(&fixture.store, &fixture.input(""))
        .unwrap();
    assert!(input.rev().is_none());
    assert_eq!(
        accessor.read_file(&CanonPath::new("/README").unwrap()).unwrap(),
        b"hello\n"
    );
    assert!(matches!(
        accessor.read_file(&CanonPath::new("/untracked.txt").unwrap()),
        Err(AccessorError::NotAllowed { .. })
    ));
    assert!(matches!(
        accessor.read_file(&CanonPath::new("/.git/config").unwrap()),
        Err(AccessorError::NotAllowed { .. })
    ));
    assert_eq!(fixture.cache_writes(), 0);

    // With a reference the tree comes from the store.
    let (accessor, input) = fixture
        .fetcher
        .lazy_fetch(&fixture.store, &fixture.input("ref=main"))
        .unwrap();
    assert!(input.rev().is_some());
    assert_eq!(
        accessor.read_file(&CanonPath::new("/README").unwrap()).unwrap(),
        b"hello\n"
    );
    assert!(!accessor
        .path_exists(&CanonPath::new("/untracked.txt").unwrap())
        .unwrap());
}

#[test]
fn clone_checks_out_the_reference() {
    let fixture = Fixture::new(|_| ());
    let rev = commit_file(&fixture.repo, "README", "hello\n");
    git(&fixture.repo, &["checkout", "--quiet", "-b", "feature"]);
    commit_file(&fixture.repo, "feature.txt", "feature\n");
    git(&fixture.repo, &["checkout", "--quiet", "main"]);

    let dest = fixture.dir.path().join("clone");
    fixture
        .fetcher
        .clone(&fixture.input("ref=feature"), &dest)
        .unwrap();
    assert_eq!(
        fs::read_to_string(dest.join("feature.txt")).unwrap(),
        "feature\n"
    );
    assert_eq!(git(&dest, &["rev-parse", "--abbrev-ref", "HEAD"]), "feature");

    let error = fixture
        .fetcher
        .clone(
            &fixture.input(&format!("ref=main&rev={rev}")),
            &fixture.dir.path().join("other"),
        )
        .unwrap_err();
    assert!(matches!(error, FetchError::CloneWithRev(_)), "{error}");
}

#[test]
fn changed_files_are_added_and_committed() {
    let fixture = Fixture::new(|_| ());
    commit_file(&fixture.repo, "README", "hello\n");
    let input = fixture.input("");
    assert_eq!(fixture.fetcher.source_path(&input), Some(fixture.repo.clone()));
    assert_eq!(fixture.fetcher.source_path(&fixture.input("ref=main")), None);

    fs::write(fixture.repo.join("lock.json"), "{}\n").unwrap();
    fixture
        .fetcher
        .mark_changed_file(&input, "lock.json", None)
        .unwrap();
    assert!(git(&fixture.repo, &["ls-files"]).lines().any(|f| f == "lock.json"));

    // Newly added files take part in the next dirty fetch.
    fs::write(fixture.repo.join("README"), "changed\n").unwrap();
    let (store_path, _) = fixture.fetch(&input).unwrap();
    assert_eq!(fixture.read(&store_path, "lock.json"), "{}\n");

    fixture
        .fetcher
        .mark_changed_file(&input, "lock.json", Some("Update lock file"))
        .unwrap();
    assert_eq!(
        git(&fixture.repo, &["log", "-1", "--format=%s"]),
        "Update lock file"
    );

    let error = fixture
        .fetcher
        .mark_changed_file(&fixture.input("ref=main"), "lock.json", None)
        .unwrap_err();
    assert!(matches!(error, FetchError::NotAWorkingTree(_)), "{error}");
}
