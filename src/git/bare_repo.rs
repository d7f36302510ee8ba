//! Bare repository store.
//!
//! Maps a repository identifier to a bare repository on local disk.  The path
//! is derived from a SHA-256 of the identifier, so it is stable across
//! restarts and the filesystem is always the source of truth: the in-memory
//! map only holds per-identifier locks and a state hint.
//!
//! Every identifier has its own [`RwLock`].  Pack operations hold a shared
//! [`RepoLease`] for as long as they read or write the repository;
//! initialisation and removal take the lock exclusively.  Unrelated
//! identifiers never contend, and the map's own mutex is only held for
//! bookkeeping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::BridgeError;
use crate::git::commands::git_init_bare;

/// Lifecycle of a bare repository as seen by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoState {
    Absent,
    Creating,
    Ready,
    Cleaning,
}

struct Slot {
    lock: Arc<RwLock<()>>,
    state: RepoState,
}

/// Shared access to a ready bare repository.
///
/// While any lease for an identifier is alive, [`BareRepoStore::remove`] for
/// that identifier waits.
#[derive(Debug)]
pub struct RepoLease {
    repo_id: String,
    path: PathBuf,
    created: bool,
    _guard: OwnedRwLockReadGuard<()>,
}

impl RepoLease {
    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this call initialised the repository.
    pub fn created(&self) -> bool {
        self.created
    }
}

pub struct BareRepoStore {
    root: PathBuf,
    git_bin: PathBuf,
    slots: Mutex<HashMap<String, Slot>>,
}

impl BareRepoStore {
    pub fn new(root: impl Into<PathBuf>, git_bin: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git_bin: git_bin.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of the bare repository for `repo_id`.  Pure.
    pub fn resolve_path(&self, repo_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(repo_id.as_bytes());
        self.root
            .join(format!("{}.git", hex::encode(hasher.finalize())))
    }

    /// Whether a bare repository currently exists on disk for `repo_id`.
    pub async fn exists(&self, repo_id: &str) -> bool {
        is_bare_repo(&self.resolve_path(repo_id)).await
    }

    /// Current lifecycle state.  In-flight transitions come from the map,
    /// everything else is read from disk.
    pub async fn state(&self, repo_id: &str) -> RepoState {
        let hint = self
            .lock_slots()
            .get(repo_id)
            .map(|slot| slot.state)
            .unwrap_or(RepoState::Absent);
        match hint {
            RepoState::Creating | RepoState::Cleaning => hint,
            RepoState::Absent | RepoState::Ready => {
                if self.exists(repo_id).await {
                    RepoState::Ready
                } else {
                    RepoState::Absent
                }
            }
        }
    }

    /// Return a lease on the bare repository for `repo_id`, initialising it
    /// first if it does not exist yet.
    ///
    /// Concurrent callers for the same identifier initialise at most once.
    /// A failed initialisation removes whatever it left on disk.
    #[instrument(skip(self))]
    pub async fn ensure_ready(&self, repo_id: &str) -> Result<RepoLease, BridgeError> {
        let path = self.resolve_path(repo_id);
        let lock = self.slot_lock(repo_id);

        let guard = Arc::clone(&lock).read_owned().await;
        if is_bare_repo(&path).await {
            self.set_state(repo_id, RepoState::Ready);
            debug!(path = %path.display(), "bare repo already present");
            return Ok(self.lease(repo_id, path, false, guard));
        }
        drop(guard);

        let guard = Arc::clone(&lock).write_owned().await;
        drop(lock);
        // Someone may have created it while we waited for the write lock.
        if is_bare_repo(&path).await {
            self.set_state(repo_id, RepoState::Ready);
            return Ok(self.lease(repo_id, path, false, guard.downgrade()));
        }

        self.set_state(repo_id, RepoState::Creating);
        match git_init_bare(&self.git_bin, &path).await {
            Ok(()) => {
                self.set_state(repo_id, RepoState::Ready);
                info!(path = %path.display(), "bare repo created");
                Ok(self.lease(repo_id, path, true, guard.downgrade()))
            }
            Err(source) => {
                if let Err(e) = remove_tree(&path).await {
                    warn!(error = %e, path = %path.display(), "failed to remove partial bare repo");
                }
                self.set_state(repo_id, RepoState::Absent);
                drop(guard);
                self.forget_if_idle(repo_id);
                Err(BridgeError::RepositoryInitError {
                    repo_id: repo_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Delete the bare repository for `repo_id`.
    ///
    /// Waits for every outstanding [`RepoLease`] on the identifier to be
    /// dropped first.  Removing a repository that does not exist is a no-op.
    #[instrument(skip(self))]
    pub async fn remove(&self, repo_id: &str) -> std::io::Result<()> {
        let path = self.resolve_path(repo_id);
        let lock = self.slot_lock(repo_id);
        let guard = Arc::clone(&lock).write_owned().await;
        drop(lock);

        self.set_state(repo_id, RepoState::Cleaning);
        let result = remove_tree(&path).await;
        let state = if result.is_ok() || !is_bare_repo(&path).await {
            RepoState::Absent
        } else {
            RepoState::Ready
        };
        self.set_state(repo_id, state);
        drop(guard);
        self.forget_if_idle(repo_id);

        if result.is_ok() {
            debug!(path = %path.display(), "bare repo removed");
        }
        result
    }

    // -- bookkeeping ---------------------------------------------------------

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_lock(&self, repo_id: &str) -> Arc<RwLock<()>> {
        let mut slots = self.lock_slots();
        let slot = slots.entry(repo_id.to_string()).or_insert_with(|| Slot {
            lock: Arc::new(RwLock::new(())),
            state: RepoState::Absent,
        });
        Arc::clone(&slot.lock)
    }

    fn set_state(&self, repo_id: &str, state: RepoState) {
        if let Some(slot) = self.lock_slots().get_mut(repo_id) {
            slot.state = state;
        }
    }

    /// Drop the map entry once nothing references its lock any more.
    fn forget_if_idle(&self, repo_id: &str) {
        let mut slots = self.lock_slots();
        let idle = slots
            .get(repo_id)
            .is_some_and(|slot| slot.state == RepoState::Absent && Arc::strong_count(&slot.lock) == 1);
        if idle {
            slots.remove(repo_id);
        }
    }

    fn lease(
        &self,
        repo_id: &str,
        path: PathBuf,
        created: bool,
        guard: OwnedRwLockReadGuard<()>,
    ) -> RepoLease {
        RepoLease {
            repo_id: repo_id.to_string(),
            path,
            created,
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.lock_slots().len()
    }
}

/// A bare repo is a directory containing a `HEAD` file.
async fn is_bare_repo(path: &Path) -> bool {
    tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn remove_tree(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testutil::{fake_git, git_log, script};

    fn store(tmp: &Path) -> BareRepoStore {
        BareRepoStore::new(tmp.join("bare"), fake_git(tmp))
    }

    #[test]
    fn resolve_path_is_deterministic() {
        let a = BareRepoStore::new("/srv/bare", "git");
        let b = BareRepoStore::new("/srv/bare", "git");
        let p = a.resolve_path("alice/demo");
        assert_eq!(p, a.resolve_path("alice/demo"));
        assert_eq!(p, b.resolve_path("alice/demo"));
        assert!(p.starts_with("/srv/bare"));
        assert_eq!(p.extension().unwrap(), "git");
        assert_ne!(p, a.resolve_path("alice/other"));
    }

    #[test]
    fn resolve_path_never_escapes_root() {
        let s = BareRepoStore::new("/srv/bare", "git");
        let p = s.resolve_path("../../etc/passwd");
        assert_eq!(p.parent().unwrap(), Path::new("/srv/bare"));
    }

    #[tokio::test]
    async fn ensure_ready_creates_then_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        assert_eq!(store.state("alice/demo").await, RepoState::Absent);
        let first = store.ensure_ready("alice/demo").await.unwrap();
        assert!(first.created());
        assert!(first.path().join("HEAD").is_file());
        let path = first.path().to_path_buf();
        drop(first);

        let second = store.ensure_ready("alice/demo").await.unwrap();
        assert!(!second.created());
        assert_eq!(second.path(), path);
        assert_eq!(git_log(tmp.path()).len(), 1);
        assert_eq!(store.state("alice/demo").await, RepoState::Ready);
    }

    #[tokio::test]
    async fn existing_repo_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let path = {
            let before = store(tmp.path());
            let lease = before.ensure_ready("alice/demo").await.unwrap();
            lease.path().to_path_buf()
        };

        let after = store(tmp.path());
        assert!(after.exists("alice/demo").await);
        let lease = after.ensure_ready("alice/demo").await.unwrap();
        assert!(!lease.created());
        assert_eq!(lease.path(), path);
        assert_eq!(git_log(tmp.path()).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensure_ready_initialises_once() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("init.log");
        let slow_git = script(
            tmp.path(),
            "slow-git",
            &format!(
                "echo init >> {}\nsleep 0.2\nmkdir -p \"$3\" && touch \"$3/HEAD\"",
                log.display()
            ),
        );
        let store = Arc::new(BareRepoStore::new(tmp.path().join("bare"), slow_git));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let lease = store.ensure_ready("alice/demo").await.unwrap();
                lease.path().to_path_buf()
            }));
        }

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap());
        }

        let inits = std::fs::read_to_string(&log).unwrap();
        assert_eq!(inits.lines().count(), 1);
        assert!(paths.iter().all(|p| *p == paths[0]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_identifiers_do_not_contend() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(store(tmp.path()));

        // Hold a lease on one repo and remove a different one.
        let _held = store.ensure_ready("alice/demo").await.unwrap();
        store.ensure_ready("bob/other").await.map(drop).unwrap();
        tokio::time::timeout(Duration::from_secs(5), store.remove("bob/other"))
            .await
            .expect("remove of an unrelated repo blocked")
            .unwrap();
        assert!(!store.exists("bob/other").await);
        assert!(store.exists("alice/demo").await);
    }

    #[tokio::test]
    async fn init_failure_cleans_partial_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let broken = script(tmp.path(), "git", "mkdir -p \"$3\"\necho boom >&2\nexit 1");
        let store = BareRepoStore::new(tmp.path().join("bare"), broken);

        let err = store.ensure_ready("alice/demo").await.unwrap_err();
        assert!(matches!(err, BridgeError::RepositoryInitError { .. }));
        assert!(err.to_string().contains("boom"));
        assert!(!store.resolve_path("alice/demo").exists());
        assert_eq!(store.state("alice/demo").await, RepoState::Absent);
        assert_eq!(store.tracked(), 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        store.remove("never/seen").await.unwrap();
        store.ensure_ready("alice/demo").await.map(drop).unwrap();
        store.remove("alice/demo").await.unwrap();
        store.remove("alice/demo").await.unwrap();
        assert!(!store.exists("alice/demo").await);
        assert_eq!(store.tracked(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_waits_for_outstanding_lease() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(store(tmp.path()));
        let lease = store.ensure_ready("alice/demo").await.unwrap();
        let path = lease.path().to_path_buf();

        let remover = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.remove("alice/demo").await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!remover.is_finished());
        assert!(path.join("HEAD").is_file());

        drop(lease);
        remover.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn recreated_after_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        store.ensure_ready("alice/demo").await.map(drop).unwrap();
        store.remove("alice/demo").await.unwrap();
        let lease = store.ensure_ready("alice/demo").await.unwrap();
        assert!(lease.created());
        assert_eq!(git_log(tmp.path()).len(), 2);
    }
}
