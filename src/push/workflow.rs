//! Post-push workflow: clone, hook, clean up.
//!
//! Runs after the `git-receive-pack` exchange has completed and the HTTP
//! response has been sent, so nothing here can reach the client.  Failures
//! are logged and recorded in the returned [`PushReport`].  Cleanup of the
//! ephemeral clone (and, per retention policy, of the bare repository) runs on
//! every path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::TempDir;
use tracing::{error, info, instrument, warn};

use crate::auth::Identity;
use crate::config::RetentionPolicy;
use crate::error::BridgeError;
use crate::git::bare_repo::{BareRepoStore, RepoLease};
use crate::git::commands::git_clone;
use crate::git::receive_pack::PackCompletion;
use crate::metrics::{Metrics, WorkflowOutcome};
use crate::push::{PushHook, PushTransaction};

/// Directory inside the scratch dir that receives the working-tree clone.
const CONTENT_DIR: &str = "content";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushPhase {
    Idle,
    Cloning,
    HookRunning,
    CleaningUp,
    Done,
    Failed,
}

/// What one workflow run went through.
#[derive(Debug)]
pub struct PushReport {
    pub repo_id: String,
    pub phases: Vec<PushPhase>,
    pub final_phase: PushPhase,
    /// `CloneError` or `HookError`, when one happened.
    pub error: Option<BridgeError>,
    /// The bare repository was deleted during cleanup.
    pub removed_repo: bool,
}

impl PushReport {
    fn new(repo_id: &str) -> Self {
        Self {
            repo_id: repo_id.to_owned(),
            phases: vec![PushPhase::Idle],
            final_phase: PushPhase::Idle,
            error: None,
            removed_repo: false,
        }
    }

    fn enter(&mut self, phase: PushPhase) {
        self.phases.push(phase);
        self.final_phase = phase;
    }
}

#[derive(Clone)]
pub struct PushWorkflow {
    git_bin: PathBuf,
    scratch_root: PathBuf,
    store: Arc<BareRepoStore>,
    hook: Arc<dyn PushHook>,
    retention: RetentionPolicy,
    clone_timeout: Option<Duration>,
    hook_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl PushWorkflow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        git_bin: impl Into<PathBuf>,
        scratch_root: impl Into<PathBuf>,
        store: Arc<BareRepoStore>,
        hook: Arc<dyn PushHook>,
        retention: RetentionPolicy,
        clone_timeout: Option<Duration>,
        hook_timeout: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            git_bin: git_bin.into(),
            scratch_root: scratch_root.into(),
            store,
            hook,
            retention,
            clone_timeout,
            hook_timeout,
            metrics,
        }
    }

    /// Run the workflow for a finished `ReceivePack` exchange.
    ///
    /// Clone and hook only run when the exchange succeeded; otherwise the
    /// workflow goes straight to cleanup and ends `Failed`.
    #[instrument(skip_all, fields(repo_id = %completion.lease.repo_id()))]
    pub async fn run(&self, identity: Identity, completion: PackCompletion) -> PushReport {
        let started = Instant::now();
        let PackCompletion { outcome, lease } = completion;
        let mut report = PushReport::new(lease.repo_id());

        let mut scratch = None;
        if outcome.succeeded() {
            match self.clone_content(&mut report, &lease).await {
                Ok((dir, content_path)) => {
                    scratch = Some(dir);
                    let push = PushTransaction {
                        repo_id: lease.repo_id().to_owned(),
                        identity,
                        bare_path: lease.path().to_path_buf(),
                        content_path,
                    };
                    if let Err(e) = self.run_hook(&mut report, &push).await {
                        error!(repo_id = %push.repo_id, error = %format!("{e:#}"), "push hook failed");
                        report.error = Some(e);
                    }
                }
                Err(e) => {
                    error!(repo_id = %lease.repo_id(), error = %format!("{e:#}"), "content clone failed");
                    report.error = Some(e);
                }
            }
        } else {
            warn!(
                status = ?outcome.status,
                client_gone = outcome.client_gone,
                timed_out = outcome.timed_out,
                "pack exchange did not succeed; skipping push hook"
            );
        }

        let failed = !outcome.succeeded() || report.error.is_some();
        self.clean_up(&mut report, scratch, Some(lease)).await;
        self.finish(report, failed, started)
    }

    /// Clean up after a `ReceivePack` request whose exchange never produced a
    /// completion (spawn failure, silent subprocess failure, crashed pump).
    #[instrument(skip(self))]
    pub async fn abandon(&self, repo_id: &str) -> PushReport {
        let started = Instant::now();
        let mut report = PushReport::new(repo_id);
        self.clean_up(&mut report, None, None).await;
        self.finish(report, true, started)
    }

    // ---- Phases ----

    async fn clone_content(
        &self,
        report: &mut PushReport,
        lease: &RepoLease,
    ) -> Result<(TempDir, PathBuf), BridgeError> {
        report.enter(PushPhase::Cloning);

        tokio::fs::create_dir_all(&self.scratch_root)
            .await
            .map_err(|e| {
                BridgeError::CloneError(anyhow::anyhow!(
                    "failed to create scratch root {}: {e}",
                    self.scratch_root.display()
                ))
            })?;
        let dir = tempfile::Builder::new()
            .prefix("push-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| {
                BridgeError::CloneError(anyhow::anyhow!("failed to create clone directory: {e}"))
            })?;
        let content_path = dir.path().join(CONTENT_DIR);

        match within(self.clone_timeout, git_clone(&self.git_bin, lease.path(), &content_path)).await
        {
            Some(Ok(())) => {
                info!(content_path = %content_path.display(), "pushed content cloned");
                Ok((dir, content_path))
            }
            Some(Err(e)) => Err(BridgeError::CloneError(e)),
            None => Err(BridgeError::CloneError(anyhow::anyhow!(
                "git clone timed out after {:?}",
                self.clone_timeout.unwrap_or_default()
            ))),
        }
    }

    async fn run_hook(
        &self,
        report: &mut PushReport,
        push: &PushTransaction,
    ) -> Result<(), BridgeError> {
        report.enter(PushPhase::HookRunning);
        match within(self.hook_timeout, self.hook.on_push(push)).await {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(BridgeError::HookError(e)),
            None => Err(BridgeError::HookError(anyhow::anyhow!(
                "push hook timed out after {:?}",
                self.hook_timeout.unwrap_or_default()
            ))),
        }
    }

    async fn clean_up(
        &self,
        report: &mut PushReport,
        scratch: Option<TempDir>,
        lease: Option<RepoLease>,
    ) {
        report.enter(PushPhase::CleaningUp);

        if let Some(dir) = scratch {
            let path = dir.path().to_path_buf();
            match tokio::task::spawn_blocking(move || dir.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(path = %path.display(), error = %e, "failed to remove content clone"),
                Err(e) => warn!(path = %path.display(), error = %e, "content clone cleanup task failed"),
            }
        }

        // Our own lease must go before `remove`, which waits for all of them.
        drop(lease);

        if self.retention == RetentionPolicy::DeleteAfterPush {
            match self.store.remove(&report.repo_id).await {
                Ok(()) => {
                    report.removed_repo = true;
                    self.metrics.repo_removals_total.inc();
                }
                Err(e) => warn!(repo_id = %report.repo_id, error = %e, "failed to remove bare repository"),
            }
        }
    }

    fn finish(&self, mut report: PushReport, failed: bool, started: Instant) -> PushReport {
        let outcome = if failed {
            report.enter(PushPhase::Failed);
            WorkflowOutcome::Failed
        } else {
            report.enter(PushPhase::Done);
            WorkflowOutcome::Done
        };
        let elapsed = started.elapsed();
        self.metrics.workflow_finished(outcome, elapsed.as_secs_f64());
        info!(
            repo_id = %report.repo_id,
            final_phase = ?report.final_phase,
            removed_repo = report.removed_repo,
            elapsed_ms = elapsed.as_millis() as u64,
            "push workflow finished"
        );
        report
    }
}

async fn within<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
