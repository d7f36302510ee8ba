//! What happens to a repository after a successful push.
//!
//! [`workflow::PushWorkflow`] materialises the pushed content and hands it to
//! a [`PushHook`].  The hook is supplied by the embedding application; two
//! stock hooks cover logging and running a shell command.

pub mod workflow;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::auth::Identity;
use crate::config::HookConfig;

pub use workflow::{PushPhase, PushReport, PushWorkflow};

/// Everything a hook gets to see about one push.
#[derive(Debug, Clone, Serialize)]
pub struct PushTransaction {
    pub repo_id: String,
    pub identity: Identity,
    pub bare_path: PathBuf,
    /// Working-tree clone of the bare repository, removed after the hook.
    pub content_path: PathBuf,
}

/// Business logic run once per successful push.
#[async_trait]
pub trait PushHook: Send + Sync {
    async fn on_push(&self, push: &PushTransaction) -> anyhow::Result<()>;
}

/// Logs the push and does nothing else.
#[derive(Debug, Default)]
pub struct LogHook;

#[async_trait]
impl PushHook for LogHook {
    async fn on_push(&self, push: &PushTransaction) -> anyhow::Result<()> {
        info!(
            repo_id = %push.repo_id,
            user = %push.identity.username,
            content_path = %push.content_path.display(),
            "push received"
        );
        Ok(())
    }
}

/// Runs `sh -c <command>` inside the content clone.
#[derive(Debug, Clone)]
pub struct CommandHook {
    command: String,
}

impl CommandHook {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl PushHook for CommandHook {
    #[instrument(skip(self, push), fields(repo_id = %push.repo_id))]
    async fn on_push(&self, push: &PushTransaction) -> anyhow::Result<()> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&push.content_path)
            .env("PUSHGATE_REPO_ID", &push.repo_id)
            .env("PUSHGATE_USER", &push.identity.username)
            .env("PUSHGATE_BARE_PATH", &push.bare_path)
            .env("PUSHGATE_CONTENT_PATH", &push.content_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to spawn push hook command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "push hook exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        info!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "push hook finished"
        );
        Ok(())
    }
}

/// Build the stock hook selected by configuration.
pub fn build_hook(config: &HookConfig) -> Arc<dyn PushHook> {
    match &config.command {
        Some(command) if !command.trim().is_empty() => Arc::new(CommandHook::new(command.clone())),
        _ => Arc::new(LogHook),
    }
}
