//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the configured `git` binary
//! for the actual work.  Prompts are disabled so a misconfigured credential
//! helper can never hang a request.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

fn git(git_bin: &Path) -> Command {
    let mut cmd = Command::new(git_bin);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Run `git init --bare <path>`.
///
/// The caller is responsible for making sure nobody else is initialising the
/// same path concurrently and for removing the directory if this fails.
#[instrument(skip(git_bin), fields(path = %path.display()))]
pub async fn git_init_bare(git_bin: &Path, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let output = git(git_bin)
        .arg("init")
        .arg("--bare")
        .arg(path)
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// Run `git clone <source> <dest>` to materialise a working copy of a bare
/// repository.
#[instrument(skip(git_bin), fields(source = %source.display(), dest = %dest.display()))]
pub async fn git_clone(git_bin: &Path, source: &Path, dest: &Path) -> Result<()> {
    let output = git(git_bin)
        .arg("clone")
        .arg("--quiet")
        .arg(source)
        .arg(dest)
        .output()
        .await
        .context("failed to spawn git clone")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git clone failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git clone succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::script;

    #[tokio::test]
    async fn init_bare_passes_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("args.log");
        let bin = script(
            tmp.path(),
            "git",
            &format!("echo \"$@\" > {}\nmkdir -p \"$3\"", log.display()),
        );
        let target = tmp.path().join("nested/repo.git");

        git_init_bare(&bin, &target).await.unwrap();

        let args = std::fs::read_to_string(&log).unwrap();
        assert_eq!(args.trim(), format!("init --bare {}", target.display()));
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn init_bare_reports_stderr_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = script(tmp.path(), "git", "echo 'disk full' >&2\nexit 3");
        let err = git_init_bare(&bin, &tmp.path().join("repo.git"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("disk full"));
    }

    #[tokio::test]
    async fn clone_failure_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = script(tmp.path(), "git", "echo 'not a repo' >&2\nexit 128");
        let err = git_clone(&bin, tmp.path(), &tmp.path().join("out"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("not a repo"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = git_clone(
            &tmp.path().join("no-such-git"),
            tmp.path(),
            &tmp.path().join("out"),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn git clone"));
    }
}
