use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tokio::process::Command;

use crate::config::Config;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub bare_root: CheckResult,
    pub scratch_root: CheckResult,
    pub git: CheckResult,
    pub receive_pack: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The directory exists and is not read-only.
async fn check_dir(path: &Path) -> CheckResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_dir() => {
            CheckResult::unhealthy(format!("{} is not a directory", path.display()))
        }
        Ok(meta) if meta.permissions().readonly() => {
            CheckResult::unhealthy(format!("{} is read-only", path.display()))
        }
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", path.display())),
    }
}

async fn check_git(git_bin: &Path) -> CheckResult {
    let output = Command::new(git_bin)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => CheckResult {
            ok: true,
            detail: Some(String::from_utf8_lossy(&out.stdout).trim().to_owned()),
        },
        Ok(out) => CheckResult::unhealthy(format!("{} --version exited with {}", git_bin.display(), out.status)),
        Err(e) => CheckResult::unhealthy(format!("failed to run {}: {e}", git_bin.display())),
    }
}

/// `git-receive-pack` has no cheap self-test, so only check it can be found.
fn check_executable(bin: &Path) -> CheckResult {
    match find_executable(bin) {
        Some(path) => CheckResult {
            ok: true,
            detail: Some(path.display().to_string()),
        },
        None => CheckResult::unhealthy(format!("{} not found", bin.display())),
    }
}

fn find_executable(bin: &Path) -> Option<PathBuf> {
    if bin.components().count() > 1 {
        return bin.is_file().then(|| bin.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// Pushes need the bare root and both executables; the scratch root only
/// matters to the post-push workflow.
fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let critical_ok = checks.bare_root.ok && checks.git.ok && checks.receive_pack.ok;

    if critical_ok && checks.scratch_root.ok {
        HealthStatus::Ok
    } else if critical_ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(config): State<Arc<Config>>) -> impl IntoResponse {
    let (bare_root, scratch_root, git) = tokio::join!(
        check_dir(&config.storage.bare_root),
        check_dir(&config.storage.scratch_root),
        check_git(&config.git.git_bin),
    );
    let receive_pack = check_executable(&config.git.receive_pack_bin);

    let checks = HealthChecks {
        bare_root,
        scratch_root,
        git,
        receive_pack,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::script;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.storage.bare_root = dir.join("bare");
        config.storage.scratch_root = dir.join("work");
        config.git.git_bin = script(dir, "git", "echo 'git version 2.45.0'");
        config.git.receive_pack_bin = script(dir, "git-receive-pack", "exit 0");
        config
    }

    #[tokio::test]
    async fn all_checks_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        std::fs::create_dir_all(&config.storage.bare_root).unwrap();
        std::fs::create_dir_all(&config.storage.scratch_root).unwrap();

        let response = health_handler(State(Arc::new(config))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["checks"]["git"]["detail"], "git version 2.45.0");
    }

    #[tokio::test]
    async fn missing_scratch_root_degrades() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        std::fs::create_dir_all(&config.storage.bare_root).unwrap();

        let response = health_handler(State(Arc::new(config))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["checks"]["scratch_root"]["ok"], false);
    }

    #[tokio::test]
    async fn missing_receive_pack_is_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_in(tmp.path());
        std::fs::create_dir_all(&config.storage.bare_root).unwrap();
        std::fs::create_dir_all(&config.storage.scratch_root).unwrap();
        config.git.receive_pack_bin = tmp.path().join("nope/git-receive-pack");

        let response = health_handler(State(Arc::new(config))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
