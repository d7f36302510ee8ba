use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub hook: HookConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory under which bare repositories are created.
    #[serde(default = "default_bare_root")]
    pub bare_root: PathBuf,
    /// Parent directory for the ephemeral content clones made after a push.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bare_root: default_bare_root(),
            scratch_root: default_scratch_root(),
        }
    }
}

fn default_bare_root() -> PathBuf {
    PathBuf::from("/var/lib/pushgate/bare")
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("/var/lib/pushgate/work")
}

// ---------------------------------------------------------------------------
// Git executables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// `git` binary used for `init --bare` and `clone`.
    #[serde(default = "default_git_bin")]
    pub git_bin: PathBuf,
    /// Pack-protocol executable driven over stdin/stdout.
    #[serde(default = "default_receive_pack_bin")]
    pub receive_pack_bin: PathBuf,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            git_bin: default_git_bin(),
            receive_pack_bin: default_receive_pack_bin(),
        }
    }
}

fn default_git_bin() -> PathBuf {
    PathBuf::from("git")
}

fn default_receive_pack_bin() -> PathBuf {
    PathBuf::from("git-receive-pack")
}

// ---------------------------------------------------------------------------
// Push workflow
// ---------------------------------------------------------------------------

/// What happens to a bare repository once its push workflow finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Keep the bare repository between the advertisement GET and the push
    /// POST, then delete it once the POST workflow cleaned up.
    #[default]
    DeleteAfterPush,
    /// Never delete; later requests for the same identifier reuse it.
    Retain,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Upper bound (seconds) on a pack subprocess' lifetime.  `0` disables it.
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout: u64,
    /// Upper bound (seconds) on cloning the pushed repository.
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,
    /// Upper bound (seconds) on the push hook.
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            subprocess_timeout: default_subprocess_timeout(),
            clone_timeout: default_clone_timeout(),
            hook_timeout: default_hook_timeout(),
        }
    }
}

impl PushConfig {
    pub fn subprocess_timeout(&self) -> Option<Duration> {
        secs(self.subprocess_timeout)
    }

    pub fn clone_timeout(&self) -> Option<Duration> {
        secs(self.clone_timeout)
    }

    pub fn hook_timeout(&self) -> Option<Duration> {
        secs(self.hook_timeout)
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn default_subprocess_timeout() -> u64 {
    600
}

fn default_clone_timeout() -> u64 {
    300
}

fn default_hook_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Reject everybody.  The bridge is unusable until an authenticator is
    /// configured.
    #[default]
    Deny,
    /// Accept every request, with or without credentials.
    Anonymous,
    /// HTTP Basic against the `users` table.
    Basic,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Username -> hex-encoded SHA-256 of the password.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Push hook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookConfig {
    /// Shell command run inside the content clone after every push.  When
    /// unset, pushes are only logged.
    #[serde(default)]
    pub command: Option<String>,
}

// ---------------------------------------------------------------------------
// HTTP behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    /// Answer malformed requests with 500 instead of 400/403.
    #[serde(default)]
    pub legacy_error_status: bool,
    /// Label push responses `application/x-git-receive-pack-result` instead
    /// of the advertisement type.
    #[serde(default)]
    pub result_content_type: bool,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    config
        .server
        .http_listen
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid http_listen address: {}", config.server.http_listen))?;
    anyhow::ensure!(
        config.storage.bare_root != config.storage.scratch_root,
        "bare_root and scratch_root must be different directories"
    );
    if config.auth.mode == AuthMode::Basic {
        anyhow::ensure!(
            !config.auth.users.is_empty(),
            "auth mode `basic` requires at least one user"
        );
    }
    for (user, digest) in &config.auth.users {
        anyhow::ensure!(
            digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()),
            "password digest for user {user:?} must be 64 hex characters (sha256)"
        );
    }
    Ok(())
}
