//! Authentication for push requests.
//!
//! The bridge never decides on its own who may push: it extracts an
//! [`Identity`] from the request and asks an [`Authenticator`] supplied at
//! construction time.

pub mod identity;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{AuthConfig, AuthMode};

pub use identity::{extract_identity, Identity};

/// Decides whether an identity may talk to its repository.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, identity: &Identity) -> bool;
}

#[async_trait]
impl<F> Authenticator for F
where
    F: Fn(&Identity) -> bool + Send + Sync,
{
    async fn authenticate(&self, identity: &Identity) -> bool {
        (self)(identity)
    }
}

/// Rejects everything.  Used when no authenticator has been configured.
#[derive(Debug, Default)]
pub struct DenyAll;

#[async_trait]
impl Authenticator for DenyAll {
    async fn authenticate(&self, identity: &Identity) -> bool {
        warn!(
            repo_id = %identity.repo_id,
            "no authenticator configured; rejecting request (set auth.mode)"
        );
        false
    }
}

/// Accepts everything, credentials or not.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _identity: &Identity) -> bool {
        true
    }
}

/// HTTP Basic against a static table of SHA-256 password digests.
#[derive(Debug, Clone)]
pub struct BasicUsers {
    digests: HashMap<String, String>,
}

impl BasicUsers {
    pub fn new(digests: HashMap<String, String>) -> Self {
        let digests = digests
            .into_iter()
            .map(|(user, digest)| (user, digest.to_ascii_lowercase()))
            .collect();
        Self { digests }
    }
}

#[async_trait]
impl Authenticator for BasicUsers {
    async fn authenticate(&self, identity: &Identity) -> bool {
        if !identity.has_credentials() {
            debug!(repo_id = %identity.repo_id, "basic auth: no credentials supplied");
            return false;
        }
        let Some(expected) = self.digests.get(&identity.username) else {
            debug!(user = %identity.username, "basic auth: unknown user");
            return false;
        };
        let ok = password_digest(&identity.password) == *expected;
        debug!(user = %identity.username, repo_id = %identity.repo_id, ok, "basic auth checked");
        ok
    }
}

/// Hex-encoded SHA-256 of a password, as stored in `auth.users`.
pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the stock authenticator selected by configuration.
pub fn build_authenticator(config: &AuthConfig) -> Arc<dyn Authenticator> {
    match config.mode {
        AuthMode::Deny => Arc::new(DenyAll),
        AuthMode::Anonymous => Arc::new(AllowAll),
        AuthMode::Basic => Arc::new(BasicUsers::new(config.users.clone())),
    }
}
