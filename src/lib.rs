//! Stateless HTTP bridge for git smart-HTTP pushes.
//!
//! Requests for `/<owner>/<name>.git/info/refs?service=git-receive-pack` and
//! `/<owner>/<name>.git/git-receive-pack` are authenticated, bound to a bare
//! repository on local disk (created on first use) and streamed through
//! `git-receive-pack --stateless-rpc`.  After a successful push the pushed
//! content is cloned into a scratch directory and handed to a [`PushHook`].
//!
//! The binary wires stock capabilities from configuration; embedders build
//! an [`AppState`] with their own [`Authenticator`] and [`PushHook`].

pub mod auth;
pub mod config;
pub mod error;
pub mod git;
pub mod health;
pub mod http;
pub mod metrics;
pub mod push;

#[cfg(all(test, unix))]
mod testutil;

use std::sync::Arc;

pub use auth::{Authenticator, Identity};
pub use error::BridgeError;
pub use push::{PushHook, PushTransaction};

use crate::config::Config;
use crate::git::{BareRepoStore, ReceivePack};
use crate::metrics::MetricsRegistry;
use crate::push::PushWorkflow;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler and push session.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<BareRepoStore>,
    pub receive_pack: ReceivePack,
    pub workflow: PushWorkflow,
    pub authenticator: Arc<dyn Authenticator>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(
        config: Config,
        authenticator: Arc<dyn Authenticator>,
        hook: Arc<dyn PushHook>,
    ) -> Self {
        let config = Arc::new(config);
        let metrics = MetricsRegistry::new();

        let store = Arc::new(BareRepoStore::new(
            config.storage.bare_root.clone(),
            config.git.git_bin.clone(),
        ));
        let receive_pack = ReceivePack::new(
            config.git.receive_pack_bin.clone(),
            config.push.subprocess_timeout(),
            metrics.metrics.active_subprocesses.clone(),
        );
        let workflow = PushWorkflow::new(
            config.git.git_bin.clone(),
            config.storage.scratch_root.clone(),
            Arc::clone(&store),
            hook,
            config.push.retention,
            config.push.clone_timeout(),
            config.push.hook_timeout(),
            Arc::clone(&metrics.metrics),
        );

        Self {
            config,
            store,
            receive_pack,
            workflow,
            authenticator,
            metrics,
        }
    }
}
