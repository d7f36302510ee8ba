//! Git plumbing: the bare repository store, pkt-line framing, command
//! wrappers and the `git-receive-pack` bridge.
//!
//! All operations shell out to configured binaries using
//! `tokio::process::Command` for non-blocking execution.

pub mod bare_repo;
pub mod commands;
pub mod pktline;
pub mod receive_pack;

pub use bare_repo::{BareRepoStore, RepoLease, RepoState};
pub use commands::{git_clone, git_init_bare};
pub use receive_pack::{PackCompletion, PackOutcome, PackStream, ProtocolOperation, ReceivePack};
