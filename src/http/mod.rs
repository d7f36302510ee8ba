//! HTTP layer for the push bridge.
//!
//! This module provides the axum router, request classification and the
//! handler that ties authentication, the bare repository store and the
//! `git-receive-pack` bridge together.

pub mod classify;
pub mod handler;

pub use handler::{create_router, handle};
