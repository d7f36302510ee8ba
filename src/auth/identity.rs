use axum::http::{header, HeaderMap};
use base64::Engine as _;
use serde::Serialize;
use tracing::debug;

/// Who is asking, and for which repository.
///
/// Credentials are empty strings when the request carried no usable
/// `Authorization: Basic` header; the authenticator decides what that means.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub repo_id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl Identity {
    pub fn anonymous(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            ..Self::default()
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Decode the `Authorization: Basic <b64>` header, if any, and pair it with
/// the repository identifier attached by the router.
pub fn extract_identity(headers: &HeaderMap, repo_id: Option<&str>) -> Identity {
    let mut identity = Identity::anonymous(repo_id.unwrap_or_default());

    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return identity;
    };

    let Some(encoded) = value.strip_prefix("Basic ") else {
        debug!("ignoring non-Basic Authorization header");
        return identity;
    };

    let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!(error = %e, "malformed Basic credentials");
            return identity;
        }
    };

    // The password may itself contain ':'; only the first one separates.
    match decoded.split_once(':') {
        Some((user, pass)) => {
            identity.username = user.to_string();
            identity.password = pass.to_string();
        }
        None => identity.username = decoded,
    }

    identity
}
