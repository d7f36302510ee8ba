//! Request classification: method + URL into a protocol operation.
//!
//! Classification is split in two.  [`classify`] runs before anything else
//! and rejects requests that are not a smart-HTTP pack exchange at all.  The
//! service check ([`RequestShape::operation`]) runs later, after the caller
//! authenticated and the repository was resolved, so an anonymous client
//! cannot tell fetchable repositories apart from others.

use axum::http::Method;

use crate::error::BridgeError;
use crate::git::ProtocolOperation;

/// The two services a smart-HTTP client may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    ReceivePack,
    UploadPack,
}

impl Service {
    pub fn as_str(self) -> &'static str {
        match self {
            Service::ReceivePack => "git-receive-pack",
            Service::UploadPack => "git-upload-pack",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "receive" => Some(Service::ReceivePack),
            "upload" => Some(Service::UploadPack),
            _ => None,
        }
    }
}

/// A request that looks like a pack exchange, service not yet vetted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestShape {
    pub advertise: bool,
    pub service: Service,
    pub repo_id: String,
}

impl RequestShape {
    /// The operation to run, or `UnsupportedOperation` for fetches.
    pub fn operation(&self) -> Result<ProtocolOperation, BridgeError> {
        match (self.service, self.advertise) {
            (Service::UploadPack, _) => Err(BridgeError::UnsupportedOperation),
            (Service::ReceivePack, true) => Ok(ProtocolOperation::AdvertiseRefs),
            (Service::ReceivePack, false) => Ok(ProtocolOperation::ReceivePack),
        }
    }
}

/// Validate method, URL and repository identifier, in that order.
///
/// `uri` is the request target including the query string.
pub fn classify(
    method: &Method,
    uri: &str,
    repo_id: Option<&str>,
) -> Result<RequestShape, BridgeError> {
    let (advertise, service) = if *method == Method::GET {
        (true, match_advertisement(uri).ok_or(BridgeError::InvalidOperation)?)
    } else if *method == Method::POST {
        (false, match_rpc(uri).ok_or(BridgeError::InvalidOperation)?)
    } else {
        return Err(BridgeError::InvalidMethod);
    };

    let repo_id = match repo_id {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => return Err(BridgeError::InvalidRepository),
    };

    Ok(RequestShape {
        advertise,
        service,
        repo_id,
    })
}

/// `.../info/refs?service=git-(receive|upload)-pack` anywhere in the target.
fn match_advertisement(uri: &str) -> Option<Service> {
    const NEEDLE: &str = "/info/refs?service=git-";
    uri.match_indices(NEEDLE)
        .find_map(|(at, _)| service_suffix(&uri[at + NEEDLE.len()..]))
}

/// `.../git-(receive|upload)-pack` anywhere in the target.
fn match_rpc(uri: &str) -> Option<Service> {
    const NEEDLE: &str = "/git-";
    uri.match_indices(NEEDLE)
        .find_map(|(at, _)| service_suffix(&uri[at + NEEDLE.len()..]))
}

fn service_suffix(rest: &str) -> Option<Service> {
    let (name, _) = rest.split_once("-pack")?;
    Service::parse(name)
}
