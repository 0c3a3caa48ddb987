//! Response envelope for queries sent to a device.
//!
//! Devices answer resource queries CoAP-style: a numeric status code, an
//! optional content format, and an opaque payload.  The client only accepts
//! `205 Content` with a JSON payload as a successful answer.

/// Status codes the client distinguishes.
pub mod status {
    /// 2.05 Content.
    pub const CONTENT: u16 = 205;
    /// 4.00 Bad Request.
    pub const BAD_REQUEST: u16 = 400;
    /// 4.03 Forbidden.
    pub const FORBIDDEN: u16 = 403;
    /// 4.04 Not Found.
    pub const NOT_FOUND: u16 = 404;
}

/// Content-format identifiers.
pub mod content_format {
    pub const JSON: u16 = 50;
    pub const CBOR: u16 = 60;
}

/// Well-known resource paths on the device.
pub mod paths {
    /// Identity of the caller; `404` when the client is not paired.
    pub const IAM_ME: &str = "/iam/me";
    /// Self-description of the device.
    pub const IAM_PAIRING: &str = "/iam/pairing";
    /// List of forwardable service ids.
    pub const TUNNEL_SERVICES: &str = "/tcp-tunnels/services";

    /// Detail record for one service.
    pub fn service_detail(id: &str) -> String {
        format!("{TUNNEL_SERVICES}/{id}")
    }
}

/// A device's answer to a resource query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub status: u16,
    pub content_format: Option<u16>,
    pub payload: Vec<u8>,
}

impl QueryResponse {
    /// A `205 Content` response carrying a JSON payload.
    pub fn json(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status: status::CONTENT,
            content_format: Some(content_format::JSON),
            payload: payload.into(),
        }
    }

    /// A response with no payload.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_format: None,
            payload: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == status::CONTENT
    }
}
