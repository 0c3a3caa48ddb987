//! Secure-transport capability used by every use case.
//!
//! The transport performs the network I/O and cryptographic handshake; this
//! crate only orchestrates it.  Infrastructure provides implementations
//! (the simulated transport in `infrastructure::simulated`, or a vendor
//! binding), tests provide recording doubles.
//!
//! # Connecting
//!
//! ```text
//! ConnectTarget { product_id, device_id, credential, direct candidates }
//!        │
//!        ▼
//! SecureTransport::connect ──► Arc<dyn SecureConnection>
//!        │                         ├─ peer_fingerprint()
//!        │                         ├─ query(path)
//!        │                         ├─ open_tunnel / close_tunnel
//!        │                         └─ close()
//!        └─► TransportError::NoChannels { local, remote }
//! ```
//!
//! When no path to the device works, both the local (direct/LAN) and the
//! remote (relayed) channel report why, and both reasons are kept.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_core::protocol::{paths, QueryResponse};
use edge_core::{DeviceRecord, Fingerprint};
use thiserror::Error;

use super::connect_device::ClientIdentity;

/// Why one transport channel did not yield a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel was not tried (e.g. no direct candidate configured).
    #[error("not attempted")]
    NotAttempted,
    /// The device is not attached to the rendezvous service.
    #[error("device not attached")]
    NotAttached,
    /// The device was not found on this channel.
    #[error("device not found")]
    NotFound,
    /// The channel was refused (bad credential, forbidden).
    #[error("refused")]
    Refused,
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Errors reported by the secure transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No viable path to the device.
    #[error("no viable channel (local: {local}; remote: {remote})")]
    NoChannels {
        local: ChannelError,
        remote: ChannelError,
    },
    /// The connect did not finish within the caller-supplied timeout.
    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
    /// The transport could not open or close a tunnel binding.
    #[error("tunnel error: {0}")]
    Tunnel(String),
    #[error("transport I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Everything the transport needs to reach one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub product_id: String,
    pub device_id: String,
    /// Client private key (PEM).
    pub private_key: String,
    /// Rendezvous server override; `None` uses the transport's default.
    pub server_url: Option<String>,
    pub server_connect_token: String,
    /// Extra direct candidates tried alongside the relayed path.  Never
    /// exclusive: the relay stays available.
    pub direct_candidates: Vec<String>,
}

impl ConnectTarget {
    /// Builds a target for `device` using the client's identity.
    pub fn for_device(device: &DeviceRecord, identity: &ClientIdentity) -> Self {
        let mut target = Self {
            product_id: device.product_id.clone(),
            device_id: device.device_id.clone(),
            private_key: identity.private_key.clone(),
            server_url: identity.server_url.clone(),
            server_connect_token: device.server_connect_token.clone(),
            direct_candidates: Vec::new(),
        };
        if let Some(host) = &device.direct_candidate_host {
            target.add_direct_candidate(host.clone());
        }
        target
    }

    pub fn add_direct_candidate(&mut self, host: impl Into<String>) {
        let host = host.into();
        if !host.trim().is_empty() && !self.direct_candidates.contains(&host) {
            self.direct_candidates.push(host);
        }
    }
}

/// Transport-assigned handle for one tunnel binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelBinding {
    pub id: u64,
    pub bound_local_port: u16,
}

/// Factory for secure connections.
#[async_trait]
pub trait SecureTransport: Send + Sync {
    /// Connects to the device described by `target`.
    ///
    /// Resolves once the handshake finished and the peer fingerprint is known.
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Arc<dyn SecureConnection>, TransportError>;
}

/// One established secure connection.
#[async_trait]
pub trait SecureConnection: Send + Sync {
    /// Fingerprint of the public key the device presented in the handshake.
    fn peer_fingerprint(&self) -> Fingerprint;

    /// Sends a GET-style query for `path`.
    async fn query(&self, path: &str) -> Result<QueryResponse, TransportError>;

    /// Queries the list of forwardable service ids.
    async fn query_service_list(&self) -> Result<QueryResponse, TransportError> {
        self.query(paths::TUNNEL_SERVICES).await
    }

    /// Queries the detail record of one service.
    async fn query_service_detail(&self, id: &str) -> Result<QueryResponse, TransportError> {
        self.query(&paths::service_detail(id)).await
    }

    /// Binds `local_port` (0 = any) and starts forwarding it to `service`.
    async fn open_tunnel(
        &self,
        service: &str,
        local_port: u16,
    ) -> Result<TunnelBinding, TransportError>;

    /// Stops forwarding and releases the local port of `binding`.
    async fn close_tunnel(&self, binding: &TunnelBinding) -> Result<(), TransportError>;

    /// Closes the connection.  Calling it twice is harmless.
    async fn close(&self);
}
