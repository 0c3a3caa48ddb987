//! The live connection handle produced by the Connector.
//!
//! A [`ConnectionHandle`] only exists for a connection that reached `Ready`.
//! It owns the tunnel sessions opened over it; closing the handle closes
//! every tunnel first and then the transport connection.  Closing twice is a
//! no-op.
//!
//! The handle must be closed explicitly with [`ConnectionHandle::close`];
//! dropping it releases the transport connection object but cannot perform
//! an orderly asynchronous shutdown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use edge_core::{DeviceKey, DeviceRecord, Fingerprint, User};
use tracing::info;
use uuid::Uuid;

use super::connect_device::ConnectionState;
use super::transport::SecureConnection;
use super::tunnel_sessions::{DrainReport, TunnelSessionManager};

pub struct ConnectionHandle {
    id: Uuid,
    device: DeviceRecord,
    peer_fingerprint: Fingerprint,
    user: User,
    connection: Arc<dyn SecureConnection>,
    closed: Arc<AtomicBool>,
    tunnels: TunnelSessionManager,
}

impl ConnectionHandle {
    pub(crate) fn new(
        device: DeviceRecord,
        connection: Arc<dyn SecureConnection>,
        peer_fingerprint: Fingerprint,
        user: User,
    ) -> Self {
        let id = Uuid::new_v4();
        let closed = Arc::new(AtomicBool::new(false));
        let tunnels = TunnelSessionManager::new(id, Arc::clone(&connection), Arc::clone(&closed));
        Self {
            id,
            device,
            peer_fingerprint,
            user,
            connection,
            closed,
            tunnels,
        }
    }

    /// Random identifier of this connection, for logs and tunnel ownership.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device(&self) -> &DeviceRecord {
        &self.device
    }

    pub fn device_key(&self) -> DeviceKey {
        self.device.key()
    }

    /// Fingerprint the device presented (equal to the pinned one).
    pub fn peer_fingerprint(&self) -> &Fingerprint {
        &self.peer_fingerprint
    }

    /// The user this client is authorized as.
    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else {
            ConnectionState::Ready
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Tunnel sessions bound to this connection.
    pub fn tunnels(&self) -> &TunnelSessionManager {
        &self.tunnels
    }

    pub(crate) fn secure_connection(&self) -> &Arc<dyn SecureConnection> {
        &self.connection
    }

    /// Closes every tunnel, then the transport connection.
    ///
    /// Returns the drain report of the tunnel teardown; a second call returns
    /// an empty report and touches nothing.
    pub async fn close(&self) -> DrainReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return DrainReport::default();
        }
        let report = self.tunnels.close_all().await;
        self.connection.close().await;
        info!(
            device = %self.device.key(),
            connection = %self.id,
            tunnels_closed = report.closed.len(),
            tunnels_failed = report.failed.len(),
            "connection closed"
        );
        report
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("device", &self.device.key())
            .field("user", &self.user.username)
            .field("state", &self.state())
            .finish()
    }
}
