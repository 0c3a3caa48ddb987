//! TunnelSessionManager: the TCP tunnels bound to one connection.
//!
//! Each tunnel forwards one local TCP port to a named service on the device.
//! The manager keeps the live set keyed by bound local port, so at most one
//! session exists per `(connection, bound port)` pair.
//!
//! # Serialisation
//!
//! Opens and closes take the per-connection table lock for their whole
//! duration, including the transport call.  Two concurrent opens therefore
//! never race on the port-uniqueness check.
//!
//! # Teardown
//!
//! - `close_by_local_port` closes one binding; if the transport refuses, the
//!   session stays in the live set untouched.
//! - `close_all` drains the table: every session is removed, failures are
//!   logged and reported in the [`DrainReport`], and one failure never stops
//!   the remaining closes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use edge_core::{ServiceSpec, ServiceSpecError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::transport::{SecureConnection, TransportError, TunnelBinding};

/// Error type for tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Malformed request (`InvalidPortFormat` / `InvalidServiceName`).
    #[error("invalid tunnel request: {0}")]
    InvalidRequest(#[from] ServiceSpecError),
    #[error("connection {0} is closed")]
    ConnectionClosed(Uuid),
    #[error("no tunnel bound to local port {0}")]
    NotFound(u16),
    #[error("local port {0} is already used by another tunnel on this connection")]
    PortInUse(u16),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

/// One open local-port-to-service binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSession {
    pub service: String,
    /// Port asked for; `0` means any.
    pub requested_local_port: u16,
    /// Port actually bound.
    pub bound_local_port: u16,
    /// Connection the tunnel belongs to.
    pub connection_id: Uuid,
    pub binding: TunnelBinding,
}

/// Outcome of [`TunnelSessionManager::close_all`].
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Ports closed cleanly.
    pub closed: Vec<u16>,
    /// Ports whose close failed; they were removed regardless.
    pub failed: Vec<(u16, TransportError)>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct TunnelSessionManager {
    connection_id: Uuid,
    connection: Arc<dyn SecureConnection>,
    closed: Arc<AtomicBool>,
    sessions: Mutex<BTreeMap<u16, TunnelSession>>,
}

impl TunnelSessionManager {
    pub(crate) fn new(
        connection_id: Uuid,
        connection: Arc<dyn SecureConnection>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection_id,
            connection,
            closed,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens a tunnel from `requested_local_port` (0 = any) to `service`.
    ///
    /// `service` may also be written `name:port`; see [`ServiceSpec::new`].
    ///
    /// # Errors
    ///
    /// - [`TunnelError::InvalidRequest`] for an empty service name or bad
    ///   port text, before any network call.
    /// - [`TunnelError::ConnectionClosed`] when the connection is not ready.
    /// - [`TunnelError::PortInUse`] when the port is already bound here.
    /// - [`TunnelError::Transport`] when the transport cannot bind or forward.
    ///
    /// On error nothing is recorded and no local port is held.
    pub async fn open(
        &self,
        service: &str,
        requested_local_port: u16,
    ) -> Result<TunnelSession, TunnelError> {
        let spec = ServiceSpec::new(service, requested_local_port)?;
        self.open_validated(spec).await
    }

    /// Opens a tunnel from a `name` or `name:port` request.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open); unparsable port text is
    /// `InvalidRequest(InvalidPortFormat)`.
    pub async fn open_spec(&self, spec: &str) -> Result<TunnelSession, TunnelError> {
        let spec: ServiceSpec = spec.parse()?;
        self.open_validated(spec).await
    }

    async fn open_validated(&self, spec: ServiceSpec) -> Result<TunnelSession, TunnelError> {
        let mut sessions = self.sessions.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::ConnectionClosed(self.connection_id));
        }
        if spec.local_port != 0 && sessions.contains_key(&spec.local_port) {
            return Err(TunnelError::PortInUse(spec.local_port));
        }

        let binding = self
            .connection
            .open_tunnel(&spec.service, spec.local_port)
            .await?;
        let bound = binding.bound_local_port;
        if sessions.contains_key(&bound) {
            // The transport handed out a port we already track; undo the binding.
            if let Err(e) = self.connection.close_tunnel(&binding).await {
                warn!(port = bound, "failed to release duplicate tunnel binding: {e}");
            }
            return Err(TunnelError::PortInUse(bound));
        }

        let session = TunnelSession {
            service: spec.service,
            requested_local_port: spec.local_port,
            bound_local_port: bound,
            connection_id: self.connection_id,
            binding,
        };
        sessions.insert(bound, session.clone());
        info!(
            connection = %self.connection_id,
            service = %session.service,
            port = bound,
            "tunnel opened"
        );
        Ok(session)
    }

    /// Closes the tunnel bound to `bound_local_port`.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::NotFound`] if no such tunnel is open; the live set is
    ///   unchanged.
    /// - [`TunnelError::Transport`] if the transport refuses to close; the
    ///   session stays open and listed.
    pub async fn close_by_local_port(&self, bound_local_port: u16) -> Result<(), TunnelError> {
        let mut sessions = self.sessions.lock().await;
        let binding = sessions
            .get(&bound_local_port)
            .map(|s| s.binding)
            .ok_or(TunnelError::NotFound(bound_local_port))?;
        self.connection.close_tunnel(&binding).await?;
        sessions.remove(&bound_local_port);
        info!(connection = %self.connection_id, port = bound_local_port, "tunnel closed");
        Ok(())
    }

    /// Closes every tunnel on this connection, best effort.
    pub async fn close_all(&self) -> DrainReport {
        let mut sessions = self.sessions.lock().await;
        let drained = std::mem::take(&mut *sessions);
        let mut report = DrainReport::default();
        for (port, session) in drained {
            match self.connection.close_tunnel(&session.binding).await {
                Ok(()) => report.closed.push(port),
                Err(e) => {
                    warn!(
                        connection = %self.connection_id,
                        port,
                        service = %session.service,
                        "tunnel close failed during drain: {e}"
                    );
                    report.failed.push((port, e));
                }
            }
        }
        report
    }

    /// Snapshot of the live sessions, ordered by bound port.
    pub async fn sessions(&self) -> Vec<TunnelSession> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, bound_local_port: u16) -> Option<TunnelSession> {
        self.sessions.lock().await.get(&bound_local_port).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::transport::testing::RecordingConnection;
    use edge_core::Fingerprint;
    use tokio_test::assert_ok;

    fn make_connection() -> RecordingConnection {
        RecordingConnection::new(Fingerprint::from_bytes([9u8; 32]))
    }

    fn make_manager(connection: Arc<RecordingConnection>) -> TunnelSessionManager {
        TunnelSessionManager::new(Uuid::new_v4(), connection, Arc::new(AtomicBool::new(false)))
    }

    #[tokio::test]
    async fn test_two_any_port_opens_get_distinct_ports() {
        let mgr = make_manager(Arc::new(make_connection()));

        let a = assert_ok!(mgr.open("ssh", 0).await);
        let b = assert_ok!(mgr.open("ssh", 0).await);

        assert_ne!(a.bound_local_port, b.bound_local_port);
        assert_eq!(mgr.len().await, 2);
    }

    #[tokio::test]
    async fn test_open_spec_uses_fixed_port() {
        let mgr = make_manager(Arc::new(make_connection()));

        let session = assert_ok!(mgr.open_spec("ssh:2222").await);

        assert_eq!(session.service, "ssh");
        assert_eq!(session.requested_local_port, 2222);
        assert_eq!(session.bound_local_port, 2222);
    }

    #[tokio::test]
    async fn test_open_spec_with_bad_port_makes_no_transport_call() {
        let connection = Arc::new(make_connection());
        let mgr = make_manager(Arc::clone(&connection));

        let err = mgr.open_spec("ssh:abc").await.unwrap_err();

        assert!(matches!(
            err,
            TunnelError::InvalidRequest(ServiceSpecError::InvalidPortFormat(_))
        ));
        assert!(connection.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_splits_name_with_port() {
        let connection = Arc::new(make_connection());
        let mgr = make_manager(Arc::clone(&connection));

        let session = assert_ok!(mgr.open("ssh:2222", 0).await);

        assert_eq!(session.service, "ssh");
        assert_eq!(session.bound_local_port, 2222);
    }

    #[tokio::test]
    async fn test_open_with_text_port_makes_no_transport_call() {
        let connection = Arc::new(make_connection());
        let mgr = make_manager(Arc::clone(&connection));

        let err = mgr.open("ssh:abc", 0).await.unwrap_err();

        assert!(matches!(
            err,
            TunnelError::InvalidRequest(ServiceSpecError::InvalidPortFormat(_))
        ));
        assert!(connection.opened.lock().unwrap().is_empty());
        assert!(mgr.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_on_one_port_admit_exactly_one() {
        let connection = Arc::new(make_connection());
        let mgr = Arc::new(make_manager(Arc::clone(&connection)));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.open(&format!("svc{i}"), 2222).await })
            })
            .collect();
        let mut opened = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(session) => {
                    assert_eq!(session.bound_local_port, 2222);
                    opened += 1;
                }
                Err(e) => assert!(matches!(e, TunnelError::PortInUse(2222)), "got {e:?}"),
            }
        }

        assert_eq!(opened, 1);
        assert_eq!(mgr.len().await, 1);
        assert_eq!(connection.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_closes_of_one_port_succeed_once() {
        let connection = Arc::new(make_connection());
        let mgr = Arc::new(make_manager(Arc::clone(&connection)));
        assert_ok!(mgr.open("ssh", 2222).await);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.close_by_local_port(2222).await })
            })
            .collect();
        let mut closed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => closed += 1,
                Err(e) => assert!(matches!(e, TunnelError::NotFound(2222)), "got {e:?}"),
            }
        }

        assert_eq!(closed, 1);
        assert_eq!(connection.closed_bindings.lock().unwrap().len(), 1);
        assert!(mgr.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_empty_service_is_invalid_service_name() {
        let mgr = make_manager(Arc::new(make_connection()));
        let err = mgr.open("", 0).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::InvalidRequest(ServiceSpecError::InvalidServiceName)
        ));
    }

    #[tokio::test]
    async fn test_failed_open_records_nothing() {
        let mut connection = make_connection();
        connection.fail_open = true;
        let mgr = make_manager(Arc::new(connection));

        let err = mgr.open("ssh", 0).await.unwrap_err();

        assert!(matches!(err, TunnelError::Transport(_)));
        assert!(mgr.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_same_fixed_port_twice_is_port_in_use() {
        let connection = Arc::new(make_connection());
        let mgr = make_manager(Arc::clone(&connection));
        assert_ok!(mgr.open("ssh", 2222).await);

        let err = mgr.open("http", 2222).await.unwrap_err();

        assert!(matches!(err, TunnelError::PortInUse(2222)));
        assert_eq!(connection.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_port_from_transport_is_released() {
        let mut connection = make_connection();
        connection.forced_port = Some(41000);
        let connection = Arc::new(connection);
        let mgr = make_manager(Arc::clone(&connection));
        let first = assert_ok!(mgr.open("ssh", 0).await);

        let err = mgr.open("http", 0).await.unwrap_err();

        assert!(matches!(err, TunnelError::PortInUse(41000)));
        let closed = connection.closed_bindings.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_ne!(closed[0].id, first.binding.id, "the existing tunnel must survive");
        drop(closed);
        assert_eq!(mgr.len().await, 1);
    }

    #[tokio::test]
    async fn test_open_on_closed_connection_is_rejected() {
        let closed = Arc::new(AtomicBool::new(true));
        let mgr = TunnelSessionManager::new(Uuid::new_v4(), Arc::new(make_connection()), closed);
        assert!(matches!(
            mgr.open("ssh", 0).await,
            Err(TunnelError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_by_local_port_removes_session() {
        let mgr = make_manager(Arc::new(make_connection()));
        let session = assert_ok!(mgr.open("ssh", 0).await);

        assert_ok!(mgr.close_by_local_port(session.bound_local_port).await);

        assert!(mgr.get(session.bound_local_port).await.is_none());
    }

    #[tokio::test]
    async fn test_close_unknown_port_is_not_found_and_leaves_set_unchanged() {
        let mgr = make_manager(Arc::new(make_connection()));
        let kept = assert_ok!(mgr.open("ssh", 0).await);

        let err = mgr.close_by_local_port(1).await.unwrap_err();

        assert!(matches!(err, TunnelError::NotFound(1)));
        assert_eq!(mgr.sessions().await, vec![kept]);
    }

    #[tokio::test]
    async fn test_second_close_is_not_found() {
        let mgr = make_manager(Arc::new(make_connection()));
        let session = assert_ok!(mgr.open("ssh", 0).await);
        let port = session.bound_local_port;

        assert_ok!(mgr.close_by_local_port(port).await);
        let err = mgr.close_by_local_port(port).await.unwrap_err();

        assert!(matches!(err, TunnelError::NotFound(p) if p == port));
    }

    #[tokio::test]
    async fn test_failed_close_keeps_session_listed() {
        let mut connection = make_connection();
        connection.fail_close_ports.insert(2222);
        let mgr = make_manager(Arc::new(connection));
        assert_ok!(mgr.open("ssh", 2222).await);

        let err = mgr.close_by_local_port(2222).await.unwrap_err();

        assert!(matches!(err, TunnelError::Transport(_)));
        assert!(mgr.get(2222).await.is_some());
    }

    #[tokio::test]
    async fn test_close_all_drains_even_when_some_closes_fail() {
        let mut connection = make_connection();
        connection.fail_close_ports.insert(3001);
        let mgr = make_manager(Arc::new(connection));
        for port in [3000, 3001, 3002] {
            assert_ok!(mgr.open("ssh", port).await);
        }

        let report = mgr.close_all().await;

        assert!(mgr.is_empty().await);
        assert_eq!(report.closed, vec![3000, 3002]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 3001);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_sessions_are_ordered_by_port() {
        let mgr = make_manager(Arc::new(make_connection()));
        for port in [5000, 3000, 4000] {
            assert_ok!(mgr.open("svc", port).await);
        }
        let ports: Vec<u16> = mgr.sessions().await.iter().map(|s| s.bound_local_port).collect();
        assert_eq!(ports, vec![3000, 4000, 5000]);
    }
}
