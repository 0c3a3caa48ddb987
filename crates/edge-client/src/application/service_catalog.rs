//! ServiceCatalog: lists the services a connected device exposes.
//!
//! Listing is two-staged: first the id list, then one detail query per id.
//! The id list must be a clean `205` JSON answer or the whole listing fails
//! with [`CatalogError::Protocol`].  A detail query that fails to send, or
//! comes back with a bad status or a malformed body, is logged and skipped,
//! so one broken entry never hides the good ones.
//!
//! The last successful listing is cached per connection.  A refresh replaces
//! the cached catalog wholesale; a failed refresh leaves it untouched.

use edge_core::domain::service::UNKNOWN;
use edge_core::protocol::{decode_service_detail, decode_service_ids};
use edge_core::{PayloadError, ServiceDescriptor};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::ConnectionHandle;
use super::transport::TransportError;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// The service list query returned an unexpected status or encoding.
    #[error("protocol error: {0}")]
    Protocol(#[from] PayloadError),
    #[error("connection {0} is closed")]
    ConnectionClosed(Uuid),
}

#[derive(Default)]
pub struct ServiceCatalog {
    cache: Mutex<Option<(Uuid, Vec<ServiceDescriptor>)>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries the device behind `handle` for its services, in the order the
    /// device listed them.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::ConnectionClosed`] if `handle` is no longer ready.
    /// - [`CatalogError::Protocol`] if the id list answer is not a `205`
    ///   JSON array of strings.
    /// - [`CatalogError::Transport`] if the id list query could not be sent.
    pub async fn list(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<ServiceDescriptor>, CatalogError> {
        if !handle.is_ready() {
            return Err(CatalogError::ConnectionClosed(handle.id()));
        }
        let connection = handle.secure_connection();

        let response = connection.query_service_list().await?;
        let ids = decode_service_ids(&response)?;
        debug!(device = %handle.device_key(), count = ids.len(), "service ids listed");

        let mut services = Vec::with_capacity(ids.len());
        for id in ids {
            let response = match connection.query_service_detail(&id).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(device = %handle.device_key(), service = %id, "skipping service entry, detail query failed: {e}");
                    continue;
                }
            };
            match decode_service_detail(&response) {
                Ok(mut service) => {
                    if service.id == UNKNOWN {
                        service.id = id;
                    }
                    services.push(service);
                }
                Err(e) => {
                    warn!(device = %handle.device_key(), service = %id, "skipping service entry: {e}");
                }
            }
        }

        *self.cache.lock().await = Some((handle.id(), services.clone()));
        Ok(services)
    }

    /// Last successful listing for `handle`, if any.
    pub async fn cached(&self, handle: &ConnectionHandle) -> Option<Vec<ServiceDescriptor>> {
        match &*self.cache.lock().await {
            Some((id, services)) if *id == handle.id() => Some(services.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::application::transport::testing::RecordingConnection;
    use edge_core::protocol::{encode_service_detail, paths, status, QueryResponse};
    use edge_core::{DeviceRecord, Fingerprint, User};

    fn fingerprint() -> Fingerprint {
        Fingerprint::from_bytes([3u8; 32])
    }

    fn make_handle(connection: RecordingConnection) -> ConnectionHandle {
        let device = DeviceRecord {
            product_id: "pr-1".to_string(),
            device_id: "de-1".to_string(),
            friendly_name: String::new(),
            direct_candidate_host: None,
            pinned_fingerprint: Some(fingerprint()),
            server_connect_token: "sct".to_string(),
        };
        ConnectionHandle::new(device, Arc::new(connection), fingerprint(), User::named("alice"))
    }

    fn detail(service: &ServiceDescriptor) -> QueryResponse {
        encode_service_detail(service).unwrap()
    }

    fn two_service_connection() -> RecordingConnection {
        let cam = ServiceDescriptor::new("cam1", "rtsp", "10.0.0.5", 8554);
        let ssh = ServiceDescriptor::new("ssh", "ssh", "127.0.0.1", 22);
        RecordingConnection::new(fingerprint())
            .with_response(paths::TUNNEL_SERVICES, QueryResponse::json(br#"["cam1","ssh"]"#.to_vec()))
            .with_response(&paths::service_detail("cam1"), detail(&cam))
            .with_response(&paths::service_detail("ssh"), detail(&ssh))
    }

    #[tokio::test]
    async fn test_list_returns_services_in_device_order() {
        let handle = make_handle(two_service_connection());
        let catalog = ServiceCatalog::new();

        let services = catalog.list(&handle).await.unwrap();

        let ids: Vec<&str> = services.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["cam1", "ssh"]);
        assert_eq!(services[0].port, 8554);
    }

    #[tokio::test]
    async fn test_malformed_detail_is_skipped() {
        let connection = two_service_connection()
            .with_response(&paths::service_detail("cam1"), QueryResponse::json(b"[1,2]".to_vec()));
        let handle = make_handle(connection);

        let services = ServiceCatalog::new().list(&handle).await.unwrap();

        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "ssh");
    }

    #[tokio::test]
    async fn test_detail_query_failure_skips_only_that_entry() {
        let connection = two_service_connection().with_failing_query(&paths::service_detail("cam1"));
        let handle = make_handle(connection);

        let services = ServiceCatalog::new().list(&handle).await.unwrap();

        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "ssh");
    }

    #[tokio::test]
    async fn test_missing_detail_is_skipped() {
        let connection = RecordingConnection::new(fingerprint())
            .with_response(paths::TUNNEL_SERVICES, QueryResponse::json(br#"["gone"]"#.to_vec()));
        let handle = make_handle(connection);

        let services = ServiceCatalog::new().list(&handle).await.unwrap();

        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn test_detail_without_id_takes_listed_id() {
        let connection = RecordingConnection::new(fingerprint())
            .with_response(paths::TUNNEL_SERVICES, QueryResponse::json(br#"["http"]"#.to_vec()))
            .with_response(
                &paths::service_detail("http"),
                QueryResponse::json(br#"{"Type":"http","Port":80}"#.to_vec()),
            );
        let handle = make_handle(connection);

        let services = ServiceCatalog::new().list(&handle).await.unwrap();

        assert_eq!(services[0].id, "http");
        assert_eq!(services[0].host, UNKNOWN);
        assert_eq!(services[0].to_string(), "http http Unknown:80");
    }

    #[tokio::test]
    async fn test_failed_id_list_is_protocol_error() {
        let connection = RecordingConnection::new(fingerprint())
            .with_response(paths::TUNNEL_SERVICES, QueryResponse::empty(status::FORBIDDEN));
        let handle = make_handle(connection);

        let err = ServiceCatalog::new().list(&handle).await.unwrap_err();

        assert!(matches!(
            err,
            CatalogError::Protocol(PayloadError::UnexpectedStatus(403))
        ));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_cache() {
        let handle = make_handle(two_service_connection());
        let catalog = ServiceCatalog::new();
        let first = catalog.list(&handle).await.unwrap();

        handle.close().await;
        let err = catalog.list(&handle).await.unwrap_err();

        assert!(matches!(err, CatalogError::ConnectionClosed(_)));
        assert_eq!(catalog.cached(&handle).await, Some(first));
    }

    #[tokio::test]
    async fn test_cache_is_scoped_to_connection() {
        let catalog = ServiceCatalog::new();
        let first = make_handle(two_service_connection());
        let second = make_handle(two_service_connection());
        catalog.list(&first).await.unwrap();

        assert!(catalog.cached(&first).await.is_some());
        assert!(catalog.cached(&second).await.is_none());
    }

    #[tokio::test]
    async fn test_query_failure_is_transport_error() {
        let mut connection = two_service_connection();
        connection.fail_queries = true;
        let handle = make_handle(connection);

        let err = ServiceCatalog::new().list(&handle).await.unwrap_err();

        assert!(matches!(err, CatalogError::Transport(TransportError::Closed)));
    }
}
