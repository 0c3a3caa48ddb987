//! In-process secure transport for development and tests.
//!
//! Devices are registered up front with their fingerprint, paired users,
//! reachability, and service catalog.  Queries are answered from that
//! description with the same status codes and JSON payloads a real device
//! returns, so the application layer cannot tell the difference.
//!
//! Tunnels are real: opening one binds a TCP listener on `127.0.0.1`
//! (port 0 lets the OS pick) and forwards every accepted stream to the
//! service's `host:port` with `copy_bidirectional`.  Closing the tunnel
//! aborts the listener task, which also aborts its forwarded streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use edge_core::protocol::{encode_json, encode_service_detail, paths, status, QueryResponse};
use edge_core::{DeviceKey, Fingerprint, PairingInfo, PayloadError, ServiceDescriptor, User};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::application::transport::{
    ChannelError, ConnectTarget, SecureConnection, SecureTransport, TransportError, TunnelBinding,
};

/// Description of one simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    key: DeviceKey,
    fingerprint: Fingerprint,
    /// Paired users, keyed by the client private key that identifies them.
    users: HashMap<String, User>,
    /// Service ids in listing order.
    listing: Vec<String>,
    services: HashMap<String, ServiceDescriptor>,
    raw_details: HashMap<String, QueryResponse>,
    pairing_info: Option<PairingInfo>,
    latency: Duration,
    unreachable: Option<(ChannelError, ChannelError)>,
    required_token: Option<String>,
}

impl SimulatedDevice {
    pub fn new(
        product_id: impl Into<String>,
        device_id: impl Into<String>,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            key: DeviceKey::new(product_id, device_id),
            fingerprint,
            users: HashMap::new(),
            listing: Vec::new(),
            services: HashMap::new(),
            raw_details: HashMap::new(),
            pairing_info: None,
            latency: Duration::ZERO,
            unreachable: None,
            required_token: None,
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// Pairs the client identified by `private_key` as `user`.
    pub fn with_user(mut self, private_key: impl Into<String>, user: User) -> Self {
        self.users.insert(private_key.into(), user);
        self
    }

    pub fn with_service(mut self, service: ServiceDescriptor) -> Self {
        self.list(&service.id);
        self.services.insert(service.id.clone(), service);
        self
    }

    /// Lists `id` and answers its detail query with `response` verbatim.
    pub fn with_raw_service(mut self, id: impl Into<String>, response: QueryResponse) -> Self {
        let id = id.into();
        self.list(&id);
        self.raw_details.insert(id, response);
        self
    }

    pub fn with_pairing_info(mut self, info: PairingInfo) -> Self {
        self.pairing_info = Some(info);
        self
    }

    /// Delays every connect by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every connect fail with the given channel errors.
    pub fn unreachable(mut self, local: ChannelError, remote: ChannelError) -> Self {
        self.unreachable = Some((local, remote));
        self
    }

    /// Refuses connects that do not present `token`.
    pub fn requiring_token(mut self, token: impl Into<String>) -> Self {
        self.required_token = Some(token.into());
        self
    }

    fn list(&mut self, id: &str) {
        if !self.listing.iter().any(|listed| listed == id) {
            self.listing.push(id.to_string());
        }
    }

    fn default_pairing_info(&self) -> PairingInfo {
        PairingInfo {
            product_id: self.key.product_id.clone(),
            device_id: self.key.device_id.clone(),
            friendly_name: String::new(),
            app_name: None,
            app_version: None,
            nabto_version: "simulated".to_string(),
            pairing_modes: Vec::new(),
        }
    }
}

/// A [`SecureTransport`] backed by a fixed set of [`SimulatedDevice`]s.
pub struct SimulatedTransport {
    devices: HashMap<DeviceKey, Arc<SimulatedDevice>>,
}

impl SimulatedTransport {
    pub fn new(devices: impl IntoIterator<Item = SimulatedDevice>) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| (d.key.clone(), Arc::new(d)))
            .collect();
        Self { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[async_trait]
impl SecureTransport for SimulatedTransport {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Arc<dyn SecureConnection>, TransportError> {
        let key = DeviceKey::new(target.product_id.clone(), target.device_id.clone());
        let Some(device) = self.devices.get(&key) else {
            let local = if target.direct_candidates.is_empty() {
                ChannelError::NotAttempted
            } else {
                ChannelError::NotFound
            };
            return Err(TransportError::NoChannels {
                local,
                remote: ChannelError::NotAttached,
            });
        };

        if !device.latency.is_zero() {
            tokio::time::sleep(device.latency).await;
        }
        if let Some((local, remote)) = &device.unreachable {
            return Err(TransportError::NoChannels {
                local: local.clone(),
                remote: remote.clone(),
            });
        }
        if let Some(token) = &device.required_token {
            if *token != target.server_connect_token {
                return Err(TransportError::NoChannels {
                    local: ChannelError::NotAttempted,
                    remote: ChannelError::Refused,
                });
            }
        }

        let user = device.users.get(&target.private_key).cloned();
        debug!(device = %key, paired = user.is_some(), "simulated connect");
        Ok(Arc::new(SimulatedConnection::new(Arc::clone(device), user)))
    }
}

/// One connection to a simulated device.
pub struct SimulatedConnection {
    device: Arc<SimulatedDevice>,
    user: Option<User>,
    closed: AtomicBool,
    next_binding: AtomicU64,
    tunnels: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl SimulatedConnection {
    fn new(device: Arc<SimulatedDevice>, user: Option<User>) -> Self {
        Self {
            device,
            user,
            closed: AtomicBool::new(false),
            next_binding: AtomicU64::new(1),
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    fn answer(&self, path: &str) -> Result<QueryResponse, PayloadError> {
        let device = &self.device;
        match path {
            paths::IAM_ME => match &self.user {
                Some(user) => encode_json(user),
                None => Ok(QueryResponse::empty(status::NOT_FOUND)),
            },
            paths::IAM_PAIRING => match &device.pairing_info {
                Some(info) => encode_json(info),
                None => encode_json(&device.default_pairing_info()),
            },
            paths::TUNNEL_SERVICES if self.user.is_none() => Ok(QueryResponse::empty(status::FORBIDDEN)),
            paths::TUNNEL_SERVICES => encode_json(&device.listing),
            _ => {
                let Some(id) = path
                    .strip_prefix(paths::TUNNEL_SERVICES)
                    .and_then(|rest| rest.strip_prefix('/'))
                else {
                    return Ok(QueryResponse::empty(status::NOT_FOUND));
                };
                if self.user.is_none() {
                    return Ok(QueryResponse::empty(status::FORBIDDEN));
                }
                if let Some(raw) = device.raw_details.get(id) {
                    return Ok(raw.clone());
                }
                match device.services.get(id) {
                    Some(service) => encode_service_detail(service),
                    None => Ok(QueryResponse::empty(status::NOT_FOUND)),
                }
            }
        }
    }

    fn tunnels(&self) -> std::sync::MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SecureConnection for SimulatedConnection {
    fn peer_fingerprint(&self) -> Fingerprint {
        self.device.fingerprint.clone()
    }

    async fn query(&self, path: &str) -> Result<QueryResponse, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.answer(path)
            .map_err(|e| TransportError::Io(format!("encoding simulated answer: {e}")))
    }

    async fn open_tunnel(
        &self,
        service: &str,
        local_port: u16,
    ) -> Result<TunnelBinding, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.user.is_none() {
            return Err(TransportError::Tunnel("client is not authorized".to_string()));
        }
        let Some(descriptor) = self.device.services.get(service) else {
            return Err(TransportError::Tunnel(format!("unknown service {service:?}")));
        };

        let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
        let bound_local_port = listener.local_addr()?.port();
        let target = format!("{}:{}", descriptor.host, descriptor.port);
        let binding = TunnelBinding {
            id: self.next_binding.fetch_add(1, Ordering::Relaxed),
            bound_local_port,
        };

        info!(service, port = bound_local_port, target = %target, "simulated tunnel listening");
        let task = tokio::spawn(forward_loop(listener, target));
        self.tunnels().insert(binding.id, task);
        Ok(binding)
    }

    async fn close_tunnel(&self, binding: &TunnelBinding) -> Result<(), TransportError> {
        match self.tunnels().remove(&binding.id) {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(TransportError::Tunnel(format!(
                "no tunnel binding {} on port {}",
                binding.id, binding.bound_local_port
            ))),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, task) in self.tunnels().drain() {
            task.abort();
        }
    }
}

impl Drop for SimulatedConnection {
    fn drop(&mut self) {
        for (_, task) in self.tunnels().drain() {
            task.abort();
        }
    }
}

/// Accepts local clients and pipes each one to `target`.
///
/// Forwarded streams live in a `JoinSet`, so aborting this task aborts them.
async fn forward_loop(listener: TcpListener, target: String) {
    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut inbound, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(target = %target, "tunnel accept failed: {e}");
                        break;
                    }
                };
                let target = target.clone();
                streams.spawn(async move {
                    let mut outbound = match TcpStream::connect(&target).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(target = %target, "tunnel target unreachable: {e}");
                            return;
                        }
                    };
                    match copy_bidirectional(&mut inbound, &mut outbound).await {
                        Ok((up, down)) => debug!(%peer, up, down, "tunnel stream finished"),
                        Err(e) => debug!(%peer, "tunnel stream ended: {e}"),
                    }
                });
            }
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
        }
    }
}
