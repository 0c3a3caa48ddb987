//! Connector: drives one device from "known" to "connected and authorized".
//!
//! # Connection lifecycle
//!
//! ```text
//! Idle ──► TransportConnecting ──► FingerprintCheck ──► AuthorizationCheck ──► Ready
//!   │              │                      │                     │
//!   └──────────────┴──────────────────────┴─────────────────────┴──► Failed(kind)
//! ```
//!
//! - `TransportConnecting`: the secure transport is looking for a path to the
//!   device, bounded by the configured connect timeout.
//! - `FingerprintCheck`: the fingerprint the device presented is compared
//!   byte-for-byte with the one pinned at pairing.  A difference is never
//!   retried or accepted.
//! - `AuthorizationCheck`: the device is asked who this client is.  No answer
//!   means the client was never paired, or the pairing was revoked.
//!
//! Each step starts only after the previous one succeeded.  No retries happen
//! here; the caller owns retry policy.  Once the transport is up, every
//! failure closes the transport connection before returning.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_core::{DeviceKey, DeviceRecord, Fingerprint, PairingInfo, PayloadError, User};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::ConnectionHandle;
use super::transport::{ConnectTarget, SecureConnection, SecureTransport, TransportError};

/// Default bound on the transport connect step.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The client's own credentials, supplied by configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Client private key (PEM).
    pub private_key: String,
    /// Optional rendezvous server override.
    pub server_url: Option<String>,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("private_key", &"<redacted>")
            .field("server_url", &self.server_url)
            .finish()
    }
}

/// State of a connection attempt or of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    TransportConnecting,
    FingerprintCheck,
    AuthorizationCheck,
    /// Connected, fingerprint verified, client authorized.
    Ready,
    /// A `Ready` connection that has since been closed.
    Closed,
    Failed(FailureKind),
}

impl ConnectionState {
    /// Returns `true` when moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle, TransportConnecting)
            | (TransportConnecting, FingerprintCheck)
            | (FingerprintCheck, AuthorizationCheck)
            | (AuthorizationCheck, Ready)
            | (Ready, Closed) => true,
            (Idle | TransportConnecting | FingerprintCheck | AuthorizationCheck, Failed(_)) => true,
            _ => false,
        }
    }
}

/// Coarse classification of a failed connect, used for display and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConfigMissing,
    InvalidDevice,
    Transport,
    FingerprintMismatch,
    NotPaired,
    Authorization,
    Cancelled,
}

/// The two ways a fingerprint check can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintMismatch {
    /// No fingerprint was pinned for this device.
    #[error("no fingerprint pinned for this device; it presented {actual}")]
    MissingPinned { actual: Fingerprint },
    /// The device presented a different fingerprint than the pinned one.
    #[error("expected {expected}, device presented {actual}")]
    Differs {
        expected: Fingerprint,
        actual: Fingerprint,
    },
}

/// Errors from the authorization capability.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected answer from {path}: {source}")]
    Payload {
        path: &'static str,
        #[source]
        source: PayloadError,
    },
}

/// Error type for [`Connector::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Required local configuration is absent.  No network call was made.
    #[error("missing configuration: {0}")]
    ConfigMissing(String),
    /// The device record lacks a product id or device id.
    #[error("invalid device record: {0}")]
    InvalidDevice(String),
    /// No viable path to the device, or the connect timed out.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// The device's identity does not match the pinned fingerprint.
    #[error("fingerprint mismatch for {device}: {reason}")]
    FingerprintMismatch {
        device: DeviceKey,
        reason: FingerprintMismatch,
    },
    /// The device does not know this client.
    #[error("client is not paired with {0}")]
    NotPaired(DeviceKey),
    /// The "who am I" query itself failed.
    #[error("authorization check failed: {0}")]
    Authorization(#[from] AuthError),
    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConnectError::ConfigMissing(_) => FailureKind::ConfigMissing,
            ConnectError::InvalidDevice(_) => FailureKind::InvalidDevice,
            ConnectError::Transport(_) => FailureKind::Transport,
            ConnectError::FingerprintMismatch { .. } => FailureKind::FingerprintMismatch,
            ConnectError::NotPaired(_) => FailureKind::NotPaired,
            ConnectError::Authorization(_) => FailureKind::Authorization,
            ConnectError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Authorization capability: asks a connected device about this client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns the user this client is paired as, or `None` when unpaired.
    async fn self_identity(
        &self,
        connection: Arc<dyn SecureConnection>,
    ) -> Result<Option<User>, AuthError>;

    /// Returns the device's self-description.
    async fn pairing_info(
        &self,
        connection: Arc<dyn SecureConnection>,
    ) -> Result<PairingInfo, AuthError>;
}

/// Compares the fingerprint a device presented against the pinned one.
///
/// # Errors
///
/// Returns [`FingerprintMismatch::MissingPinned`] when nothing is pinned and
/// [`FingerprintMismatch::Differs`] when the bytes differ in any position.
pub fn verify_fingerprint(
    pinned: Option<&Fingerprint>,
    actual: &Fingerprint,
) -> Result<(), FingerprintMismatch> {
    match pinned {
        None => Err(FingerprintMismatch::MissingPinned {
            actual: actual.clone(),
        }),
        Some(expected) if expected.matches(actual) => Ok(()),
        Some(expected) => Err(FingerprintMismatch::Differs {
            expected: expected.clone(),
            actual: actual.clone(),
        }),
    }
}

/// Tracks the state of one connect attempt and logs each transition.
struct Attempt {
    device: DeviceKey,
    state: ConnectionState,
}

impl Attempt {
    fn new(device: DeviceKey) -> Self {
        Self {
            device,
            state: ConnectionState::Idle,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        debug!(device = %self.device, from = ?self.state, to = ?next, "connect state");
        self.state = next;
    }
}

/// Connect settings.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Bound on the transport connect step.  Exceeding it is a transport
    /// failure.
    pub connect_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// The Connector use case.
pub struct Connector {
    transport: Arc<dyn SecureTransport>,
    authorizer: Arc<dyn Authorizer>,
    config: ConnectorConfig,
}

impl Connector {
    pub fn new(
        transport: Arc<dyn SecureTransport>,
        authorizer: Arc<dyn Authorizer>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            transport,
            authorizer,
            config,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Connects to `device`, verifies its fingerprint, and checks pairing.
    ///
    /// Cancelling `cancel` abandons the attempt at the next step boundary or
    /// while waiting on the network; any transport connection already made
    /// is closed.
    ///
    /// # Errors
    ///
    /// See [`ConnectError`]; each failure mode has its own variant.
    pub async fn connect(
        &self,
        device: &DeviceRecord,
        identity: &ClientIdentity,
        cancel: &CancellationToken,
    ) -> Result<ConnectionHandle, ConnectError> {
        let mut attempt = Attempt::new(device.key());
        let result = self.run(&mut attempt, device, identity, cancel).await;
        match &result {
            Ok(handle) => info!(device = %attempt.device, connection = %handle.id(), "device ready"),
            Err(e) => {
                attempt.advance(ConnectionState::Failed(e.kind()));
                warn!(device = %attempt.device, "connect failed: {e}");
            }
        }
        result
    }

    async fn run(
        &self,
        attempt: &mut Attempt,
        device: &DeviceRecord,
        identity: &ClientIdentity,
        cancel: &CancellationToken,
    ) -> Result<ConnectionHandle, ConnectError> {
        check_preconditions(device, identity)?;
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let target = ConnectTarget::for_device(device, identity);
        attempt.advance(ConnectionState::TransportConnecting);
        let timeout = self.config.connect_timeout;
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.connect(&target)) => match result {
                Err(_) => return Err(TransportError::TimedOut(timeout).into()),
                Ok(connected) => connected?,
            },
        };

        attempt.advance(ConnectionState::FingerprintCheck);
        let peer = connection.peer_fingerprint();
        if let Err(reason) = verify_fingerprint(device.pinned_fingerprint.as_ref(), &peer) {
            connection.close().await;
            return Err(ConnectError::FingerprintMismatch {
                device: device.key(),
                reason,
            });
        }

        attempt.advance(ConnectionState::AuthorizationCheck);
        let identity_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.authorizer.self_identity(Arc::clone(&connection)) => Some(result),
        };
        let user = match identity_result {
            None => {
                connection.close().await;
                return Err(ConnectError::Cancelled);
            }
            Some(Err(e)) => {
                connection.close().await;
                return Err(e.into());
            }
            Some(Ok(None)) => {
                connection.close().await;
                return Err(ConnectError::NotPaired(device.key()));
            }
            Some(Ok(Some(user))) => user,
        };

        attempt.advance(ConnectionState::Ready);
        Ok(ConnectionHandle::new(device.clone(), connection, peer, user))
    }

    /// Fetches the device's self-description over a ready connection.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if the query fails or the answer is malformed.
    pub async fn pairing_info(&self, handle: &ConnectionHandle) -> Result<PairingInfo, AuthError> {
        if !handle.is_ready() {
            return Err(AuthError::Transport(TransportError::Closed));
        }
        self.authorizer
            .pairing_info(Arc::clone(handle.secure_connection()))
            .await
    }
}

fn check_preconditions(device: &DeviceRecord, identity: &ClientIdentity) -> Result<(), ConnectError> {
    if !device.has_identity() {
        return Err(ConnectError::InvalidDevice(format!(
            "product id {:?} and device id {:?} must both be set",
            device.product_id, device.device_id
        )));
    }
    if identity.private_key.trim().is_empty() {
        return Err(ConnectError::ConfigMissing("client private key".to_string()));
    }
    if device.server_connect_token.trim().is_empty() {
        return Err(ConnectError::ConfigMissing(format!(
            "server connect token for {}",
            device.key()
        )));
    }
    Ok(())
}
