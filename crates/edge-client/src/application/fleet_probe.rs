//! FleetProber: connects to many devices at once and reports each outcome.
//!
//! # Data flow
//!
//! ```text
//! start_round(devices)
//!   ├─ worker(device 1) ─┐
//!   ├─ worker(device 2) ─┼─► mpsc ─► ProbeRound::next() ─► FleetView::apply()
//!   └─ worker(device n) ─┘                                  (single owner)
//! ```
//!
//! Every device gets its own task; a [`Semaphore`] caps how many connect
//! attempts are in flight.  Workers never touch shared presentation state:
//! they hand a [`ProbeResult`] to the channel and the one owner of the
//! [`FleetView`] applies it.  Results arrive in completion order and are
//! matched back by [`DeviceKey`].
//!
//! # Abandoning a round
//!
//! Each round carries a generation number and a cancellation token.  Once a
//! round is cancelled, workers stop at the next await point and close any
//! connection they had already made instead of delivering it.  The view
//! drops results whose generation is not its current one, closing their
//! connections too.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use edge_core::{DeviceKey, DeviceRecord, PairingInfo};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connect_device::{ClientIdentity, ConnectError, Connector, FailureKind};
use super::connection::ConnectionHandle;

/// Default cap on concurrent connect attempts.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Display data derived from a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub friendly_name: String,
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    /// User this client is paired as.
    pub user: String,
}

impl DeviceSummary {
    /// Prefers the name the device reports, falling back to the bookmark.
    pub fn new(device: &DeviceRecord, info: Option<&PairingInfo>, user: &str) -> Self {
        let friendly_name = info
            .map(|i| i.friendly_name.trim())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| device.display_name())
            .to_string();
        Self {
            friendly_name,
            app_name: info.and_then(|i| i.app_name.clone()),
            app_version: info.and_then(|i| i.app_version.clone()),
            user: user.to_string(),
        }
    }
}

pub enum ProbeOutcome {
    Online {
        handle: ConnectionHandle,
        summary: DeviceSummary,
    },
    Failed(ConnectError),
}

/// Outcome of one probe.  Consumed exactly once by the aggregator.
pub struct ProbeResult {
    /// Round this result belongs to.
    pub generation: u64,
    pub device: DeviceKey,
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    pub fn is_online(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Online { .. })
    }

    /// Closes the connection carried by an unwanted result.
    async fn discard(self) {
        if let ProbeOutcome::Online { handle, .. } = self.outcome {
            handle.close().await;
        }
    }
}

pub struct FleetProber {
    connector: Arc<Connector>,
    identity: ClientIdentity,
    max_in_flight: usize,
    generation: AtomicU64,
}

impl FleetProber {
    /// `max_in_flight` is clamped to at least 1.
    pub fn new(connector: Arc<Connector>, identity: ClientIdentity, max_in_flight: usize) -> Self {
        Self {
            connector,
            identity,
            max_in_flight: max_in_flight.max(1),
            generation: AtomicU64::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Starts probing every device in `devices` concurrently.
    ///
    /// Cancelling `cancel` (or calling [`ProbeRound::abandon`]) stops the
    /// round.  Must be called from within a tokio runtime.
    pub fn start_round(&self, devices: Vec<DeviceRecord>, cancel: &CancellationToken) -> ProbeRound {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = cancel.child_token();
        let expected = devices.len();
        let (tx, rx) = mpsc::channel(expected.max(1));
        let permits = Arc::new(Semaphore::new(self.max_in_flight));

        info!(generation, devices = expected, max_in_flight = self.max_in_flight, "probe round started");
        for device in devices {
            let worker = ProbeWorker {
                generation,
                connector: Arc::clone(&self.connector),
                identity: self.identity.clone(),
                permits: Arc::clone(&permits),
                cancel: cancel.clone(),
                tx: tx.clone(),
            };
            tokio::spawn(worker.run(device));
        }

        ProbeRound {
            generation,
            expected,
            rx,
            cancel,
        }
    }

    /// Runs a full round, applying each result to `view` as it arrives.
    ///
    /// Returns the number of results applied.  If `cancel` fires, the round
    /// is abandoned and whatever was applied so far stays in the view.
    pub async fn run_round(
        &self,
        devices: Vec<DeviceRecord>,
        view: &mut FleetView,
        cancel: &CancellationToken,
    ) -> usize {
        let mut round = self.start_round(devices.clone(), cancel);
        view.begin_round(round.generation(), &devices).await;

        let mut applied = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = round.next() => Some(result),
            };
            match next {
                None => {
                    round.abandon().await;
                    break;
                }
                Some(None) => break,
                Some(Some(result)) => {
                    if view.apply(result).await {
                        applied += 1;
                    }
                }
            }
        }
        applied
    }
}

struct ProbeWorker {
    generation: u64,
    connector: Arc<Connector>,
    identity: ClientIdentity,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tx: mpsc::Sender<ProbeResult>,
}

impl ProbeWorker {
    async fn run(self, device: DeviceRecord) {
        let key = device.key();
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let outcome = match self.connector.connect(&device, &self.identity, &self.cancel).await {
            Ok(handle) => {
                let info = match self.connector.pairing_info(&handle).await {
                    Ok(info) => Some(info),
                    Err(e) => {
                        debug!(device = %key, "pairing info unavailable: {e}");
                        None
                    }
                };
                let summary = DeviceSummary::new(&device, info.as_ref(), &handle.user().username);
                ProbeOutcome::Online { handle, summary }
            }
            Err(e) => ProbeOutcome::Failed(e),
        };
        drop(permit);

        let result = ProbeResult {
            generation: self.generation,
            device: key,
            outcome,
        };
        if self.cancel.is_cancelled() {
            result.discard().await;
            return;
        }
        if let Err(mpsc::error::SendError(result)) = self.tx.send(result).await {
            result.discard().await;
        }
    }
}

/// Receiving side of one probe round.
pub struct ProbeRound {
    generation: u64,
    expected: usize,
    rx: mpsc::Receiver<ProbeResult>,
    cancel: CancellationToken,
}

impl ProbeRound {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of devices probed in this round.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Next result in completion order; `None` once every worker finished.
    pub async fn next(&mut self) -> Option<ProbeResult> {
        self.rx.recv().await
    }

    /// Cancels the round and waits for every worker, closing any connection
    /// still in flight.
    pub async fn abandon(mut self) {
        self.cancel.cancel();
        let mut discarded = 0usize;
        while let Some(result) = self.rx.recv().await {
            result.discard().await;
            discarded += 1;
        }
        debug!(generation = self.generation, discarded, "probe round abandoned");
    }
}

/// Dropping a round cancels it.  Results already buffered are closed on a
/// background task, since `Drop` cannot await.
impl Drop for ProbeRound {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Late senders now fail and discard their own result.
        self.rx.close();
        let mut buffered = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            buffered.push(result);
        }
        if buffered.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let generation = self.generation;
                runtime.spawn(async move {
                    let discarded = buffered.len();
                    for result in buffered {
                        result.discard().await;
                    }
                    debug!(generation, discarded, "dropped probe round released its connections");
                });
            }
            Err(_) => warn!(
                generation = self.generation,
                results = buffered.len(),
                "probe round dropped outside a runtime; buffered connections were not closed"
            ),
        }
    }
}

/// Per-device status shown by the fleet view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Probing,
    Online(DeviceSummary),
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug)]
pub struct FleetEntry {
    /// Bookmark name, used until the device reports its own.
    pub name: String,
    pub status: DeviceStatus,
    handle: Option<ConnectionHandle>,
}

impl FleetEntry {
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }
}

/// The aggregation point for probe results.  Owned by exactly one task.
#[derive(Debug, Default)]
pub struct FleetView {
    generation: u64,
    shut_down: bool,
    entries: BTreeMap<DeviceKey, FleetEntry>,
}

impl FleetView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Switches to round `generation`, closing every connection from the
    /// previous round and marking each of `devices` as probing.
    pub async fn begin_round(&mut self, generation: u64, devices: &[DeviceRecord]) {
        self.close_handles().await;
        self.generation = generation;
        self.shut_down = false;
        self.entries = devices
            .iter()
            .map(|d| {
                let entry = FleetEntry {
                    name: d.display_name().to_string(),
                    status: DeviceStatus::Probing,
                    handle: None,
                };
                (d.key(), entry)
            })
            .collect();
    }

    /// Applies one result.  Returns `false` (and closes the result's
    /// connection, if any) when the result is stale or for an unknown device.
    pub async fn apply(&mut self, result: ProbeResult) -> bool {
        if self.shut_down || result.generation != self.generation {
            debug!(device = %result.device, generation = result.generation, "dropping stale probe result");
            result.discard().await;
            return false;
        }
        let Some(entry) = self.entries.get_mut(&result.device) else {
            debug!(device = %result.device, "dropping probe result for unknown device");
            result.discard().await;
            return false;
        };

        let previous = match result.outcome {
            ProbeOutcome::Online { handle, summary } => {
                entry.status = DeviceStatus::Online(summary);
                entry.handle.replace(handle)
            }
            ProbeOutcome::Failed(e) => {
                entry.status = DeviceStatus::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                };
                entry.handle.take()
            }
        };
        if let Some(previous) = previous {
            previous.close().await;
        }
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = (&DeviceKey, &FleetEntry)> {
        self.entries.iter()
    }

    pub fn status(&self, device: &DeviceKey) -> Option<&DeviceStatus> {
        self.entries.get(device).map(|e| &e.status)
    }

    pub fn handle(&self, device: &DeviceKey) -> Option<&ConnectionHandle> {
        self.entries.get(device).and_then(|e| e.handle.as_ref())
    }

    /// Takes ownership of a device's live connection out of the view.
    pub fn take_handle(&mut self, device: &DeviceKey) -> Option<ConnectionHandle> {
        self.entries.get_mut(device).and_then(|e| e.handle.take())
    }

    /// Devices whose probe has not reported yet.
    pub fn pending(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == DeviceStatus::Probing)
            .count()
    }

    pub fn online(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.status, DeviceStatus::Online(_)))
            .count()
    }

    /// Closes every held connection and rejects all further results.
    pub async fn shutdown(&mut self) {
        self.shut_down = true;
        self.close_handles().await;
    }

    async fn close_handles(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(handle) = entry.handle.take() {
                handle.close().await;
            }
        }
    }
}
