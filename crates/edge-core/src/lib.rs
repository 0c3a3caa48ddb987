//! # edge-core
//!
//! Shared library for the edge tunnel client containing the domain entities
//! and the device query payload layer.
//!
//! This crate has zero dependencies on OS APIs, sockets, or async runtimes.
//!
//! # Architecture overview
//!
//! The edge tunnel client connects to remote devices identified by a
//! `(product id, device id)` pair, verifies the device's pinned public-key
//! fingerprint, checks that this client was paired with the device, and then
//! forwards local TCP ports to named services exposed by the device.
//!
//! This crate is the shared foundation:
//!
//! - **`domain`** – Devices, fingerprints, services, tunnel requests, users,
//!   and pairing info.  Pure data with validation rules.
//!
//! - **`protocol`** – The shape of the query responses returned by a device
//!   (status code, content format, payload) and the JSON payload decoders for
//!   the well-known resources the client reads.

pub mod domain;
pub mod protocol;

pub use domain::device::{DeviceKey, DeviceRecord, Fingerprint, FingerprintParseError};
pub use domain::identity::{PairingInfo, PairingMode, User};
pub use domain::service::{ServiceDescriptor, ServiceSpec, ServiceSpecError};
pub use protocol::payload::PayloadError;
pub use protocol::response::QueryResponse;
