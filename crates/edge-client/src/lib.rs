//! edge-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does edge-client do?
//!
//! 1. Connects to a remote device by `(product id, device id)` over a secure
//!    transport, preferring a direct LAN candidate when one is bookmarked.
//! 2. Verifies that the device presents the fingerprint pinned at pairing.
//! 3. Asks the device who this client is; no answer means "not paired".
//! 4. Lists the services the device exposes and forwards local TCP ports to
//!    them, one tunnel session per local port.
//! 5. Probes many bookmarked devices at once and collects the results in a
//!    single view without one slow device holding up the rest.

/// Application layer: use cases and the capabilities they depend on.
pub mod application;

/// Infrastructure layer: IAM queries, simulated transport, and config storage.
pub mod infrastructure;
