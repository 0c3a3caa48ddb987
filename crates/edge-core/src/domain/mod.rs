//! Domain entities for the edge tunnel client.
//!
//! Domain code holds the rules that make a device, a service, or a tunnel
//! request valid.  Nothing in here performs I/O, so every type can be
//! constructed and tested in isolation.

/// Known devices, their identity key, and pinned fingerprints.
pub mod device;

/// Users and pairing information reported by a device.
pub mod identity;

/// Forwardable services and `name[:port]` tunnel requests.
pub mod service;
