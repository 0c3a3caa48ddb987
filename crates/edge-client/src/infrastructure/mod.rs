//! Infrastructure layer for the edge tunnel client.
//!
//! Contains adapters behind the application-layer capability traits and the
//! file-system configuration store.
//!
//! **Dependency rule**: this layer may depend on `application` and `edge_core`,
//! but MUST NOT be imported by the `application` or domain layers.

pub mod iam;
pub mod simulated;
pub mod storage;
