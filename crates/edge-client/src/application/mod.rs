//! Application layer use cases for the edge tunnel client.
//!
//! Use cases in this layer orchestrate domain objects to fulfil a user goal,
//! depend only on the capability traits in [`transport`] and
//! [`connect_device::Authorizer`], and never open sockets or files
//! themselves.
//!
//! # Sub-modules
//!
//! - **`transport`** – The secure-transport capability: connect to a device,
//!   query its resources, open and close tunnel bindings.
//!
//! - **`connect_device`** – The Connector: drives one device from "known" to
//!   "connected and authorized" and produces a [`connection::ConnectionHandle`].
//!
//! - **`connection`** – The live connection handle and its lifecycle.
//!
//! - **`tunnel_sessions`** – Opens, tracks, and closes the TCP tunnels bound
//!   to one connection.
//!
//! - **`service_catalog`** – Lists the services a connected device exposes.
//!
//! - **`fleet_probe`** – Connects to many devices concurrently and hands the
//!   results to a single aggregating owner.

pub mod connect_device;
pub mod connection;
pub mod fleet_probe;
pub mod service_catalog;
pub mod transport;
pub mod tunnel_sessions;
