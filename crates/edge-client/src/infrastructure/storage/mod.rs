//! Storage infrastructure: configuration and bookmark persistence.
//!
//! The `config` sub-module reads the TOML configuration file holding the
//! client key, transport settings, and bookmarked devices, and writes it back
//! when bookmarks change.

pub mod config;
