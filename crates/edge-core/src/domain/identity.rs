//! Users and pairing information reported by a device.
//!
//! After the transport is up the client asks the device "who am I".  A paired
//! client gets back a [`User`]; an unpaired one gets nothing.  The device can
//! also describe itself with [`PairingInfo`], which the probe uses for display.

use serde::{Deserialize, Serialize};

/// The identity the device associates with this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "DisplayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "Role", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl User {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: None,
            role: None,
        }
    }
}

/// Pairing modes a device may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingMode {
    LocalOpen,
    LocalInitial,
    PasswordOpen,
    PasswordInvite,
    /// Any mode this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Self-description of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingInfo {
    #[serde(rename = "ProductId")]
    pub product_id: String,
    #[serde(rename = "DeviceId")]
    pub device_id: String,
    #[serde(rename = "FriendlyName", default)]
    pub friendly_name: String,
    #[serde(rename = "AppName", default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(rename = "AppVersion", default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(rename = "NabtoVersion", default)]
    pub nabto_version: String,
    #[serde(rename = "Modes", default)]
    pub pairing_modes: Vec<PairingMode>,
}
