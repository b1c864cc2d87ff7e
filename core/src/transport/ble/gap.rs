//! GAP value types shared by the transport contract and the session model
//!
//! Addresses, peer roles and the negotiable link parameters (connection
//! parameters, PHY, data length). Units follow the connectivity firmware:
//! intervals and timeouts in milliseconds, data length in octets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default ATT MTU before any exchange
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Default link-layer payload length before any data length update
pub const DEFAULT_DATA_LENGTH: u16 = 27;

/// Bluetooth device address as reported by the transport (e.g. "F1:E2:D3:C4:B5:A6")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Create an address, normalised to upper case
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().to_uppercase())
    }

    /// Borrow the textual form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Address type of a BLE device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    Public,
    RandomStatic,
    RandomPrivateResolvable,
    RandomPrivateNonResolvable,
}

/// GAP role of the remote device on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The peer is the central, this adapter is the peripheral
    Central,
    /// The peer is the peripheral, this adapter is the central
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Central => write!(f, "central"),
            Role::Peripheral => write!(f, "peripheral"),
        }
    }
}

/// Connection parameters of a link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Minimum connection interval in milliseconds (7.5 - 4000)
    pub min_conn_interval_ms: f64,
    /// Maximum connection interval in milliseconds
    pub max_conn_interval_ms: f64,
    /// Number of connection events the peripheral may skip
    pub slave_latency: u16,
    /// Supervision timeout in milliseconds
    pub conn_sup_timeout_ms: u32,
}

impl ConnectionParams {
    /// Parameters with a fixed interval (min == max)
    pub fn fixed(interval_ms: f64, slave_latency: u16, conn_sup_timeout_ms: u32) -> Self {
        Self {
            min_conn_interval_ms: interval_ms,
            max_conn_interval_ms: interval_ms,
            slave_latency,
            conn_sup_timeout_ms,
        }
    }
}

/// Physical layer mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phy {
    Auto,
    #[serde(rename = "1mbps")]
    OneMbps,
    #[serde(rename = "2mbps")]
    TwoMbps,
    Coded,
}

impl fmt::Display for Phy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phy::Auto => write!(f, "auto"),
            Phy::OneMbps => write!(f, "1M"),
            Phy::TwoMbps => write!(f, "2M"),
            Phy::Coded => write!(f, "coded"),
        }
    }
}

/// Requested or applied PHY pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyParams {
    pub tx_phys: Phy,
    pub rx_phys: Phy,
}

/// Link-layer data length in each direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLengthParams {
    pub max_tx_octets: u16,
    pub max_rx_octets: u16,
}

impl DataLengthParams {
    /// Same length in both directions
    pub fn symmetric(octets: u16) -> Self {
        Self {
            max_tx_octets: octets,
            max_rx_octets: octets,
        }
    }
}

/// Scan parameters used while establishing a connection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    pub active: bool,
    pub interval_ms: u16,
    pub window_ms: u16,
    /// Scan timeout in seconds
    pub timeout_s: u16,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            active: true,
            interval_ms: 100,
            window_ms: 50,
            timeout_s: 20,
        }
    }
}

/// Options passed with a connect command
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub scan_params: ScanParams,
    pub conn_params: ConnectionParams,
}

/// Options passed when opening the adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    pub baud_rate: u32,
    pub log_level: String,
    /// Enable the BLE stack as part of open instead of on CONNECTION_ACTIVE
    pub enable_ble: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            baud_rate: 1_000_000,
            log_level: "debug".to_string(),
            enable_ble: false,
        }
    }
}

/// Snapshot of the adapter state as last reported by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterState {
    pub available: bool,
    pub scanning: bool,
    pub advertising: bool,
    pub connecting: bool,
    pub address: Option<DeviceAddress>,
    pub name: Option<String>,
    pub firmware_version: Option<String>,
}

/// Device description carried by discovery and connection events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub address: DeviceAddress,
    #[serde(default)]
    pub address_type: Option<AddressType>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rssi: Option<i8>,
    #[serde(default)]
    pub conn_params: Option<ConnectionParams>,
}

impl DeviceInfo {
    /// Minimal description with only an address
    pub fn new(address: impl Into<DeviceAddress>) -> Self {
        Self {
            address: address.into(),
            address_type: None,
            role: None,
            name: None,
            rssi: None,
            conn_params: None,
        }
    }

    /// Set the peer role
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}
