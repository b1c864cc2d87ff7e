//! Device sessions
//!
//! One [`DeviceSession`] per known address holds identity, connection state,
//! negotiated link parameters, the security context and the procedure slots.

pub mod registry;
pub mod slots;

pub use registry::{ConnectAttempt, SessionRegistry};
pub use slots::{Initiator, ProcedureKind, ProcedureSlot, SlotBusy, SlotClaim, SlotTable};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

use crate::events::CorrelationId;
use crate::security::SecurityContext;
use crate::transport::ble::{
    AddressType, ConnectionParams, DeviceAddress, DeviceInfo, Phy, PhyParams, Role,
    DEFAULT_ATT_MTU, DEFAULT_DATA_LENGTH,
};
use crate::transport::TransportError;

/// Number of RSSI samples kept per device
pub const RSSI_HISTORY_LEN: usize = 32;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceAddress),

    #[error("A {kind} procedure is already outstanding ({outstanding})")]
    ProcedureBusy {
        kind: ProcedureKind,
        outstanding: CorrelationId,
    },

    #[error("A connect attempt is already in progress")]
    ConnectInProgress,

    #[error("No connect attempt in progress")]
    NoConnectInProgress,

    #[error("Invalid role for {0}")]
    UnknownRole(DeviceAddress),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),
}

// ============================================================================
// SESSION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Negotiated link parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkParameters {
    pub conn_params: Option<ConnectionParams>,
    pub phys: PhyParams,
    pub mtu: u16,
    pub data_length: u16,
}

impl Default for LinkParameters {
    fn default() -> Self {
        Self {
            conn_params: None,
            phys: PhyParams {
                tx_phys: Phy::OneMbps,
                rx_phys: Phy::OneMbps,
            },
            mtu: DEFAULT_ATT_MTU,
            data_length: DEFAULT_DATA_LENGTH,
        }
    }
}

/// Everything the orchestrator knows about one device
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub address: DeviceAddress,
    pub address_type: Option<AddressType>,
    /// GAP role of the peer, known once connected
    pub role: Option<Role>,
    pub name: Option<String>,
    pub rssi: Option<i8>,
    pub rssi_history: VecDeque<i8>,
    pub connection: ConnectionState,
    pub link: LinkParameters,
    pub security: SecurityContext,
    pub slots: SlotTable,
}

impl DeviceSession {
    /// Create a new disconnected session
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            address_type: None,
            role: None,
            name: None,
            rssi: None,
            rssi_history: VecDeque::with_capacity(RSSI_HISTORY_LEN),
            connection: ConnectionState::Disconnected,
            link: LinkParameters::default(),
            security: SecurityContext::default(),
            slots: SlotTable::new(),
        }
    }

    /// Fold in what a discovery or connection event reports about the device
    pub fn update_from(&mut self, device: &DeviceInfo) {
        if device.address_type.is_some() {
            self.address_type = device.address_type;
        }
        if device.role.is_some() {
            self.role = device.role;
        }
        if let Some(name) = device.name.as_deref().filter(|n| !n.is_empty()) {
            self.name = Some(name.to_string());
        }
        if let Some(rssi) = device.rssi {
            self.rssi = Some(rssi);
            if self.rssi_history.len() == RSSI_HISTORY_LEN {
                self.rssi_history.pop_front();
            }
            self.rssi_history.push_back(rssi);
        }
        if device.conn_params.is_some() {
            self.link.conn_params = device.conn_params;
        }
    }

    /// Link came up: reset negotiated parameters to the link-layer defaults
    pub fn on_connected(&mut self, device: &DeviceInfo) {
        self.link = LinkParameters::default();
        self.update_from(device);
        self.connection = ConnectionState::Connected;
    }

    /// Link went down: drop everything tied to the connection
    pub fn on_disconnected(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.security.reset();
        self.slots.clear_outstanding();
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Describe the session the way transport events describe devices
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            address: self.address.clone(),
            address_type: self.address_type,
            role: self.role,
            name: self.name.clone(),
            rssi: self.rssi,
            conn_params: self.link.conn_params,
        }
    }
}
