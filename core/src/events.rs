//! Upstream events
//!
//! Everything the orchestrator reports to the application travels as an
//! [`UpstreamEvent`] on the channel returned by [`crate::Orchestrator::new`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transport::ble::{
    AdapterState, AuthKeyType, AuthRequirements, ConnectionParams, ConnectionSecurity,
    DeviceAddress, DeviceInfo, KeypressType, LescOobData, PhyParams,
};
use crate::transport::AttributeKind;

/// Identifies one procedure from its request to its terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Status of a negotiation procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureStatus {
    Pending,
    Success,
    Error,
    Rejected,
}

impl ProcedureStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcedureStatus::Pending)
    }
}

impl fmt::Display for ProcedureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureStatus::Pending => write!(f, "pending"),
            ProcedureStatus::Success => write!(f, "success"),
            ProcedureStatus::Error => write!(f, "error"),
            ProcedureStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// One attribute value change as delivered in a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub address: DeviceAddress,
    pub kind: AttributeKind,
    pub handle: u16,
    pub value: Vec<u8>,
}

/// Events from the orchestrator to the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpstreamEvent {
    // ---- adapter ----
    AdapterOpened,
    AdapterClosed,
    AdapterResetPerformed,
    AdapterError {
        message: String,
        code: Option<i32>,
    },
    AdapterStateChanged {
        state: AdapterState,
    },
    ScanTimedOut,
    AdvertiseTimedOut,

    // ---- connection lifecycle ----
    DeviceDiscovered {
        device: DeviceInfo,
    },
    DeviceConnecting {
        address: DeviceAddress,
    },
    DeviceConnected {
        device: DeviceInfo,
    },
    ConnectFailed {
        address: DeviceAddress,
        reason: String,
    },
    ConnectTimedOut {
        address: DeviceAddress,
    },
    CancelConnectRequested {
        address: DeviceAddress,
    },
    ConnectCanceled {
        address: DeviceAddress,
    },
    CancelConnectFailed {
        address: DeviceAddress,
        reason: String,
    },
    DeviceDisconnecting {
        address: DeviceAddress,
    },
    DisconnectFailed {
        address: DeviceAddress,
        reason: String,
    },
    DeviceDisconnected {
        address: DeviceAddress,
        reason: Option<u8>,
    },

    // ---- security ----
    SecurityRequest {
        address: DeviceAddress,
        id: CorrelationId,
        requirements: AuthRequirements,
    },
    PairingStatus {
        address: DeviceAddress,
        id: CorrelationId,
        status: ProcedureStatus,
    },
    AuthKeyRequest {
        address: DeviceAddress,
        id: CorrelationId,
        key_type: AuthKeyType,
        send_keypress: bool,
    },
    AuthKeyStatus {
        address: DeviceAddress,
        id: CorrelationId,
        status: ProcedureStatus,
    },
    PasskeyDisplay {
        address: DeviceAddress,
        id: CorrelationId,
        passkey: String,
        match_request: bool,
        receive_keypress: bool,
    },
    LescOobRequest {
        address: DeviceAddress,
        id: CorrelationId,
        own_oob: LescOobData,
    },
    KeypressSent {
        address: DeviceAddress,
        id: CorrelationId,
        keypress: KeypressType,
    },
    KeypressReceived {
        address: DeviceAddress,
        keypress: KeypressType,
    },
    AuthError {
        address: DeviceAddress,
        id: Option<CorrelationId>,
        reason: String,
    },
    AuthSucceeded {
        address: DeviceAddress,
        id: Option<CorrelationId>,
    },
    BondInfoAdded {
        address: DeviceAddress,
    },
    SecurityChanged {
        address: DeviceAddress,
        security: ConnectionSecurity,
    },
    SecurityRequestTimedOut {
        address: DeviceAddress,
        id: Option<CorrelationId>,
    },

    // ---- link parameters ----
    ConnectionParamsRequest {
        address: DeviceAddress,
        id: CorrelationId,
        params: ConnectionParams,
    },
    ConnectionParamsStatus {
        address: DeviceAddress,
        id: Option<CorrelationId>,
        status: ProcedureStatus,
    },
    ConnectionParamsUpdated {
        address: DeviceAddress,
        params: ConnectionParams,
    },
    PhyRequest {
        address: DeviceAddress,
        id: CorrelationId,
        phys: PhyParams,
    },
    PhyStatus {
        address: DeviceAddress,
        id: Option<CorrelationId>,
        status: ProcedureStatus,
    },
    PhyUpdated {
        address: DeviceAddress,
        phys: PhyParams,
    },
    MtuRequest {
        address: DeviceAddress,
        id: CorrelationId,
        mtu: u16,
    },
    MtuStatus {
        address: DeviceAddress,
        id: Option<CorrelationId>,
        status: ProcedureStatus,
    },
    MtuUpdated {
        address: DeviceAddress,
        mtu: u16,
    },
    DataLengthRequest {
        address: DeviceAddress,
        id: CorrelationId,
        data_length: u16,
    },
    DataLengthStatus {
        address: DeviceAddress,
        id: Option<CorrelationId>,
        status: ProcedureStatus,
    },
    DataLengthUpdated {
        address: DeviceAddress,
        data_length: u16,
    },

    // ---- attribute values ----
    AttributeValuesChanged {
        values: Vec<AttributeValue>,
    },
}

impl UpstreamEvent {
    /// Snake-case event name, matching the serialized tag
    pub fn name(&self) -> &'static str {
        match self {
            UpstreamEvent::AdapterOpened => "adapter_opened",
            UpstreamEvent::AdapterClosed => "adapter_closed",
            UpstreamEvent::AdapterResetPerformed => "adapter_reset_performed",
            UpstreamEvent::AdapterError { .. } => "adapter_error",
            UpstreamEvent::AdapterStateChanged { .. } => "adapter_state_changed",
            UpstreamEvent::ScanTimedOut => "scan_timed_out",
            UpstreamEvent::AdvertiseTimedOut => "advertise_timed_out",
            UpstreamEvent::DeviceDiscovered { .. } => "device_discovered",
            UpstreamEvent::DeviceConnecting { .. } => "device_connecting",
            UpstreamEvent::DeviceConnected { .. } => "device_connected",
            UpstreamEvent::ConnectFailed { .. } => "connect_failed",
            UpstreamEvent::ConnectTimedOut { .. } => "connect_timed_out",
            UpstreamEvent::CancelConnectRequested { .. } => "cancel_connect_requested",
            UpstreamEvent::ConnectCanceled { .. } => "connect_canceled",
            UpstreamEvent::CancelConnectFailed { .. } => "cancel_connect_failed",
            UpstreamEvent::DeviceDisconnecting { .. } => "device_disconnecting",
            UpstreamEvent::DisconnectFailed { .. } => "disconnect_failed",
            UpstreamEvent::DeviceDisconnected { .. } => "device_disconnected",
            UpstreamEvent::SecurityRequest { .. } => "security_request",
            UpstreamEvent::PairingStatus { .. } => "pairing_status",
            UpstreamEvent::AuthKeyRequest { .. } => "auth_key_request",
            UpstreamEvent::AuthKeyStatus { .. } => "auth_key_status",
            UpstreamEvent::PasskeyDisplay { .. } => "passkey_display",
            UpstreamEvent::LescOobRequest { .. } => "lesc_oob_request",
            UpstreamEvent::KeypressSent { .. } => "keypress_sent",
            UpstreamEvent::KeypressReceived { .. } => "keypress_received",
            UpstreamEvent::AuthError { .. } => "auth_error",
            UpstreamEvent::AuthSucceeded { .. } => "auth_succeeded",
            UpstreamEvent::BondInfoAdded { .. } => "bond_info_added",
            UpstreamEvent::SecurityChanged { .. } => "security_changed",
            UpstreamEvent::SecurityRequestTimedOut { .. } => "security_request_timed_out",
            UpstreamEvent::ConnectionParamsRequest { .. } => "connection_params_request",
            UpstreamEvent::ConnectionParamsStatus { .. } => "connection_params_status",
            UpstreamEvent::ConnectionParamsUpdated { .. } => "connection_params_updated",
            UpstreamEvent::PhyRequest { .. } => "phy_request",
            UpstreamEvent::PhyStatus { .. } => "phy_status",
            UpstreamEvent::PhyUpdated { .. } => "phy_updated",
            UpstreamEvent::MtuRequest { .. } => "mtu_request",
            UpstreamEvent::MtuStatus { .. } => "mtu_status",
            UpstreamEvent::MtuUpdated { .. } => "mtu_updated",
            UpstreamEvent::DataLengthRequest { .. } => "data_length_request",
            UpstreamEvent::DataLengthStatus { .. } => "data_length_status",
            UpstreamEvent::DataLengthUpdated { .. } => "data_length_updated",
            UpstreamEvent::AttributeValuesChanged { .. } => "attribute_values_changed",
        }
    }
}

impl fmt::Display for UpstreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamEvent::AdapterError { message, .. } => {
                write!(f, "{} {{ message: {} }}", self.name(), message)
            }
            UpstreamEvent::DeviceDiscovered { device } | UpstreamEvent::DeviceConnected { device } => {
                write!(f, "{} {{ address: {} }}", self.name(), device.address)
            }
            UpstreamEvent::PairingStatus {
                address,
                id,
                status,
            }
            | UpstreamEvent::AuthKeyStatus {
                address,
                id,
                status,
            } => write!(
                f,
                "{} {{ address: {}, id: {}, status: {} }}",
                self.name(),
                address,
                id,
                status
            ),
            UpstreamEvent::ConnectionParamsStatus {
                address,
                id,
                status,
            }
            | UpstreamEvent::PhyStatus {
                address,
                id,
                status,
            }
            | UpstreamEvent::MtuStatus {
                address,
                id,
                status,
            }
            | UpstreamEvent::DataLengthStatus {
                address,
                id,
                status,
            } => match id {
                Some(id) => write!(
                    f,
                    "{} {{ address: {}, id: {}, status: {} }}",
                    self.name(),
                    address,
                    id,
                    status
                ),
                None => write!(
                    f,
                    "{} {{ address: {}, status: {} }}",
                    self.name(),
                    address,
                    status
                ),
            },
            UpstreamEvent::MtuUpdated { address, mtu } => {
                write!(f, "{} {{ address: {}, mtu: {} }}", self.name(), address, mtu)
            }
            UpstreamEvent::DataLengthUpdated {
                address,
                data_length,
            } => write!(
                f,
                "{} {{ address: {}, data_length: {} }}",
                self.name(),
                address,
                data_length
            ),
            UpstreamEvent::AttributeValuesChanged { values } => {
                write!(f, "{} {{ count: {} }}", self.name(), values.len())
            }
            _ => match self.address() {
                Some(address) => write!(f, "{} {{ address: {} }}", self.name(), address),
                None => write!(f, "{}", self.name()),
            },
        }
    }
}

impl UpstreamEvent {
    /// Device this event is about, if any
    pub fn address(&self) -> Option<&DeviceAddress> {
        match self {
            UpstreamEvent::AdapterOpened
            | UpstreamEvent::AdapterClosed
            | UpstreamEvent::AdapterResetPerformed
            | UpstreamEvent::AdapterError { .. }
            | UpstreamEvent::AdapterStateChanged { .. }
            | UpstreamEvent::ScanTimedOut
            | UpstreamEvent::AdvertiseTimedOut
            | UpstreamEvent::AttributeValuesChanged { .. } => None,
            UpstreamEvent::DeviceDiscovered { device }
            | UpstreamEvent::DeviceConnected { device } => Some(&device.address),
            UpstreamEvent::DeviceConnecting { address }
            | UpstreamEvent::ConnectFailed { address, .. }
            | UpstreamEvent::ConnectTimedOut { address }
            | UpstreamEvent::CancelConnectRequested { address }
            | UpstreamEvent::ConnectCanceled { address }
            | UpstreamEvent::CancelConnectFailed { address, .. }
            | UpstreamEvent::DeviceDisconnecting { address }
            | UpstreamEvent::DisconnectFailed { address, .. }
            | UpstreamEvent::DeviceDisconnected { address, .. }
            | UpstreamEvent::SecurityRequest { address, .. }
            | UpstreamEvent::PairingStatus { address, .. }
            | UpstreamEvent::AuthKeyRequest { address, .. }
            | UpstreamEvent::AuthKeyStatus { address, .. }
            | UpstreamEvent::PasskeyDisplay { address, .. }
            | UpstreamEvent::LescOobRequest { address, .. }
            | UpstreamEvent::KeypressSent { address, .. }
            | UpstreamEvent::KeypressReceived { address, .. }
            | UpstreamEvent::AuthError { address, .. }
            | UpstreamEvent::AuthSucceeded { address, .. }
            | UpstreamEvent::BondInfoAdded { address }
            | UpstreamEvent::SecurityChanged { address, .. }
            | UpstreamEvent::SecurityRequestTimedOut { address, .. }
            | UpstreamEvent::ConnectionParamsRequest { address, .. }
            | UpstreamEvent::ConnectionParamsStatus { address, .. }
            | UpstreamEvent::ConnectionParamsUpdated { address, .. }
            | UpstreamEvent::PhyRequest { address, .. }
            | UpstreamEvent::PhyStatus { address, .. }
            | UpstreamEvent::PhyUpdated { address, .. }
            | UpstreamEvent::MtuRequest { address, .. }
            | UpstreamEvent::MtuStatus { address, .. }
            | UpstreamEvent::MtuUpdated { address, .. }
            | UpstreamEvent::DataLengthRequest { address, .. }
            | UpstreamEvent::DataLengthStatus { address, .. }
            | UpstreamEvent::DataLengthUpdated { address, .. } => Some(address),
        }
    }

    /// Whether this event reports a failure
    pub fn is_error(&self) -> bool {
        match self {
            UpstreamEvent::AdapterError { .. }
            | UpstreamEvent::ConnectFailed { .. }
            | UpstreamEvent::CancelConnectFailed { .. }
            | UpstreamEvent::DisconnectFailed { .. }
            | UpstreamEvent::AuthError { .. } => true,
            UpstreamEvent::PairingStatus { status, .. }
            | UpstreamEvent::AuthKeyStatus { status, .. }
            | UpstreamEvent::ConnectionParamsStatus { status, .. }
            | UpstreamEvent::PhyStatus { status, .. }
            | UpstreamEvent::MtuStatus { status, .. }
            | UpstreamEvent::DataLengthStatus { status, .. } => *status == ProcedureStatus::Error,
            _ => false,
        }
    }
}
