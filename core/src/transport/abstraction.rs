//! Transport abstraction layer for blelink
//!
//! Defines the events a BLE adapter transport emits, the commands the
//! orchestrator issues back to it and the errors those commands may fail with.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::ble::{
    AdapterState, AddressType, AuthKeyType, AuthRequirements, AuthStatus, ConnectOptions,
    ConnectionParams, ConnectionSecurity, DataLengthParams, DeviceAddress, DeviceInfo, DhKey,
    EncInfo, IdInfo, KeySet, KeypressType, LescOobData, MasterId, OpenOptions, PhyParams,
    PublicKey, SecurityParams, SignInfo,
};

/// Adapter status name: the connectivity chip was reset
pub const STATUS_RESET_PERFORMED: &str = "RESET_PERFORMED";

/// Adapter status name: the serial link to the connectivity chip is up
pub const STATUS_CONNECTION_ACTIVE: &str = "CONNECTION_ACTIVE";

/// Severity of a transport log message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogSeverity {
    /// Decode the numeric severity used by the transport driver
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LogSeverity::Trace),
            1 => Some(LogSeverity::Debug),
            2 => Some(LogSeverity::Info),
            3 => Some(LogSeverity::Warning),
            4 => Some(LogSeverity::Error),
            5 => Some(LogSeverity::Fatal),
            _ => None,
        }
    }
}

/// Adapter-level status notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub message: String,
}

/// Which kind of attribute a value change belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Characteristic,
    Descriptor,
}

/// Events from the adapter transport to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// Adapter-level error
    Error {
        message: String,
        #[serde(default)]
        code: Option<i32>,
    },
    /// Adapter-level warning
    Warning { message: String },
    /// Driver log line with a numeric severity
    LogMessage { severity: u8, message: String },
    /// Adapter state refreshed
    StateChanged { state: AdapterState },
    /// Advertising report
    DeviceDiscovered { device: DeviceInfo },
    /// Link established
    DeviceConnected { device: DeviceInfo },
    /// Link lost or closed
    DeviceDisconnected {
        address: DeviceAddress,
        #[serde(default)]
        reason: Option<u8>,
    },
    ConnectTimedOut { address: DeviceAddress },
    ScanTimedOut,
    AdvertiseTimedOut,
    SecurityRequestTimedOut { address: DeviceAddress },
    /// Peer asks for new connection parameters
    ConnParamUpdateRequest {
        address: DeviceAddress,
        params: ConnectionParams,
    },
    /// Connection parameters changed
    ConnParamUpdate {
        address: DeviceAddress,
        params: ConnectionParams,
    },
    /// Peer asks to exchange ATT MTU
    AttMtuRequest { address: DeviceAddress, mtu: u16 },
    AttMtuChanged { address: DeviceAddress, mtu: u16 },
    CharacteristicValueChanged {
        address: DeviceAddress,
        handle: u16,
        value: Vec<u8>,
    },
    DescriptorValueChanged {
        address: DeviceAddress,
        handle: u16,
        value: Vec<u8>,
    },
    SecurityChanged {
        address: DeviceAddress,
        security: ConnectionSecurity,
    },
    /// Peer peripheral asks this central to secure the link
    SecurityRequest {
        address: DeviceAddress,
        requirements: AuthRequirements,
    },
    /// Pairing parameter exchange
    SecParamsRequest {
        address: DeviceAddress,
        peer_params: SecurityParams,
    },
    /// Peer asks for stored keys to encrypt a bonded link
    SecInfoRequest { address: DeviceAddress },
    AuthKeyRequest {
        address: DeviceAddress,
        key_type: AuthKeyType,
    },
    PasskeyDisplay {
        address: DeviceAddress,
        passkey: String,
        match_request: bool,
    },
    LescDhkeyRequest {
        address: DeviceAddress,
        peer_public_key: PublicKey,
        oob_required: bool,
    },
    KeyPressed {
        address: DeviceAddress,
        keypress: KeypressType,
    },
    AuthStatus {
        address: DeviceAddress,
        status: AuthStatus,
    },
    Status { status: AdapterStatus },
    PhyUpdateRequest {
        address: DeviceAddress,
        phys: PhyParams,
    },
    PhyUpdated {
        address: DeviceAddress,
        phys: PhyParams,
    },
    DataLengthUpdateRequest {
        address: DeviceAddress,
        params: DataLengthParams,
    },
    DataLengthUpdated {
        address: DeviceAddress,
        params: DataLengthParams,
    },
}

impl TransportEvent {
    /// Address of the device this event belongs to, `None` for adapter-level events
    pub fn address(&self) -> Option<&DeviceAddress> {
        match self {
            TransportEvent::Error { .. }
            | TransportEvent::Warning { .. }
            | TransportEvent::LogMessage { .. }
            | TransportEvent::StateChanged { .. }
            | TransportEvent::ScanTimedOut
            | TransportEvent::AdvertiseTimedOut
            | TransportEvent::Status { .. } => None,
            TransportEvent::DeviceDiscovered { device }
            | TransportEvent::DeviceConnected { device } => Some(&device.address),
            TransportEvent::DeviceDisconnected { address, .. }
            | TransportEvent::ConnectTimedOut { address }
            | TransportEvent::SecurityRequestTimedOut { address }
            | TransportEvent::ConnParamUpdateRequest { address, .. }
            | TransportEvent::ConnParamUpdate { address, .. }
            | TransportEvent::AttMtuRequest { address, .. }
            | TransportEvent::AttMtuChanged { address, .. }
            | TransportEvent::CharacteristicValueChanged { address, .. }
            | TransportEvent::DescriptorValueChanged { address, .. }
            | TransportEvent::SecurityChanged { address, .. }
            | TransportEvent::SecurityRequest { address, .. }
            | TransportEvent::SecParamsRequest { address, .. }
            | TransportEvent::SecInfoRequest { address }
            | TransportEvent::AuthKeyRequest { address, .. }
            | TransportEvent::PasskeyDisplay { address, .. }
            | TransportEvent::LescDhkeyRequest { address, .. }
            | TransportEvent::KeyPressed { address, .. }
            | TransportEvent::AuthStatus { address, .. }
            | TransportEvent::PhyUpdateRequest { address, .. }
            | TransportEvent::PhyUpdated { address, .. }
            | TransportEvent::DataLengthUpdateRequest { address, .. }
            | TransportEvent::DataLengthUpdated { address, .. } => Some(address),
        }
    }

    /// Whether this event may create a session for an unknown address
    pub fn creates_session(&self) -> bool {
        matches!(
            self,
            TransportEvent::DeviceDiscovered { .. } | TransportEvent::DeviceConnected { .. }
        )
    }

    /// Short event name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::Error { .. } => "error",
            TransportEvent::Warning { .. } => "warning",
            TransportEvent::LogMessage { .. } => "logMessage",
            TransportEvent::StateChanged { .. } => "stateChanged",
            TransportEvent::DeviceDiscovered { .. } => "deviceDiscovered",
            TransportEvent::DeviceConnected { .. } => "deviceConnected",
            TransportEvent::DeviceDisconnected { .. } => "deviceDisconnected",
            TransportEvent::ConnectTimedOut { .. } => "connectTimedOut",
            TransportEvent::ScanTimedOut => "scanTimedOut",
            TransportEvent::AdvertiseTimedOut => "advertiseTimedOut",
            TransportEvent::SecurityRequestTimedOut { .. } => "securityRequestTimedOut",
            TransportEvent::ConnParamUpdateRequest { .. } => "connParamUpdateRequest",
            TransportEvent::ConnParamUpdate { .. } => "connParamUpdate",
            TransportEvent::AttMtuRequest { .. } => "attMtuRequest",
            TransportEvent::AttMtuChanged { .. } => "attMtuChanged",
            TransportEvent::CharacteristicValueChanged { .. } => "characteristicValueChanged",
            TransportEvent::DescriptorValueChanged { .. } => "descriptorValueChanged",
            TransportEvent::SecurityChanged { .. } => "securityChanged",
            TransportEvent::SecurityRequest { .. } => "securityRequest",
            TransportEvent::SecParamsRequest { .. } => "secParamsRequest",
            TransportEvent::SecInfoRequest { .. } => "secInfoRequest",
            TransportEvent::AuthKeyRequest { .. } => "authKeyRequest",
            TransportEvent::PasskeyDisplay { .. } => "passkeyDisplay",
            TransportEvent::LescDhkeyRequest { .. } => "lescDhkeyRequest",
            TransportEvent::KeyPressed { .. } => "keyPressed",
            TransportEvent::AuthStatus { .. } => "authStatus",
            TransportEvent::Status { .. } => "status",
            TransportEvent::PhyUpdateRequest { .. } => "phyUpdateRequest",
            TransportEvent::PhyUpdated { .. } => "phyUpdated",
            TransportEvent::DataLengthUpdateRequest { .. } => "dataLengthUpdateRequest",
            TransportEvent::DataLengthUpdated { .. } => "dataLengthUpdated",
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "{} {{ address: {} }}", self.name(), address),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// Commands from the orchestrator to the adapter transport
///
/// Every call on [`super::AdapterTransport`] has a matching variant so a
/// transport can record what it was asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TransportCommand {
    Open { options: OpenOptions },
    Close,
    EnableBle,
    GetState,
    Connect {
        address: DeviceAddress,
        address_type: Option<AddressType>,
        options: ConnectOptions,
    },
    Disconnect { address: DeviceAddress },
    CancelConnect,
    Authenticate {
        address: DeviceAddress,
        params: Option<SecurityParams>,
    },
    ReplySecParams {
        address: DeviceAddress,
        status: u8,
        own_params: Option<SecurityParams>,
        keyset: Option<KeySet>,
    },
    SecInfoReply {
        address: DeviceAddress,
        enc_info: Option<EncInfo>,
        id_info: Option<IdInfo>,
        sign_info: Option<SignInfo>,
    },
    ReplyLescDhkey { address: DeviceAddress, dhkey: DhKey },
    SetLescOobData {
        address: DeviceAddress,
        own_oob: Option<LescOobData>,
        peer_oob: Option<LescOobData>,
    },
    GetLescOobData {
        address: DeviceAddress,
        own_public_key: PublicKey,
    },
    NotifyKeypress {
        address: DeviceAddress,
        keypress: KeypressType,
    },
    ReplyAuthKey {
        address: DeviceAddress,
        key_type: AuthKeyType,
        key: Option<String>,
    },
    UpdateConnectionParameters {
        address: DeviceAddress,
        params: ConnectionParams,
    },
    RejectConnParams { address: DeviceAddress },
    PhyUpdate {
        address: DeviceAddress,
        phys: PhyParams,
    },
    RequestAttMtu { address: DeviceAddress, mtu: u16 },
    AttMtuReply { address: DeviceAddress, mtu: u16 },
    DataLengthUpdate {
        address: DeviceAddress,
        params: DataLengthParams,
    },
    ComputePublicKey,
    ComputeSharedSecret { peer_public_key: PublicKey },
    Encrypt {
        address: DeviceAddress,
        master_id: MasterId,
        enc_info: EncInfo,
    },
}

impl TransportCommand {
    /// Driver command name
    pub fn name(&self) -> &'static str {
        match self {
            TransportCommand::Open { .. } => "open",
            TransportCommand::Close => "close",
            TransportCommand::EnableBle => "enableBle",
            TransportCommand::GetState => "getState",
            TransportCommand::Connect { .. } => "connect",
            TransportCommand::Disconnect { .. } => "disconnect",
            TransportCommand::CancelConnect => "cancelConnect",
            TransportCommand::Authenticate { .. } => "authenticate",
            TransportCommand::ReplySecParams { .. } => "replySecParams",
            TransportCommand::SecInfoReply { .. } => "secInfoReply",
            TransportCommand::ReplyLescDhkey { .. } => "replyLescDhkey",
            TransportCommand::SetLescOobData { .. } => "setLescOobData",
            TransportCommand::GetLescOobData { .. } => "getLescOobData",
            TransportCommand::NotifyKeypress { .. } => "notifyKeypress",
            TransportCommand::ReplyAuthKey { .. } => "replyAuthKey",
            TransportCommand::UpdateConnectionParameters { .. } => "updateConnectionParameters",
            TransportCommand::RejectConnParams { .. } => "rejectConnParams",
            TransportCommand::PhyUpdate { .. } => "phyUpdate",
            TransportCommand::RequestAttMtu { .. } => "requestAttMtu",
            TransportCommand::AttMtuReply { .. } => "attMtuReply",
            TransportCommand::DataLengthUpdate { .. } => "dataLengthUpdate",
            TransportCommand::ComputePublicKey => "computePublicKey",
            TransportCommand::ComputeSharedSecret { .. } => "computeSharedSecret",
            TransportCommand::Encrypt { .. } => "encrypt",
        }
    }
}

impl fmt::Display for TransportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportCommand::Connect { address, .. }
            | TransportCommand::Disconnect { address }
            | TransportCommand::Authenticate { address, .. }
            | TransportCommand::SecInfoReply { address, .. }
            | TransportCommand::ReplyLescDhkey { address, .. }
            | TransportCommand::SetLescOobData { address, .. }
            | TransportCommand::GetLescOobData { address, .. }
            | TransportCommand::RejectConnParams { address }
            | TransportCommand::Encrypt { address, .. } => {
                write!(f, "{} {{ address: {} }}", self.name(), address)
            }
            TransportCommand::ReplySecParams {
                address, status, ..
            } => write!(
                f,
                "{} {{ address: {}, status: {:#04x} }}",
                self.name(),
                address,
                status
            ),
            TransportCommand::NotifyKeypress { address, keypress } => write!(
                f,
                "{} {{ address: {}, keypress: {} }}",
                self.name(),
                address,
                keypress
            ),
            TransportCommand::ReplyAuthKey {
                address, key_type, ..
            } => write!(
                f,
                "{} {{ address: {}, key_type: {} }}",
                self.name(),
                address,
                key_type.wire_value()
            ),
            TransportCommand::UpdateConnectionParameters { address, params } => write!(
                f,
                "{} {{ address: {}, interval: {}-{} ms }}",
                self.name(),
                address,
                params.min_conn_interval_ms,
                params.max_conn_interval_ms
            ),
            TransportCommand::PhyUpdate { address, phys } => write!(
                f,
                "{} {{ address: {}, tx: {}, rx: {} }}",
                self.name(),
                address,
                phys.tx_phys,
                phys.rx_phys
            ),
            TransportCommand::RequestAttMtu { address, mtu }
            | TransportCommand::AttMtuReply { address, mtu } => {
                write!(f, "{} {{ address: {}, mtu: {} }}", self.name(), address, mtu)
            }
            TransportCommand::DataLengthUpdate { address, params } => write!(
                f,
                "{} {{ address: {}, tx: {}, rx: {} }}",
                self.name(),
                address,
                params.max_tx_octets,
                params.max_rx_octets
            ),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Adapter not open")]
    NotOpen,

    #[error("{command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Command failure with a reason
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        TransportError::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }
}
