//! BLE (Bluetooth Low Energy) value types
//!
//! Protocol-level types shared by the transport contract and the session
//! orchestrator:
//!
//! - **gap**: addresses, roles, connection/PHY/data-length parameters, adapter state
//! - **smp**: security parameters, key material, keypress and auth status types
//!
//! Nothing here talks to hardware. The physical adapter lives behind
//! [`crate::transport::AdapterTransport`].

pub mod gap;
pub mod smp;

// Re-export commonly used types
pub use gap::{
    AdapterState, AddressType, ConnectOptions, ConnectionParams, DataLengthParams, DeviceAddress,
    DeviceInfo, OpenOptions, Phy, PhyParams, Role, ScanParams, DEFAULT_ATT_MTU,
    DEFAULT_DATA_LENGTH,
};

pub use smp::{
    AuthKeyType, AuthRequirements, AuthStatus, ConnectionSecurity, DhKey, EncInfo, EncKey, IdInfo,
    IdKey, IoCapabilities, KeyDistribution, KeyMaterial, KeySet, KeypressType, LescOobData,
    MasterId, PeerOobInput, PublicKey, SecurityParams, SignInfo, PAIRING_NOT_SUPPORTED,
    SEC_STATUS_SUCCESS,
};
