//! Adapter transport contract
//!
//! The physical BLE adapter (serial connectivity firmware, native stack, ...)
//! sits behind [`AdapterTransport`]. Every command is asynchronous and resolves
//! once with success or a [`TransportError`]. Events flow the other way as
//! [`super::TransportEvent`] values on a channel handed to
//! [`crate::Orchestrator::run`].

use async_trait::async_trait;

use super::abstraction::TransportError;
use super::ble::{
    AdapterState, AddressType, AuthKeyType, ConnectOptions, ConnectionParams, DataLengthParams,
    DeviceAddress, DhKey, EncInfo, IdInfo, KeySet, KeypressType, LescOobData, MasterId,
    OpenOptions, PhyParams, PublicKey, SecurityParams, SignInfo,
};

#[async_trait]
pub trait AdapterTransport: Send + Sync {
    // ---- adapter lifecycle ----

    /// Open the adapter
    async fn open(&self, options: &OpenOptions) -> Result<(), TransportError>;

    /// Close the adapter
    async fn close(&self) -> Result<(), TransportError>;

    /// Enable the BLE stack on the connectivity chip
    async fn enable_ble(&self) -> Result<(), TransportError>;

    /// Read back the adapter state
    async fn get_state(&self) -> Result<AdapterState, TransportError>;

    // ---- connection lifecycle ----

    async fn connect(
        &self,
        address: &DeviceAddress,
        address_type: Option<AddressType>,
        options: &ConnectOptions,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, address: &DeviceAddress) -> Result<(), TransportError>;

    /// Cancel the pending connect attempt. Resolving `Ok` confirms the cancel.
    async fn cancel_connect(&self) -> Result<(), TransportError>;

    // ---- security manager ----

    /// Start (or, with `None`, reject) a pairing procedure
    async fn authenticate(
        &self,
        address: &DeviceAddress,
        params: Option<SecurityParams>,
    ) -> Result<(), TransportError>;

    async fn reply_sec_params(
        &self,
        address: &DeviceAddress,
        status: u8,
        own_params: Option<SecurityParams>,
        keyset: Option<KeySet>,
    ) -> Result<(), TransportError>;

    async fn sec_info_reply(
        &self,
        address: &DeviceAddress,
        enc_info: Option<EncInfo>,
        id_info: Option<IdInfo>,
        sign_info: Option<SignInfo>,
    ) -> Result<(), TransportError>;

    async fn reply_lesc_dhkey(
        &self,
        address: &DeviceAddress,
        dhkey: DhKey,
    ) -> Result<(), TransportError>;

    async fn set_lesc_oob_data(
        &self,
        address: &DeviceAddress,
        own_oob: Option<LescOobData>,
        peer_oob: Option<LescOobData>,
    ) -> Result<(), TransportError>;

    /// Generate own LESC OOB data for the given public key
    async fn get_lesc_oob_data(
        &self,
        address: &DeviceAddress,
        own_public_key: &PublicKey,
    ) -> Result<LescOobData, TransportError>;

    async fn notify_keypress(
        &self,
        address: &DeviceAddress,
        keypress: KeypressType,
    ) -> Result<(), TransportError>;

    async fn reply_auth_key(
        &self,
        address: &DeviceAddress,
        key_type: AuthKeyType,
        key: Option<String>,
    ) -> Result<(), TransportError>;

    /// Compute the adapter's LESC public key
    async fn compute_public_key(&self) -> Result<PublicKey, TransportError>;

    /// Compute the LESC shared secret with a peer public key
    async fn compute_shared_secret(
        &self,
        peer_public_key: &PublicKey,
    ) -> Result<DhKey, TransportError>;

    /// Encrypt the link with stored bond keys
    async fn encrypt(
        &self,
        address: &DeviceAddress,
        master_id: MasterId,
        enc_info: EncInfo,
    ) -> Result<(), TransportError>;

    // ---- link parameters ----

    async fn update_connection_parameters(
        &self,
        address: &DeviceAddress,
        params: ConnectionParams,
    ) -> Result<(), TransportError>;

    async fn reject_conn_params(&self, address: &DeviceAddress) -> Result<(), TransportError>;

    async fn phy_update(
        &self,
        address: &DeviceAddress,
        phys: PhyParams,
    ) -> Result<(), TransportError>;

    /// Request an ATT MTU exchange, resolving with the negotiated MTU
    async fn request_att_mtu(
        &self,
        address: &DeviceAddress,
        mtu: u16,
    ) -> Result<u16, TransportError>;

    async fn att_mtu_reply(&self, address: &DeviceAddress, mtu: u16)
        -> Result<(), TransportError>;

    async fn data_length_update(
        &self,
        address: &DeviceAddress,
        params: DataLengthParams,
    ) -> Result<(), TransportError>;
}
