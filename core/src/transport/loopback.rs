//! In-process loopback transport
//!
//! Records every command it is asked to run and answers with deterministic
//! key material. Individual command kinds can be made to fail, or be held
//! until released, which lets tests and the replay tool drive the
//! orchestrator without a radio.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use super::abstraction::{TransportCommand, TransportError};
use super::adapter::AdapterTransport;
use super::ble::{
    AdapterState, AddressType, AuthKeyType, ConnectOptions, ConnectionParams, DataLengthParams,
    DeviceAddress, DhKey, EncInfo, IdInfo, KeySet, KeypressType, LescOobData, MasterId,
    OpenOptions, PhyParams, PublicKey, SecurityParams, SignInfo,
};

const LOOPBACK_PUBLIC_KEY: [u8; 64] = [0x11; 64];
const LOOPBACK_DHKEY: [u8; 32] = [0x22; 32];
const LOOPBACK_OOB_RANDOM: [u8; 16] = [0x33; 16];
const LOOPBACK_OOB_CONFIRM: [u8; 16] = [0x44; 16];

/// Transport that loops commands back as successes
#[derive(Default)]
pub struct LoopbackTransport {
    commands: Mutex<Vec<TransportCommand>>,
    failing: Mutex<HashSet<String>>,
    held: Mutex<HashMap<String, Arc<Notify>>>,
    state: Mutex<AdapterState>,
}

impl LoopbackTransport {
    /// Create a new loopback transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command with this driver name fail
    pub fn fail_on(&self, command: &str) {
        self.failing.lock().insert(command.to_string());
    }

    /// Stop failing commands with this driver name
    pub fn succeed_on(&self, command: &str) {
        self.failing.lock().remove(command);
    }

    /// Park commands with this driver name until [`Self::release`]
    pub fn hold(&self, command: &str) {
        self.held
            .lock()
            .insert(command.to_string(), Arc::new(Notify::new()));
    }

    /// Let a held command complete
    pub fn release(&self, command: &str) {
        if let Some(gate) = self.held.lock().remove(command) {
            gate.notify_one();
        }
    }

    /// Commands issued so far, in order
    pub fn commands(&self) -> Vec<TransportCommand> {
        self.commands.lock().clone()
    }

    /// Driver names of the commands issued so far
    pub fn command_names(&self) -> Vec<&'static str> {
        self.commands.lock().iter().map(|c| c.name()).collect()
    }

    /// Number of issued commands with the given driver name
    pub fn count(&self, command: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.name() == command)
            .count()
    }

    /// Drain the command log
    pub fn take_commands(&self) -> Vec<TransportCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    async fn issue(&self, command: TransportCommand) -> Result<(), TransportError> {
        let name = command.name();
        debug!("loopback <- {}", command);
        self.commands.lock().push(command);

        let gate = self.held.lock().get(name).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing.lock().contains(name) {
            return Err(TransportError::command_failed(name, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl AdapterTransport for LoopbackTransport {
    async fn open(&self, options: &OpenOptions) -> Result<(), TransportError> {
        self.issue(TransportCommand::Open {
            options: options.clone(),
        })
        .await?;
        self.state.lock().available = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.issue(TransportCommand::Close).await?;
        *self.state.lock() = AdapterState::default();
        Ok(())
    }

    async fn enable_ble(&self) -> Result<(), TransportError> {
        self.issue(TransportCommand::EnableBle).await
    }

    async fn get_state(&self) -> Result<AdapterState, TransportError> {
        self.issue(TransportCommand::GetState).await?;
        Ok(self.state.lock().clone())
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        address_type: Option<AddressType>,
        options: &ConnectOptions,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::Connect {
            address: address.clone(),
            address_type,
            options: *options,
        })
        .await
    }

    async fn disconnect(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        self.issue(TransportCommand::Disconnect {
            address: address.clone(),
        })
        .await
    }

    async fn cancel_connect(&self) -> Result<(), TransportError> {
        self.issue(TransportCommand::CancelConnect).await
    }

    async fn authenticate(
        &self,
        address: &DeviceAddress,
        params: Option<SecurityParams>,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::Authenticate {
            address: address.clone(),
            params,
        })
        .await
    }

    async fn reply_sec_params(
        &self,
        address: &DeviceAddress,
        status: u8,
        own_params: Option<SecurityParams>,
        keyset: Option<KeySet>,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::ReplySecParams {
            address: address.clone(),
            status,
            own_params,
            keyset,
        })
        .await
    }

    async fn sec_info_reply(
        &self,
        address: &DeviceAddress,
        enc_info: Option<EncInfo>,
        id_info: Option<IdInfo>,
        sign_info: Option<SignInfo>,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::SecInfoReply {
            address: address.clone(),
            enc_info,
            id_info,
            sign_info,
        })
        .await
    }

    async fn reply_lesc_dhkey(
        &self,
        address: &DeviceAddress,
        dhkey: DhKey,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::ReplyLescDhkey {
            address: address.clone(),
            dhkey,
        })
        .await
    }

    async fn set_lesc_oob_data(
        &self,
        address: &DeviceAddress,
        own_oob: Option<LescOobData>,
        peer_oob: Option<LescOobData>,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::SetLescOobData {
            address: address.clone(),
            own_oob,
            peer_oob,
        })
        .await
    }

    async fn get_lesc_oob_data(
        &self,
        address: &DeviceAddress,
        own_public_key: &PublicKey,
    ) -> Result<LescOobData, TransportError> {
        self.issue(TransportCommand::GetLescOobData {
            address: address.clone(),
            own_public_key: own_public_key.clone(),
        })
        .await?;
        Ok(LescOobData {
            address: Some(address.clone()),
            address_type: None,
            r: LOOPBACK_OOB_RANDOM.to_vec(),
            c: LOOPBACK_OOB_CONFIRM.to_vec(),
        })
    }

    async fn notify_keypress(
        &self,
        address: &DeviceAddress,
        keypress: KeypressType,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::NotifyKeypress {
            address: address.clone(),
            keypress,
        })
        .await
    }

    async fn reply_auth_key(
        &self,
        address: &DeviceAddress,
        key_type: AuthKeyType,
        key: Option<String>,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::ReplyAuthKey {
            address: address.clone(),
            key_type,
            key,
        })
        .await
    }

    async fn compute_public_key(&self) -> Result<PublicKey, TransportError> {
        self.issue(TransportCommand::ComputePublicKey).await?;
        Ok(PublicKey(LOOPBACK_PUBLIC_KEY.to_vec()))
    }

    async fn compute_shared_secret(
        &self,
        peer_public_key: &PublicKey,
    ) -> Result<DhKey, TransportError> {
        self.issue(TransportCommand::ComputeSharedSecret {
            peer_public_key: peer_public_key.clone(),
        })
        .await?;
        Ok(DhKey(LOOPBACK_DHKEY.to_vec()))
    }

    async fn encrypt(
        &self,
        address: &DeviceAddress,
        master_id: MasterId,
        enc_info: EncInfo,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::Encrypt {
            address: address.clone(),
            master_id,
            enc_info,
        })
        .await
    }

    async fn update_connection_parameters(
        &self,
        address: &DeviceAddress,
        params: ConnectionParams,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::UpdateConnectionParameters {
            address: address.clone(),
            params,
        })
        .await
    }

    async fn reject_conn_params(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        self.issue(TransportCommand::RejectConnParams {
            address: address.clone(),
        })
        .await
    }

    async fn phy_update(
        &self,
        address: &DeviceAddress,
        phys: PhyParams,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::PhyUpdate {
            address: address.clone(),
            phys,
        })
        .await
    }

    async fn request_att_mtu(
        &self,
        address: &DeviceAddress,
        mtu: u16,
    ) -> Result<u16, TransportError> {
        self.issue(TransportCommand::RequestAttMtu {
            address: address.clone(),
            mtu,
        })
        .await?;
        Ok(mtu)
    }

    async fn att_mtu_reply(
        &self,
        address: &DeviceAddress,
        mtu: u16,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::AttMtuReply {
            address: address.clone(),
            mtu,
        })
        .await
    }

    async fn data_length_update(
        &self,
        address: &DeviceAddress,
        params: DataLengthParams,
    ) -> Result<(), TransportError> {
        self.issue(TransportCommand::DataLengthUpdate {
            address: address.clone(),
            params,
        })
        .await
    }
}
