// Bond store gateway: persisted key material per peer address

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::transport::ble::{DeviceAddress, EncInfo, KeyMaterial, KeySet, MasterId};

/// Key material kept for a bonded peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondRecord {
    pub keys_own: KeyMaterial,
    pub keys_peer: KeyMaterial,
}

impl BondRecord {
    /// Whether the bond came out of an LE Secure Connections pairing
    pub fn is_lesc(&self) -> bool {
        self.keys_own
            .enc_key
            .as_ref()
            .map(|key| key.enc_info.lesc)
            .unwrap_or(false)
    }

    /// Keys used to re-encrypt the link as central.
    ///
    /// LESC bonds share one LTK, so our own copy is used. Legacy bonds use the
    /// LTK the peripheral distributed.
    pub fn encryption_keys(&self) -> Option<(MasterId, EncInfo)> {
        let side = if self.is_lesc() {
            &self.keys_own
        } else {
            &self.keys_peer
        };
        side.enc_key
            .as_ref()
            .map(|key| (key.master_id.clone(), key.enc_info.clone()))
    }
}

impl From<KeySet> for BondRecord {
    fn from(keyset: KeySet) -> Self {
        Self {
            keys_own: keyset.keys_own,
            keys_peer: keyset.keys_peer,
        }
    }
}

#[derive(Debug, Error)]
pub enum BondStoreError {
    #[error("Bond store unavailable: {0}")]
    Unavailable(String),
    #[error("Bond store write failed: {0}")]
    WriteFailed(String),
}

/// Persistence contract for bonded key sets
pub trait BondStore: Send + Sync {
    fn lookup(&self, address: &DeviceAddress) -> Result<Option<BondRecord>, BondStoreError>;
    fn insert(&self, address: &DeviceAddress, record: BondRecord) -> Result<(), BondStoreError>;
}

/// In-memory bond store useful for testing and single-run sessions
#[derive(Clone, Default)]
pub struct InMemoryBondStore {
    records: Arc<RwLock<HashMap<DeviceAddress, BondRecord>>>,
}

impl InMemoryBondStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.records.read().contains_key(address)
    }
}

impl BondStore for InMemoryBondStore {
    fn lookup(&self, address: &DeviceAddress) -> Result<Option<BondRecord>, BondStoreError> {
        Ok(self.records.read().get(address).cloned())
    }

    fn insert(&self, address: &DeviceAddress, record: BondRecord) -> Result<(), BondStoreError> {
        self.records.write().insert(address.clone(), record);
        Ok(())
    }
}
