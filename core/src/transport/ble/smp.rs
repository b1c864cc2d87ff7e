//! Security Manager value types
//!
//! Pairing parameters, key material exchanged during bonding, keypress
//! notifications and the authentication status reported at the end of a
//! pairing procedure.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::gap::{AddressType, DeviceAddress};

/// SMP "pairing not supported" reason code, used when rejecting as peripheral
pub const PAIRING_NOT_SUPPORTED: u8 = 0x85;

/// SMP success status
pub const SEC_STATUS_SUCCESS: u8 = 0x00;

/// IO capabilities advertised during pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoCapabilities {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl Default for IoCapabilities {
    fn default() -> Self {
        IoCapabilities::KeyboardDisplay
    }
}

/// Which keys a side distributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyDistribution {
    pub enc: bool,
    pub id: bool,
    pub sign: bool,
    pub link: bool,
}

/// Authentication requirement flags (bond / MITM / LESC / keypress)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthRequirements {
    pub bond: bool,
    pub mitm: bool,
    pub lesc: bool,
    pub keypress: bool,
}

/// Full pairing parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityParams {
    pub bond: bool,
    pub mitm: bool,
    pub lesc: bool,
    pub keypress: bool,
    pub io_caps: IoCapabilities,
    pub oob: bool,
    pub min_key_size: u8,
    pub max_key_size: u8,
    pub kdist_own: KeyDistribution,
    pub kdist_peer: KeyDistribution,
}

impl Default for SecurityParams {
    fn default() -> Self {
        let all = KeyDistribution {
            enc: true,
            id: true,
            sign: false,
            link: false,
        };
        Self {
            bond: false,
            mitm: false,
            lesc: false,
            keypress: false,
            io_caps: IoCapabilities::default(),
            oob: false,
            min_key_size: 7,
            max_key_size: 16,
            kdist_own: all,
            kdist_peer: all,
        }
    }
}

impl SecurityParams {
    /// The flags a local pairing decision is allowed to see from this parameter set
    pub fn auth_requirements(&self) -> AuthRequirements {
        AuthRequirements {
            bond: self.bond,
            mitm: self.mitm,
            lesc: self.lesc,
            keypress: self.keypress,
        }
    }
}

/// Long term key information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncInfo {
    pub ltk: Vec<u8>,
    pub lesc: bool,
    pub auth: bool,
    pub ltk_len: u8,
}

/// Master identification (EDIV + Rand) for legacy LTK lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterId {
    pub ediv: u16,
    pub rand: Vec<u8>,
}

/// Encryption key: LTK plus its master identification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncKey {
    pub enc_info: EncInfo,
    pub master_id: MasterId,
}

/// Identity resolving key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdInfo {
    pub irk: Vec<u8>,
}

/// Identity key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdKey {
    pub id_info: IdInfo,
}

/// Connection signature resolving key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInfo {
    pub csrk: Vec<u8>,
}

/// LESC P-256 public key (64 bytes, X || Y)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(pub Vec<u8>);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0))
    }
}

/// LESC Diffie-Hellman shared secret
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DhKey(pub Vec<u8>);

impl fmt::Debug for DhKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhKey(<{} bytes>)", self.0.len())
    }
}

/// Keys belonging to one side of a link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyMaterial {
    pub enc_key: Option<EncKey>,
    pub id_key: Option<IdKey>,
    pub sign_key: Option<SignInfo>,
    pub pk: Option<PublicKey>,
}

impl KeyMaterial {
    /// Public key, encryption key and identity key are all present
    pub fn is_complete(&self) -> bool {
        self.pk.is_some() && self.enc_key.is_some() && self.id_key.is_some()
    }
}

/// Own and peer key material exchanged in one pairing procedure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySet {
    pub keys_own: KeyMaterial,
    pub keys_peer: KeyMaterial,
}

impl KeySet {
    /// Key set carrying only this side's public key
    pub fn with_own_public_key(pk: Option<PublicKey>) -> Self {
        Self {
            keys_own: KeyMaterial {
                pk,
                ..KeyMaterial::default()
            },
            keys_peer: KeyMaterial::default(),
        }
    }
}

/// Key type requested by an auth key request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKeyType {
    None,
    Passkey,
    Oob,
}

impl AuthKeyType {
    /// Numeric value used on the wire
    pub fn wire_value(&self) -> u8 {
        match self {
            AuthKeyType::None => 0,
            AuthKeyType::Passkey => 1,
            AuthKeyType::Oob => 2,
        }
    }
}

/// Passkey keypress notification types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypressType {
    PasskeyStart,
    PasskeyDigitIn,
    PasskeyDigitOut,
    PasskeyClear,
    PasskeyEnd,
}

impl fmt::Display for KeypressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeypressType::PasskeyStart => "BLE_GAP_KP_NOT_TYPE_PASSKEY_START",
            KeypressType::PasskeyDigitIn => "BLE_GAP_KP_NOT_TYPE_PASSKEY_DIGIT_IN",
            KeypressType::PasskeyDigitOut => "BLE_GAP_KP_NOT_TYPE_PASSKEY_DIGIT_OUT",
            KeypressType::PasskeyClear => "BLE_GAP_KP_NOT_TYPE_PASSKEY_CLEAR",
            KeypressType::PasskeyEnd => "BLE_GAP_KP_NOT_TYPE_PASSKEY_END",
        };
        f.write_str(name)
    }
}

/// LESC out-of-band data (random + confirm) bound to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LescOobData {
    #[serde(default)]
    pub address: Option<DeviceAddress>,
    #[serde(default)]
    pub address_type: Option<AddressType>,
    pub r: Vec<u8>,
    pub c: Vec<u8>,
}

/// Peer OOB values as entered by the user, hex encoded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOobInput {
    pub random: String,
    pub confirm: String,
}

impl PeerOobInput {
    /// True when either half was left empty
    pub fn is_empty(&self) -> bool {
        self.random.is_empty() || self.confirm.is_empty()
    }

    /// Decode into OOB data for the given peer, `None` when left empty
    pub fn to_oob_data(
        &self,
        address: &DeviceAddress,
        address_type: Option<AddressType>,
    ) -> Result<Option<LescOobData>, hex::FromHexError> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(LescOobData {
            address: Some(address.clone()),
            address_type,
            r: hex::decode(self.random.trim())?,
            c: hex::decode(self.confirm.trim())?,
        }))
    }
}

/// Security mode and level of an encrypted link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSecurity {
    pub sec_mode: u8,
    pub sec_level: u8,
}

/// Authentication status reported at the end of pairing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthStatus {
    pub auth_status: u8,
    pub auth_status_name: String,
    pub bonded: bool,
    pub keyset: Option<KeySet>,
}

impl AuthStatus {
    /// Authentication succeeded
    pub fn is_success(&self) -> bool {
        self.auth_status == SEC_STATUS_SUCCESS
    }

    /// The own side of the reported key set can be persisted as a bond
    pub fn has_complete_keyset(&self) -> bool {
        self.keyset
            .as_ref()
            .map(|keys| keys.keys_own.is_complete())
            .unwrap_or(false)
    }
}
