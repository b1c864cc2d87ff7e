//! Security procedure state machine
//!
//! Drives pairing, bonding and link encryption for one session. Peer-driven
//! steps arrive as transport events (security request, parameter exchange,
//! key requests, auth status); local steps are the public operations the
//! application calls with the correlation id it was handed in the matching
//! upstream request.
//!
//! The peer role decides the branch: a `Central` peer means this adapter is
//! the peripheral and answers parameter exchanges, a `Peripheral` peer means
//! this adapter is the central and starts authentication itself.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::bond::BondRecord;
use crate::events::{CorrelationId, ProcedureStatus, UpstreamEvent};
use crate::orchestrator::Orchestrator;
use crate::session::{DeviceSession, Initiator, ProcedureKind, SessionError};
use crate::transport::ble::{
    AuthKeyType, AuthRequirements, AuthStatus, ConnectionSecurity, DeviceAddress, KeySet,
    KeypressType, LescOobData, PeerOobInput, PublicKey, Role, SecurityParams,
    PAIRING_NOT_SUPPORTED,
};
use crate::transport::TransportError;

// ============================================================================
// STATE
// ============================================================================

/// Pairing method in use once keys are being exchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyExchange {
    Legacy,
    Lesc,
}

impl KeyExchange {
    /// LESC only when both sides asked for it
    pub fn negotiate(own: Option<&SecurityParams>, peer: Option<&SecurityParams>) -> Self {
        let own_lesc = own.map(|p| p.lesc).unwrap_or(false);
        let peer_lesc = peer.map(|p| p.lesc).unwrap_or(false);
        if own_lesc && peer_lesc {
            KeyExchange::Lesc
        } else {
            KeyExchange::Legacy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityState {
    Idle,
    PeerSecurityRequested,
    OwnParamsStored,
    AwaitingPeerParams,
    KeyExchangeInFlight(KeyExchange),
    AwaitingAuthStatus,
    Bonded,
    /// Authenticated without a persisted bond
    Authenticated,
    Failed,
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityState::Idle => write!(f, "idle"),
            SecurityState::PeerSecurityRequested => write!(f, "peer security requested"),
            SecurityState::OwnParamsStored => write!(f, "own params stored"),
            SecurityState::AwaitingPeerParams => write!(f, "awaiting peer params"),
            SecurityState::KeyExchangeInFlight(KeyExchange::Legacy) => {
                write!(f, "key exchange (legacy)")
            }
            SecurityState::KeyExchangeInFlight(KeyExchange::Lesc) => write!(f, "key exchange (LESC)"),
            SecurityState::AwaitingAuthStatus => write!(f, "awaiting auth status"),
            SecurityState::Bonded => write!(f, "bonded"),
            SecurityState::Authenticated => write!(f, "authenticated"),
            SecurityState::Failed => write!(f, "failed"),
        }
    }
}

/// Per-session security context
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub state: SecurityState,
    pub own_params: Option<SecurityParams>,
    pub peer_params: Option<SecurityParams>,
    /// Key set of the procedure in progress, recomputed for every procedure
    pub keyset: Option<KeySet>,
    pub bonded: bool,
    /// This adapter, as peripheral, started pairing and the central's
    /// parameter exchange is still to come
    pub own_periph_initiated_pending: bool,
    pub connection_security: Option<ConnectionSecurity>,
    /// Procedures for which a passkey-start keypress has been sent
    pub keypress_start_sent: HashSet<CorrelationId>,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self {
            state: SecurityState::Idle,
            own_params: None,
            peer_params: None,
            keyset: None,
            bonded: false,
            own_periph_initiated_pending: false,
            connection_security: None,
            keypress_start_sent: HashSet::new(),
        }
    }
}

impl SecurityContext {
    /// Keypress notifications are exchanged only when both sides enabled them
    pub fn keypress_enabled(&self) -> bool {
        let own = self.own_params.map(|p| p.keypress).unwrap_or(false);
        let peer = self.peer_params.map(|p| p.keypress).unwrap_or(false);
        own && peer
    }

    /// Back to idle after the link went down. Stored params and the bonded
    /// flag describe the device and survive.
    pub fn reset(&mut self) {
        self.state = SecurityState::Idle;
        self.keyset = None;
        self.own_periph_initiated_pending = false;
        self.connection_security = None;
        self.keypress_start_sent.clear();
    }

    fn key_exchange(&self) -> KeyExchange {
        KeyExchange::negotiate(self.own_params.as_ref(), self.peer_params.as_ref())
    }
}

/// Id of the outstanding security procedure, starting a peer one if none is
fn security_procedure_id(session: &mut DeviceSession, fresh: CorrelationId) -> CorrelationId {
    if let Some(slot) = session.slots.outstanding(ProcedureKind::Security) {
        return slot.id;
    }
    // cannot be busy: nothing is outstanding
    let _ = session
        .slots
        .begin(ProcedureKind::Security, fresh, Initiator::Peer);
    fresh
}

// ============================================================================
// PEER-DRIVEN STEPS
// ============================================================================

impl Orchestrator {
    pub(crate) async fn on_security_request(
        &self,
        address: &DeviceAddress,
        requirements: AuthRequirements,
    ) {
        let config = self.config();
        let defaults = match config.security_params {
            Some(params) => params,
            None => {
                warn!("Security request received but security params are undefined");
                return;
            }
        };

        let id = self.next_correlation_id();
        let begun = self.with_session(address, |session| {
            if let Some(slot) = session.slots.outstanding(ProcedureKind::Security) {
                return Err(slot.id);
            }
            let _ = session
                .slots
                .begin(ProcedureKind::Security, id, Initiator::Peer);
            session.security.state = SecurityState::PeerSecurityRequested;
            Ok(())
        });
        match begun {
            Some(Ok(())) => {}
            Some(Err(outstanding)) => {
                warn!(
                    "Security request from {} while procedure {} is outstanding, dropping",
                    address, outstanding
                );
                return;
            }
            None => return,
        }

        if !config.auto_accept_pairing {
            self.emit(UpstreamEvent::SecurityRequest {
                address: address.clone(),
                id,
                requirements,
            });
            return;
        }

        self.with_session(address, |session| {
            session.security.own_params = Some(defaults);
            session.security.state = SecurityState::OwnParamsStored;
        });
        match self.transport.authenticate(address, Some(defaults)).await {
            Ok(()) => {
                debug!("Authenticate {} with default params", address);
                self.with_session(address, |session| {
                    session.security.state = SecurityState::AwaitingPeerParams;
                });
            }
            Err(e) => self.security_failed(address, format!("authenticate failed: {}", e)),
        }
    }

    pub(crate) async fn on_sec_params_request(
        &self,
        address: &DeviceAddress,
        peer_params: SecurityParams,
    ) {
        let config = self.config();
        let fresh = self.next_correlation_id();
        let context = self.with_session(address, |session| {
            session.security.peer_params = Some(peer_params);
            let id = security_procedure_id(session, fresh);
            (
                id,
                session.role,
                session.security.own_periph_initiated_pending,
                session.security.own_params,
            )
        });
        let Some((id, role, periph_initiated, stored_own)) = context else {
            return;
        };

        match role {
            Some(Role::Central) if periph_initiated => {
                let Some(keyset) = self.keyset_or_fail(address).await else {
                    return;
                };
                let own = match stored_own {
                    Some(params) => Some(params),
                    None => {
                        info!("Could not retrieve stored security params, using default params");
                        config.security_params
                    }
                };
                match self
                    .transport
                    .reply_sec_params(address, 0, own, Some(keyset))
                    .await
                {
                    Ok(()) => {
                        debug!("ReplySecParams to {}, own params: {:?}", address, own);
                        self.with_session(address, |session| {
                            session.security.own_params = own;
                            session.security.own_periph_initiated_pending = false;
                            session.security.state =
                                SecurityState::KeyExchangeInFlight(session.security.key_exchange());
                        });
                    }
                    Err(e) => {
                        warn!("Error when calling replySecParams: {}", e);
                        self.security_failed(address, format!("replySecParams failed: {}", e));
                    }
                }
            }
            Some(Role::Central) => {
                if config.auto_accept_pairing {
                    match config.security_params {
                        Some(defaults) => {
                            if let Err(e) = self.accept_pairing(address, id, defaults).await {
                                self.emit(UpstreamEvent::AuthError {
                                    address: address.clone(),
                                    id: Some(id),
                                    reason: e.to_string(),
                                });
                            }
                        }
                        None => {
                            warn!(
                                "Pairing requested by {} but security params are undefined",
                                address
                            );
                            self.with_session(address, |session| {
                                session.security.state = SecurityState::Idle;
                                session
                                    .slots
                                    .finish(ProcedureKind::Security, id, ProcedureStatus::Error)
                            });
                        }
                    }
                } else {
                    self.with_session(address, |session| {
                        session.security.state = SecurityState::PeerSecurityRequested;
                    });
                    self.emit(UpstreamEvent::SecurityRequest {
                        address: address.clone(),
                        id,
                        requirements: peer_params.auth_requirements(),
                    });
                }
            }
            Some(Role::Peripheral) => {
                let Some(keyset) = self.keyset_or_fail(address).await else {
                    return;
                };
                match self
                    .transport
                    .reply_sec_params(address, 0, None, Some(keyset))
                    .await
                {
                    Ok(()) => {
                        debug!("ReplySecParams to {}, own params: none", address);
                        self.with_session(address, |session| {
                            session.security.state =
                                SecurityState::KeyExchangeInFlight(session.security.key_exchange());
                        });
                    }
                    Err(e) => {
                        warn!("Error when calling replySecParams: {}", e);
                        self.security_failed(address, format!("replySecParams failed: {}", e));
                    }
                }
            }
            None => {
                warn!("Security parameters requested by {} with unknown role", address);
                self.security_failed(address, "Invalid role".to_string());
            }
        }
    }

    pub(crate) async fn on_sec_info_request(&self, address: &DeviceAddress) {
        let bond = match self.bonds.lookup(address) {
            Ok(bond) => bond,
            Err(e) => {
                warn!("Bond lookup for {} failed: {}", address, e);
                None
            }
        };

        let (enc_info, id_info) = match bond {
            Some(record) => (
                record.keys_own.enc_key.map(|key| key.enc_info),
                record.keys_own.id_key.map(|key| key.id_info),
            ),
            None => {
                info!(
                    "Peer requested encryption, but no keys are found for address {}",
                    address
                );
                (None, None)
            }
        };

        match self
            .transport
            .sec_info_reply(address, enc_info, id_info, None)
            .await
        {
            Ok(()) => {
                self.with_session(address, |session| {
                    session.security.state = SecurityState::AwaitingAuthStatus;
                });
            }
            Err(e) => {
                warn!("Error when calling secInfoReply: {}", e);
                self.security_failed(address, format!("secInfoReply failed: {}", e));
            }
        }
    }

    pub(crate) fn on_auth_key_request(&self, address: &DeviceAddress, key_type: AuthKeyType) {
        let fresh = self.next_correlation_id();
        let context = self.with_session(address, |session| {
            let id = security_procedure_id(session, fresh);
            if !matches!(session.security.state, SecurityState::KeyExchangeInFlight(_)) {
                session.security.state =
                    SecurityState::KeyExchangeInFlight(session.security.key_exchange());
            }
            (id, session.security.keypress_enabled())
        });

        if let Some((id, send_keypress)) = context {
            self.emit(UpstreamEvent::AuthKeyRequest {
                address: address.clone(),
                id,
                key_type,
                send_keypress,
            });
        }
    }

    pub(crate) fn on_passkey_display(
        &self,
        address: &DeviceAddress,
        passkey: String,
        match_request: bool,
    ) {
        let fresh = self.next_correlation_id();
        let context = self.with_session(address, |session| {
            let id = security_procedure_id(session, fresh);
            if !matches!(session.security.state, SecurityState::KeyExchangeInFlight(_)) {
                session.security.state =
                    SecurityState::KeyExchangeInFlight(session.security.key_exchange());
            }
            (id, session.security.keypress_enabled())
        });

        if let Some((id, receive_keypress)) = context {
            self.emit(UpstreamEvent::PasskeyDisplay {
                address: address.clone(),
                id,
                passkey,
                match_request,
                receive_keypress,
            });
        }
    }

    pub(crate) async fn on_lesc_dhkey_request(
        &self,
        address: &DeviceAddress,
        peer_public_key: PublicKey,
        oob_required: bool,
    ) {
        let fresh = self.next_correlation_id();
        let Some(id) = self.with_session(address, |session| {
            session.security.state = SecurityState::KeyExchangeInFlight(KeyExchange::Lesc);
            security_procedure_id(session, fresh)
        }) else {
            return;
        };

        // Both are attempted even if the other fails
        let dhkey_reply = async {
            let dhkey = self.transport.compute_shared_secret(&peer_public_key).await?;
            self.transport.reply_lesc_dhkey(address, dhkey).await
        };
        let own_oob = async {
            let public_key = self.transport.compute_public_key().await?;
            self.transport.get_lesc_oob_data(address, &public_key).await
        };
        let (dhkey_result, oob_result) = futures::join!(dhkey_reply, own_oob);

        let dhkey_sent = match dhkey_result {
            Ok(()) => true,
            Err(e) => {
                warn!("Error when sending LESC DH key: {}", e);
                self.security_failed(address, format!("replyLescDhkey failed: {}", e));
                false
            }
        };

        match oob_result {
            Ok(own_oob) => {
                debug!("Own OOB data for {}: {:?}", address, own_oob);
                if oob_required {
                    self.emit(UpstreamEvent::LescOobRequest {
                        address: address.clone(),
                        id,
                        own_oob,
                    });
                } else if dhkey_sent {
                    self.with_session(address, |session| {
                        session.security.state = SecurityState::AwaitingAuthStatus;
                    });
                }
            }
            Err(e) => {
                warn!("Error in getLescOobData: {}", e);
                self.security_failed(address, format!("getLescOobData failed: {}", e));
            }
        }
    }

    pub(crate) fn on_key_pressed(&self, address: &DeviceAddress, keypress: KeypressType) {
        self.emit(UpstreamEvent::KeypressReceived {
            address: address.clone(),
            keypress,
        });
    }

    pub(crate) fn on_security_changed(&self, address: &DeviceAddress, security: ConnectionSecurity) {
        self.with_session(address, |session| {
            session.security.connection_security = Some(security);
        });
        self.emit(UpstreamEvent::SecurityChanged {
            address: address.clone(),
            security,
        });
    }

    pub(crate) fn on_security_request_timed_out(&self, address: &DeviceAddress) {
        let id = self
            .with_session(address, |session| {
                session.security.state = SecurityState::Failed;
                session.security.keyset = None;
                session
                    .slots
                    .finish_outstanding(ProcedureKind::Security, ProcedureStatus::Error)
            })
            .flatten();
        self.emit(UpstreamEvent::SecurityRequestTimedOut {
            address: address.clone(),
            id,
        });
    }

    pub(crate) fn on_auth_status(&self, address: &DeviceAddress, status: AuthStatus) {
        if !status.is_success() {
            warn!(
                "Authentication failed with status {}",
                status.auth_status_name
            );
            let reason = if status.auth_status_name.is_empty() {
                format!("authentication failed with status {:#04x}", status.auth_status)
            } else {
                status.auth_status_name.clone()
            };
            self.security_failed(address, reason);
            return;
        }

        let id = self
            .with_session(address, |session| {
                session.security.own_periph_initiated_pending = false;
                session.security.keyset = None;
                session.security.state = SecurityState::Authenticated;
                session
                    .slots
                    .finish_outstanding(ProcedureKind::Security, ProcedureStatus::Success)
            })
            .flatten();
        self.emit(UpstreamEvent::AuthSucceeded {
            address: address.clone(),
            id,
        });

        if !status.has_complete_keyset() {
            return;
        }
        if !status.bonded {
            debug!("No bonding performed, do not store keys");
            return;
        }
        let Some(keyset) = status.keyset else {
            return;
        };

        match self.bonds.insert(address, BondRecord::from(keyset)) {
            Ok(()) => {
                self.with_session(address, |session| {
                    session.security.bonded = true;
                    session.security.state = SecurityState::Bonded;
                });
                self.emit(UpstreamEvent::BondInfoAdded {
                    address: address.clone(),
                });
            }
            Err(e) => warn!("Failed to store bond for {}: {}", address, e),
        }
    }

    /// Re-encrypt a link to a bonded peripheral with the stored keys
    pub(crate) async fn encrypt_if_bonded(&self, address: &DeviceAddress) {
        let record = match self.bonds.lookup(address) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!("Bond lookup for {} failed: {}", address, e);
                return;
            }
        };
        let Some((master_id, enc_info)) = record.encryption_keys() else {
            debug!("Bond for {} has no encryption key", address);
            return;
        };

        debug!(
            "Encrypt {}, lesc: {}, ediv: {}",
            address,
            record.is_lesc(),
            master_id.ediv
        );
        if let Err(e) = self.transport.encrypt(address, master_id, enc_info).await {
            warn!("Encrypt procedure failed: {}", e);
        }
    }

    /// Fail the outstanding security procedure and report it
    fn security_failed(&self, address: &DeviceAddress, reason: String) {
        let id = self
            .with_session(address, |session| {
                session.security.state = SecurityState::Failed;
                session.security.keyset = None;
                session.security.own_periph_initiated_pending = false;
                session
                    .slots
                    .finish_outstanding(ProcedureKind::Security, ProcedureStatus::Error)
            })
            .flatten();
        self.emit(UpstreamEvent::AuthError {
            address: address.clone(),
            id,
            reason,
        });
    }

    async fn keyset_or_fail(&self, address: &DeviceAddress) -> Option<KeySet> {
        match self.procedure_keyset(address).await {
            Ok(keyset) => Some(keyset),
            Err(e) => {
                self.security_failed(address, format!("computePublicKey failed: {}", e));
                None
            }
        }
    }

    /// Compute a fresh own public key and keep the key set on the session
    async fn procedure_keyset(&self, address: &DeviceAddress) -> Result<KeySet, TransportError> {
        let public_key = self.transport.compute_public_key().await?;
        let keyset = KeySet::with_own_public_key(Some(public_key));
        self.with_session(address, |session| {
            session.security.keyset = Some(keyset.clone());
        });
        Ok(keyset)
    }
}

// ============================================================================
// LOCAL OPERATIONS
// ============================================================================

impl Orchestrator {
    /// Join or start the security procedure `id`, returning the peer role
    fn claim_security(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
    ) -> Result<Option<Role>, SessionError> {
        self.require_session(address, |session| {
            session
                .slots
                .begin(ProcedureKind::Security, id, Initiator::Local)
                .map(|_| session.role)
                .map_err(|busy| SessionError::ProcedureBusy {
                    kind: ProcedureKind::Security,
                    outstanding: busy.outstanding,
                })
        })?
    }

    fn pairing_status(&self, address: &DeviceAddress, id: CorrelationId, status: ProcedureStatus) {
        self.emit(UpstreamEvent::PairingStatus {
            address: address.clone(),
            id,
            status,
        });
    }

    fn auth_key_status(&self, address: &DeviceAddress, id: CorrelationId, status: ProcedureStatus) {
        self.emit(UpstreamEvent::AuthKeyStatus {
            address: address.clone(),
            id,
            status,
        });
    }

    /// Terminal failure of a locally driven pairing step
    fn pairing_failed(&self, address: &DeviceAddress, id: CorrelationId) {
        self.with_session(address, |session| {
            session.security.state = SecurityState::Failed;
            session.security.keyset = None;
            session
                .slots
                .finish(ProcedureKind::Security, id, ProcedureStatus::Error);
        });
        self.pairing_status(address, id, ProcedureStatus::Error);
    }

    /// Start pairing with `params`
    pub async fn pair(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        params: SecurityParams,
    ) -> Result<(), SessionError> {
        let role = match self.claim_security(address, id) {
            Ok(role) => role,
            Err(e) => {
                warn!("Cannot pair with {}: {}", address, e);
                self.pairing_status(address, id, ProcedureStatus::Error);
                return Err(e);
            }
        };

        match self.transport.authenticate(address, Some(params)).await {
            Ok(()) => {
                debug!("Authenticate {}, params: {:?}", address, params);
                self.with_session(address, |session| {
                    session.security.own_params = Some(params);
                    session.security.own_periph_initiated_pending = role == Some(Role::Central);
                    session.security.state = SecurityState::AwaitingPeerParams;
                });
                self.pairing_status(address, id, ProcedureStatus::Pending);
                Ok(())
            }
            Err(e) => {
                warn!("Pairing with {} failed: {}", address, e);
                self.pairing_failed(address, id);
                Err(e.into())
            }
        }
    }

    /// Accept a surfaced pairing request with `params`
    pub async fn accept_pairing(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        params: SecurityParams,
    ) -> Result<(), SessionError> {
        let role = match self.claim_security(address, id) {
            Ok(role) => role,
            Err(e) => {
                warn!("Cannot accept pairing with {}: {}", address, e);
                self.pairing_status(address, id, ProcedureStatus::Error);
                return Err(e);
            }
        };

        let keyset = match self.procedure_keyset(address).await {
            Ok(keyset) => keyset,
            Err(e) => {
                self.pairing_failed(address, id);
                return Err(e.into());
            }
        };

        let result = match role {
            Some(Role::Peripheral) => self.transport.authenticate(address, Some(params)).await,
            Some(Role::Central) => {
                self.transport
                    .reply_sec_params(address, 0, Some(params), Some(keyset))
                    .await
            }
            None => {
                warn!("Cannot accept pairing with {}: unknown role", address);
                self.pairing_failed(address, id);
                return Err(SessionError::UnknownRole(address.clone()));
            }
        };

        match result {
            Ok(()) => {
                self.with_session(address, |session| {
                    session.security.own_params = Some(params);
                    session.security.state = match role {
                        Some(Role::Central) => {
                            SecurityState::KeyExchangeInFlight(session.security.key_exchange())
                        }
                        _ => SecurityState::AwaitingPeerParams,
                    };
                });
                self.pairing_status(address, id, ProcedureStatus::Pending);
                Ok(())
            }
            Err(e) => {
                warn!("Accepting pairing with {} failed: {}", address, e);
                self.pairing_failed(address, id);
                Err(e.into())
            }
        }
    }

    /// Turn down a surfaced pairing request
    pub async fn reject_pairing(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
    ) -> Result<(), SessionError> {
        let role = match self.claim_security(address, id) {
            Ok(role) => role,
            Err(e) => {
                self.pairing_status(address, id, ProcedureStatus::Error);
                return Err(e);
            }
        };

        let result = match role {
            Some(Role::Peripheral) => self.transport.authenticate(address, None).await,
            Some(Role::Central) => {
                self.transport
                    .reply_sec_params(address, PAIRING_NOT_SUPPORTED, None, None)
                    .await
            }
            None => {
                warn!("Cannot reject pairing with {}: invalid role", address);
                self.pairing_failed(address, id);
                return Err(SessionError::UnknownRole(address.clone()));
            }
        };

        match result {
            Ok(()) => {
                self.with_session(address, |session| {
                    session.security.state = SecurityState::Idle;
                    session.security.keyset = None;
                    session
                        .slots
                        .finish(ProcedureKind::Security, id, ProcedureStatus::Rejected);
                });
                self.pairing_status(address, id, ProcedureStatus::Rejected);
                Ok(())
            }
            Err(e) => {
                self.pairing_failed(address, id);
                Err(e.into())
            }
        }
    }

    /// Answer an auth key request. A pending keypress sequence is closed first.
    pub async fn reply_auth_key(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        key_type: AuthKeyType,
        key: Option<String>,
    ) -> Result<(), SessionError> {
        if let Err(e) = self.claim_security(address, id) {
            self.auth_key_status(address, id, ProcedureStatus::Error);
            return Err(e);
        }

        let start_sent = self
            .with_session(address, |session| {
                session.security.keypress_start_sent.contains(&id)
            })
            .unwrap_or(false);

        if start_sent {
            if let Err(e) = self
                .transport
                .notify_keypress(address, KeypressType::PasskeyEnd)
                .await
            {
                warn!("Error sending keypress end to {}: {}", address, e);
                self.auth_key_status(address, id, ProcedureStatus::Error);
                return Err(e.into());
            }
            self.with_session(address, |session| {
                session.security.keypress_start_sent.remove(&id);
            });
            self.emit(UpstreamEvent::KeypressSent {
                address: address.clone(),
                id,
                keypress: KeypressType::PasskeyEnd,
            });
        }

        match self.transport.reply_auth_key(address, key_type, key).await {
            Ok(()) => {
                self.with_session(address, |session| {
                    session.security.state = SecurityState::AwaitingAuthStatus;
                });
                self.pairing_status(address, id, ProcedureStatus::Pending);
                Ok(())
            }
            Err(e) => {
                warn!("Error replying auth key to {}: {}", address, e);
                self.auth_key_status(address, id, ProcedureStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Confirm or deny a numeric comparison
    pub async fn reply_numerical_comparison(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        matched: bool,
    ) -> Result<(), SessionError> {
        let key_type = if matched {
            AuthKeyType::Passkey
        } else {
            AuthKeyType::None
        };
        self.reply_auth_key(address, id, key_type, None).await
    }

    /// Hand LESC OOB data to the transport. Empty peer values are sent as none.
    pub async fn reply_lesc_oob(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        peer_oob: &PeerOobInput,
        own_oob: Option<LescOobData>,
    ) -> Result<(), SessionError> {
        if let Err(e) = self.claim_security(address, id) {
            self.auth_key_status(address, id, ProcedureStatus::Error);
            return Err(e);
        }

        let address_type = self
            .with_session(address, |session| session.address_type)
            .flatten();
        let peer = match peer_oob.to_oob_data(address, address_type) {
            Ok(peer) => peer,
            Err(e) => {
                self.auth_key_status(address, id, ProcedureStatus::Error);
                return Err(SessionError::InvalidArgument(format!(
                    "peer OOB data is not hex: {}",
                    e
                )));
            }
        };

        debug!(
            "setLescOobData for {}, own: {:?}, peer: {:?}",
            address, own_oob, peer
        );
        match self.transport.set_lesc_oob_data(address, own_oob, peer).await {
            Ok(()) => {
                self.with_session(address, |session| {
                    session.security.state = SecurityState::AwaitingAuthStatus;
                });
                self.pairing_status(address, id, ProcedureStatus::Pending);
                Ok(())
            }
            Err(e) => {
                warn!("Error setting LESC OOB data for {}: {}", address, e);
                self.auth_key_status(address, id, ProcedureStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Send a keypress notification, opening the sequence with a start first
    pub async fn send_keypress(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        keypress: KeypressType,
    ) -> Result<(), SessionError> {
        if let Err(e) = self.claim_security(address, id) {
            self.auth_key_status(address, id, ProcedureStatus::Error);
            return Err(e);
        }

        let start_sent = self
            .with_session(address, |session| {
                session.security.keypress_start_sent.contains(&id)
            })
            .unwrap_or(false);

        if !start_sent {
            self.notify_keypress(address, id, KeypressType::PasskeyStart)
                .await?;
            self.with_session(address, |session| {
                session.security.keypress_start_sent.insert(id);
            });
            if keypress == KeypressType::PasskeyStart {
                return Ok(());
            }
        }

        self.notify_keypress(address, id, keypress).await?;
        if keypress == KeypressType::PasskeyEnd {
            self.with_session(address, |session| {
                session.security.keypress_start_sent.remove(&id);
            });
        }
        Ok(())
    }

    async fn notify_keypress(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        keypress: KeypressType,
    ) -> Result<(), SessionError> {
        match self.transport.notify_keypress(address, keypress).await {
            Ok(()) => {
                self.emit(UpstreamEvent::KeypressSent {
                    address: address.clone(),
                    id,
                    keypress,
                });
                Ok(())
            }
            Err(e) => {
                warn!("Error sending keypress {} to {}: {}", keypress, address, e);
                self.auth_key_status(address, id, ProcedureStatus::Error);
                Err(e.into())
            }
        }
    }
}
