// Integration test: security procedures driven through the orchestrator
//
// Covers role-based pairing rejection, secret-info replies with and without a
// bond, the bonding rule on auth status, LESC side effects and keypress
// sequencing, all against the loopback transport.

use blelink_core::transport::ble::{
    AuthKeyType, AuthRequirements, AuthStatus, ConnectionSecurity, DeviceAddress, DeviceInfo,
    EncInfo, EncKey, IdInfo,
    IdKey, KeyMaterial, KeySet, KeypressType, MasterId, PeerOobInput, PublicKey, Role,
    SecurityParams, PAIRING_NOT_SUPPORTED,
};
use blelink_core::{
    BondRecord, BondStore, CorrelationId, InMemoryBondStore, LoopbackTransport, Orchestrator,
    OrchestratorConfig, ProcedureKind, ProcedureStatus, SecurityState, SessionError,
    TransportCommand, TransportEvent, UpstreamEvent,
};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Harness {
    orchestrator: Orchestrator,
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
    transport: Arc<LoopbackTransport>,
    bonds: InMemoryBondStore,
}

impl Harness {
    fn new(config: OrchestratorConfig) -> Self {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init()
            .ok();

        let transport = Arc::new(LoopbackTransport::new());
        let bonds = InMemoryBondStore::new();
        let (orchestrator, events) =
            Orchestrator::new(transport.clone(), Arc::new(bonds.clone()), config);
        Self {
            orchestrator,
            events,
            transport,
            bonds,
        }
    }

    /// Bring up a link to a peer in the given role and clear the logs
    async fn connect(&mut self, role: Role) -> DeviceAddress {
        let address = DeviceAddress::new("C0:FF:EE:00:00:01");
        self.orchestrator
            .dispatch(TransportEvent::DeviceConnected {
                device: DeviceInfo::new(address.clone()).with_role(role),
            })
            .await;
        self.transport.take_commands();
        self.drain();
        address
    }

    /// Known device whose role was never reported
    async fn discover(&mut self) -> DeviceAddress {
        let address = DeviceAddress::new("C0:FF:EE:00:00:02");
        self.orchestrator
            .dispatch(TransportEvent::DeviceDiscovered {
                device: DeviceInfo::new(address.clone()),
            })
            .await;
        self.drain();
        address
    }

    fn drain(&mut self) -> Vec<UpstreamEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn state(&self, address: &DeviceAddress) -> SecurityState {
        self.orchestrator
            .session(address)
            .map(|s| s.security.state)
            .unwrap_or(SecurityState::Idle)
    }
}

fn complete_keyset(lesc: bool) -> KeySet {
    KeySet {
        keys_own: KeyMaterial {
            enc_key: Some(EncKey {
                enc_info: EncInfo {
                    ltk: vec![0xA1; 16],
                    lesc,
                    auth: true,
                    ltk_len: 16,
                },
                master_id: MasterId {
                    ediv: 0x1234,
                    rand: vec![0x01; 8],
                },
            }),
            id_key: Some(IdKey {
                id_info: IdInfo {
                    irk: vec![0xB2; 16],
                },
            }),
            sign_key: None,
            pk: Some(PublicKey(vec![0x11; 64])),
        },
        keys_peer: KeyMaterial {
            enc_key: Some(EncKey {
                enc_info: EncInfo {
                    ltk: vec![0xC3; 16],
                    lesc,
                    auth: true,
                    ltk_len: 16,
                },
                master_id: MasterId {
                    ediv: 0x5678,
                    rand: vec![0x02; 8],
                },
            }),
            ..KeyMaterial::default()
        },
    }
}

fn security_request_id(events: &[UpstreamEvent]) -> CorrelationId {
    events
        .iter()
        .find_map(|event| match event {
            UpstreamEvent::SecurityRequest { id, .. } => Some(*id),
            _ => None,
        })
        .expect("security request surfaced")
}

// ============================================================================
// PAIRING REJECTION BY ROLE
// ============================================================================

#[tokio::test]
async fn test_reject_pairing_peer_peripheral_authenticates_with_none() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::SecurityRequest {
            address: address.clone(),
            requirements: AuthRequirements {
                bond: true,
                ..AuthRequirements::default()
            },
        })
        .await;
    let id = security_request_id(&h.drain());
    assert!(h.transport.commands().is_empty());

    h.orchestrator.reject_pairing(&address, id).await.unwrap();

    assert_eq!(
        h.transport.commands(),
        vec![TransportCommand::Authenticate {
            address: address.clone(),
            params: None,
        }]
    );
    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::PairingStatus {
            address: address.clone(),
            id,
            status: ProcedureStatus::Rejected,
        }]
    );
    let session = h.orchestrator.session(&address).unwrap();
    assert_eq!(
        session.slots.get(ProcedureKind::Security).map(|s| s.status),
        Some(ProcedureStatus::Rejected)
    );
}

#[tokio::test]
async fn test_reject_pairing_peer_central_replies_not_supported() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Central).await;

    h.orchestrator
        .dispatch(TransportEvent::SecParamsRequest {
            address: address.clone(),
            peer_params: SecurityParams {
                bond: true,
                mitm: true,
                ..SecurityParams::default()
            },
        })
        .await;
    let events = h.drain();
    let id = security_request_id(&events);
    assert!(matches!(
        events.as_slice(),
        [UpstreamEvent::SecurityRequest {
            requirements: AuthRequirements {
                bond: true,
                mitm: true,
                lesc: false,
                keypress: false,
            },
            ..
        }]
    ));

    h.orchestrator.reject_pairing(&address, id).await.unwrap();

    assert_eq!(
        h.transport.commands(),
        vec![TransportCommand::ReplySecParams {
            address: address.clone(),
            status: PAIRING_NOT_SUPPORTED,
            own_params: None,
            keyset: None,
        }]
    );
}

#[tokio::test]
async fn test_reject_pairing_unknown_role_issues_nothing() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.discover().await;
    let id = h.orchestrator.next_correlation_id();

    let result = h.orchestrator.reject_pairing(&address, id).await;

    assert!(matches!(result, Err(SessionError::UnknownRole(_))));
    assert!(h.transport.commands().is_empty());
    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::PairingStatus {
            address,
            id,
            status: ProcedureStatus::Error,
        }]
    );
}

// ============================================================================
// SECRET INFO
// ============================================================================

#[tokio::test]
async fn test_sec_info_without_bond_replies_null_keys() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = h.connect(Role::Central).await;

    h.orchestrator
        .dispatch(TransportEvent::SecInfoRequest {
            address: address.clone(),
        })
        .await;

    assert_eq!(
        h.transport.commands(),
        vec![TransportCommand::SecInfoReply {
            address: address.clone(),
            enc_info: None,
            id_info: None,
            sign_info: None,
        }]
    );
    assert!(h.drain().is_empty());
    assert_eq!(h.state(&address), SecurityState::AwaitingAuthStatus);
}

#[tokio::test]
async fn test_sec_info_with_bond_replies_own_keys() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = h.connect(Role::Central).await;
    let keyset = complete_keyset(false);
    h.bonds
        .insert(&address, BondRecord::from(keyset.clone()))
        .unwrap();

    h.orchestrator
        .dispatch(TransportEvent::SecInfoRequest {
            address: address.clone(),
        })
        .await;

    let own = keyset.keys_own;
    assert_eq!(
        h.transport.commands(),
        vec![TransportCommand::SecInfoReply {
            address,
            enc_info: own.enc_key.map(|k| k.enc_info),
            id_info: own.id_key.map(|k| k.id_info),
            sign_info: None,
        }]
    );
}

// ============================================================================
// AUTH STATUS AND BONDING
// ============================================================================

#[tokio::test]
async fn test_auth_success_without_bonding_skips_store() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::AuthStatus {
            address: address.clone(),
            status: AuthStatus {
                auth_status: 0,
                auth_status_name: "BLE_GAP_SEC_STATUS_SUCCESS".to_string(),
                bonded: false,
                keyset: Some(complete_keyset(true)),
            },
        })
        .await;

    assert!(h.bonds.is_empty());
    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::AuthSucceeded {
            address: address.clone(),
            id: None,
        }]
    );
    assert_eq!(h.state(&address), SecurityState::Authenticated);
}

#[tokio::test]
async fn test_auth_success_with_bonding_writes_store() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::AuthStatus {
            address: address.clone(),
            status: AuthStatus {
                auth_status: 0,
                auth_status_name: "BLE_GAP_SEC_STATUS_SUCCESS".to_string(),
                bonded: true,
                keyset: Some(complete_keyset(true)),
            },
        })
        .await;

    assert!(h.bonds.contains(&address));
    let names: Vec<_> = h.drain().iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["auth_succeeded", "bond_info_added"]);

    let session = h.orchestrator.session(&address).unwrap();
    assert!(session.security.bonded);
    assert_eq!(session.security.state, SecurityState::Bonded);
    assert!(session.security.keyset.is_none());
}

#[tokio::test]
async fn test_auth_failure_surfaces_error() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::AuthStatus {
            address: address.clone(),
            status: AuthStatus {
                auth_status: 0x83,
                auth_status_name: "BLE_GAP_SEC_STATUS_AUTH_REQ".to_string(),
                bonded: false,
                keyset: None,
            },
        })
        .await;

    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::AuthError {
            address: address.clone(),
            id: None,
            reason: "BLE_GAP_SEC_STATUS_AUTH_REQ".to_string(),
        }]
    );
    assert_eq!(h.state(&address), SecurityState::Failed);
    assert!(h.bonds.is_empty());
}

#[tokio::test]
async fn test_bonded_peripheral_reconnect_encrypts() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = DeviceAddress::new("C0:FF:EE:00:00:01");
    let keyset = complete_keyset(true);
    h.bonds
        .insert(&address, BondRecord::from(keyset.clone()))
        .unwrap();

    h.orchestrator
        .dispatch(TransportEvent::DeviceConnected {
            device: DeviceInfo::new(address.clone()).with_role(Role::Peripheral),
        })
        .await;

    // LESC bond: own copy of the LTK
    let own = keyset.keys_own.enc_key.unwrap();
    assert_eq!(
        h.transport.commands(),
        vec![TransportCommand::Encrypt {
            address,
            master_id: own.master_id,
            enc_info: own.enc_info,
        }]
    );
    assert_eq!(h.drain()[0].name(), "device_connected");
}

// ============================================================================
// REQUEST HANDLING
// ============================================================================

#[tokio::test]
async fn test_security_request_auto_accepts_with_defaults() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::SecurityRequest {
            address: address.clone(),
            requirements: AuthRequirements::default(),
        })
        .await;

    assert_eq!(
        h.transport.commands(),
        vec![TransportCommand::Authenticate {
            address: address.clone(),
            params: Some(SecurityParams::default()),
        }]
    );
    assert!(h.drain().is_empty());
    assert_eq!(h.state(&address), SecurityState::AwaitingPeerParams);
}

#[tokio::test]
async fn test_security_request_ignored_without_default_params() {
    let mut h = Harness::new(OrchestratorConfig {
        security_params: None,
        ..OrchestratorConfig::default()
    });
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::SecurityRequest {
            address: address.clone(),
            requirements: AuthRequirements::default(),
        })
        .await;

    assert!(h.transport.commands().is_empty());
    assert!(h.drain().is_empty());
    let session = h.orchestrator.session(&address).unwrap();
    assert_eq!(session.security.state, SecurityState::Idle);
    assert!(session.slots.get(ProcedureKind::Security).is_none());
}

#[tokio::test]
async fn test_manual_accept_pairing_with_peer_peripheral() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    h.orchestrator
        .dispatch(TransportEvent::SecurityRequest {
            address: address.clone(),
            requirements: AuthRequirements::default(),
        })
        .await;
    let id = security_request_id(&h.drain());

    let params = SecurityParams {
        bond: true,
        lesc: true,
        ..SecurityParams::default()
    };
    h.orchestrator
        .accept_pairing(&address, id, params)
        .await
        .unwrap();

    assert_eq!(
        h.transport.command_names(),
        vec!["computePublicKey", "authenticate"]
    );
    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::PairingStatus {
            address: address.clone(),
            id,
            status: ProcedureStatus::Pending,
        }]
    );
    let session = h.orchestrator.session(&address).unwrap();
    assert_eq!(session.security.own_params, Some(params));
    assert!(session.security.keyset.is_some());
}

#[tokio::test]
async fn test_peer_central_params_auto_accepted() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = h.connect(Role::Central).await;

    h.orchestrator
        .dispatch(TransportEvent::SecParamsRequest {
            address: address.clone(),
            peer_params: SecurityParams::default(),
        })
        .await;

    let commands = h.transport.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0], TransportCommand::ComputePublicKey);
    match &commands[1] {
        TransportCommand::ReplySecParams {
            status,
            own_params,
            keyset,
            ..
        } => {
            assert_eq!(*status, 0);
            assert_eq!(*own_params, Some(SecurityParams::default()));
            assert_eq!(
                keyset.as_ref().and_then(|k| k.keys_own.pk.clone()),
                Some(PublicKey(vec![0x11; 64]))
            );
        }
        other => panic!("unexpected command {:?}", other),
    }
    assert!(matches!(
        h.drain().as_slice(),
        [UpstreamEvent::PairingStatus {
            status: ProcedureStatus::Pending,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_peer_peripheral_params_reply_without_own_params() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::SecParamsRequest {
            address: address.clone(),
            peer_params: SecurityParams::default(),
        })
        .await;

    assert_eq!(
        h.transport.command_names(),
        vec!["computePublicKey", "replySecParams"]
    );
    assert!(matches!(
        h.transport.commands().last(),
        Some(TransportCommand::ReplySecParams {
            status: 0,
            own_params: None,
            keyset: Some(_),
            ..
        })
    ));
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_own_peripheral_pairing_replies_without_confirmation() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Central).await;
    let id = h.orchestrator.next_correlation_id();
    let params = SecurityParams {
        bond: true,
        mitm: true,
        ..SecurityParams::default()
    };

    h.orchestrator.pair(&address, id, params).await.unwrap();
    assert!(
        h.orchestrator
            .session(&address)
            .unwrap()
            .security
            .own_periph_initiated_pending
    );
    h.transport.take_commands();
    h.drain();

    h.orchestrator
        .dispatch(TransportEvent::SecParamsRequest {
            address: address.clone(),
            peer_params: SecurityParams::default(),
        })
        .await;

    assert!(matches!(
        h.transport.commands().last(),
        Some(TransportCommand::ReplySecParams {
            status: 0,
            own_params: Some(p),
            ..
        }) if *p == params
    ));
    // nothing surfaced for confirmation
    assert!(h.drain().is_empty());
    let session = h.orchestrator.session(&address).unwrap();
    assert!(!session.security.own_periph_initiated_pending);
    assert_eq!(
        session.slots.outstanding(ProcedureKind::Security).map(|s| s.id),
        Some(id)
    );
}

#[tokio::test]
async fn test_second_security_procedure_is_busy() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    let first = h.orchestrator.next_correlation_id();
    let second = h.orchestrator.next_correlation_id();

    h.orchestrator
        .pair(&address, first, SecurityParams::default())
        .await
        .unwrap();
    let result = h
        .orchestrator
        .pair(&address, second, SecurityParams::default())
        .await;

    assert!(matches!(
        result,
        Err(SessionError::ProcedureBusy { outstanding, .. }) if outstanding == first
    ));
    assert_eq!(h.transport.count("authenticate"), 1);
    assert_eq!(
        h.drain().last(),
        Some(&UpstreamEvent::PairingStatus {
            address,
            id: second,
            status: ProcedureStatus::Error,
        })
    );
}

#[tokio::test]
async fn test_failed_pair_command_reports_error() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    h.transport.fail_on("authenticate");
    let id = h.orchestrator.next_correlation_id();

    let result = h
        .orchestrator
        .pair(&address, id, SecurityParams::default())
        .await;

    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::PairingStatus {
            address: address.clone(),
            id,
            status: ProcedureStatus::Error,
        }]
    );
    // the link is left alone
    assert!(h.orchestrator.session(&address).unwrap().is_connected());
}

// ============================================================================
// LESC AND KEYPRESS
// ============================================================================

#[tokio::test]
async fn test_lesc_dhkey_side_effects_are_independent() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    h.transport.fail_on("replyLescDhkey");

    h.orchestrator
        .dispatch(TransportEvent::LescDhkeyRequest {
            address: address.clone(),
            peer_public_key: PublicKey(vec![0x55; 64]),
            oob_required: true,
        })
        .await;

    let names = h.transport.command_names();
    for expected in [
        "computeSharedSecret",
        "replyLescDhkey",
        "computePublicKey",
        "getLescOobData",
    ] {
        assert!(names.contains(&expected), "missing {}", expected);
    }

    let events = h.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, UpstreamEvent::AuthError { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        UpstreamEvent::LescOobRequest { own_oob, .. } if own_oob.r == vec![0x33; 16]
    )));
}

#[tokio::test]
async fn test_lesc_without_oob_does_not_surface_own_data() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::LescDhkeyRequest {
            address: address.clone(),
            peer_public_key: PublicKey(vec![0x55; 64]),
            oob_required: false,
        })
        .await;

    assert_eq!(h.transport.count("replyLescDhkey"), 1);
    assert!(h.drain().is_empty());
    assert_eq!(h.state(&address), SecurityState::AwaitingAuthStatus);
}

#[tokio::test]
async fn test_reply_lesc_oob_with_empty_peer_data() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    let id = h.orchestrator.next_correlation_id();

    h.orchestrator
        .reply_lesc_oob(&address, id, &PeerOobInput::default(), None)
        .await
        .unwrap();

    assert_eq!(
        h.transport.commands(),
        vec![TransportCommand::SetLescOobData {
            address: address.clone(),
            own_oob: None,
            peer_oob: None,
        }]
    );
    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::PairingStatus {
            address,
            id,
            status: ProcedureStatus::Pending,
        }]
    );
}

#[tokio::test]
async fn test_reply_lesc_oob_rejects_bad_hex() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    let id = h.orchestrator.next_correlation_id();
    let input = PeerOobInput {
        random: "zz".to_string(),
        confirm: "00".to_string(),
    };

    let result = h.orchestrator.reply_lesc_oob(&address, id, &input, None).await;

    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
    assert!(h.transport.commands().is_empty());
    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::AuthKeyStatus {
            address,
            id,
            status: ProcedureStatus::Error,
        }]
    );
}

#[tokio::test]
async fn test_keypress_sequence_closed_before_auth_key_reply() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::AuthKeyRequest {
            address: address.clone(),
            key_type: AuthKeyType::Passkey,
        })
        .await;
    let id = match h.drain().as_slice() {
        [UpstreamEvent::AuthKeyRequest {
            id, send_keypress, ..
        }] => {
            // no params stored on either side
            assert!(!send_keypress);
            *id
        }
        other => panic!("unexpected events {:?}", other),
    };

    h.orchestrator
        .send_keypress(&address, id, KeypressType::PasskeyDigitIn)
        .await
        .unwrap();
    h.orchestrator
        .send_keypress(&address, id, KeypressType::PasskeyDigitIn)
        .await
        .unwrap();
    h.orchestrator
        .reply_auth_key(&address, id, AuthKeyType::Passkey, Some("123456".to_string()))
        .await
        .unwrap();

    let keypresses: Vec<_> = h
        .transport
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            TransportCommand::NotifyKeypress { keypress, .. } => Some(keypress),
            _ => None,
        })
        .collect();
    assert_eq!(
        keypresses,
        vec![
            KeypressType::PasskeyStart,
            KeypressType::PasskeyDigitIn,
            KeypressType::PasskeyDigitIn,
            KeypressType::PasskeyEnd,
        ]
    );
    assert_eq!(h.transport.command_names().last(), Some(&"replyAuthKey"));

    let events = h.drain();
    assert_eq!(
        events.last(),
        Some(&UpstreamEvent::PairingStatus {
            address: address.clone(),
            id,
            status: ProcedureStatus::Pending,
        })
    );
    assert!(events.contains(&UpstreamEvent::KeypressSent {
        address,
        id,
        keypress: KeypressType::PasskeyEnd,
    }));
}

#[tokio::test]
async fn test_numerical_comparison_mismatch_replies_none() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    h.orchestrator
        .dispatch(TransportEvent::PasskeyDisplay {
            address: address.clone(),
            passkey: "004711".to_string(),
            match_request: true,
        })
        .await;
    let id = match h.drain().as_slice() {
        [UpstreamEvent::PasskeyDisplay { id, passkey, .. }] => {
            assert_eq!(passkey, "004711");
            *id
        }
        other => panic!("unexpected events {:?}", other),
    };

    h.orchestrator
        .reply_numerical_comparison(&address, id, false)
        .await
        .unwrap();

    assert_eq!(
        h.transport.commands(),
        vec![TransportCommand::ReplyAuthKey {
            address,
            key_type: AuthKeyType::None,
            key: None,
        }]
    );
}

#[tokio::test]
async fn test_disconnect_returns_security_to_idle() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    let id = h.orchestrator.next_correlation_id();
    h.orchestrator
        .pair(&address, id, SecurityParams::default())
        .await
        .unwrap();

    h.orchestrator
        .dispatch(TransportEvent::DeviceDisconnected {
            address: address.clone(),
            reason: Some(0x13),
        })
        .await;

    let session = h.orchestrator.session(&address).unwrap();
    assert_eq!(session.security.state, SecurityState::Idle);
    assert!(!session.slots.is_outstanding(ProcedureKind::Security));
    assert!(session.security.keyset.is_none());
}

// ============================================================================
// KEYPRESS, LINK SECURITY AND TIMEOUTS
// ============================================================================

#[tokio::test]
async fn test_keypress_enabled_when_both_sides_request_it() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;
    let with_keypress = SecurityParams {
        keypress: true,
        mitm: true,
        ..SecurityParams::default()
    };

    let id = h.orchestrator.next_correlation_id();
    h.orchestrator
        .pair(&address, id, with_keypress)
        .await
        .unwrap();
    h.orchestrator
        .dispatch(TransportEvent::SecParamsRequest {
            address: address.clone(),
            peer_params: with_keypress,
        })
        .await;
    h.drain();

    h.orchestrator
        .dispatch(TransportEvent::AuthKeyRequest {
            address: address.clone(),
            key_type: AuthKeyType::Passkey,
        })
        .await;
    h.orchestrator
        .dispatch(TransportEvent::PasskeyDisplay {
            address: address.clone(),
            passkey: "004711".to_string(),
            match_request: false,
        })
        .await;

    match h.drain().as_slice() {
        [UpstreamEvent::AuthKeyRequest {
            id: request_id,
            send_keypress,
            ..
        }, UpstreamEvent::PasskeyDisplay {
            id: display_id,
            receive_keypress,
            ..
        }] => {
            assert_eq!(*request_id, id);
            assert_eq!(*display_id, id);
            assert!(*send_keypress);
            assert!(*receive_keypress);
        }
        other => panic!("unexpected events {:?}", other),
    }
}

#[tokio::test]
async fn test_peer_keypress_surfaced() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Central).await;

    h.orchestrator
        .dispatch(TransportEvent::KeyPressed {
            address: address.clone(),
            keypress: KeypressType::PasskeyDigitIn,
        })
        .await;

    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::KeypressReceived {
            address,
            keypress: KeypressType::PasskeyDigitIn,
        }]
    );
    assert!(h.transport.commands().is_empty());
}

#[tokio::test]
async fn test_security_change_stored_on_session() {
    let mut h = Harness::new(OrchestratorConfig::default());
    let address = h.connect(Role::Peripheral).await;
    let security = ConnectionSecurity {
        sec_mode: 1,
        sec_level: 4,
    };

    h.orchestrator
        .dispatch(TransportEvent::SecurityChanged {
            address: address.clone(),
            security,
        })
        .await;

    let session = h.orchestrator.session(&address).unwrap();
    assert_eq!(session.security.connection_security, Some(security));
    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::SecurityChanged { address, security }]
    );
}

#[tokio::test]
async fn test_security_request_timeout_fails_outstanding_procedure() {
    let mut h = Harness::new(OrchestratorConfig::manual());
    let address = h.connect(Role::Peripheral).await;

    h.orchestrator
        .dispatch(TransportEvent::SecurityRequest {
            address: address.clone(),
            requirements: AuthRequirements::default(),
        })
        .await;
    let id = security_request_id(&h.drain());

    h.orchestrator
        .dispatch(TransportEvent::SecurityRequestTimedOut {
            address: address.clone(),
        })
        .await;

    assert_eq!(
        h.drain(),
        vec![UpstreamEvent::SecurityRequestTimedOut {
            address: address.clone(),
            id: Some(id),
        }]
    );
    let session = h.orchestrator.session(&address).unwrap();
    assert_eq!(session.security.state, SecurityState::Failed);
    assert_eq!(
        session
            .slots
            .get(ProcedureKind::Security)
            .map(|s| (s.id, s.status)),
        Some((id, ProcedureStatus::Error))
    );
    assert!(!session.slots.is_outstanding(ProcedureKind::Security));
}
