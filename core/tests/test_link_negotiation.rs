// Integration test: connection parameter, PHY, MTU and data length negotiation
//
// Peer requests are answered automatically or surfaced depending on the
// configuration; local updates share one slot per kind with the peer.

use blelink_core::transport::ble::{
    ConnectionParams, DataLengthParams, DeviceAddress, DeviceInfo, Phy, PhyParams, Role,
};
use blelink_core::{
    CorrelationId, InMemoryBondStore, LoopbackTransport, Orchestrator, OrchestratorConfig,
    ProcedureKind, ProcedureStatus, SessionError, TransportCommand, TransportEvent, UpstreamEvent,
};
use std::sync::Arc;
use tokio::sync::mpsc;

fn setup(
    config: OrchestratorConfig,
) -> (
    Orchestrator,
    mpsc::UnboundedReceiver<UpstreamEvent>,
    Arc<LoopbackTransport>,
) {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init()
        .ok();

    let transport = Arc::new(LoopbackTransport::new());
    let (orchestrator, events) = Orchestrator::new(
        transport.clone(),
        Arc::new(InMemoryBondStore::new()),
        config,
    );
    (orchestrator, events, transport)
}

async fn connect(
    orchestrator: &Orchestrator,
    events: &mut mpsc::UnboundedReceiver<UpstreamEvent>,
    role: Role,
) -> DeviceAddress {
    let address = DeviceAddress::new("D1:D2:D3:D4:D5:D6");
    orchestrator
        .dispatch(TransportEvent::DeviceConnected {
            device: DeviceInfo::new(address.clone()).with_role(role),
        })
        .await;
    drain(events);
    address
}

fn drain(events: &mut mpsc::UnboundedReceiver<UpstreamEvent>) -> Vec<UpstreamEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn two_mbps() -> PhyParams {
    PhyParams {
        tx_phys: Phy::TwoMbps,
        rx_phys: Phy::TwoMbps,
    }
}

fn requested_params() -> ConnectionParams {
    ConnectionParams {
        min_conn_interval_ms: 7.5,
        max_conn_interval_ms: 30.0,
        slave_latency: 0,
        conn_sup_timeout_ms: 4000,
    }
}

// ============================================================================
// CONNECTION PARAMETERS
// ============================================================================

#[tokio::test]
async fn test_auto_accept_pins_interval_to_requested_min() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::default());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;

    orchestrator
        .dispatch(TransportEvent::ConnParamUpdateRequest {
            address: address.clone(),
            params: requested_params(),
        })
        .await;

    match transport.commands().as_slice() {
        [TransportCommand::UpdateConnectionParameters { params, .. }] => {
            assert_eq!(params.min_conn_interval_ms, 7.5);
            assert_eq!(params.max_conn_interval_ms, 7.5);
        }
        other => panic!("unexpected commands {:?}", other),
    }
    assert!(matches!(
        drain(&mut events).as_slice(),
        [UpstreamEvent::ConnectionParamsStatus {
            id: Some(_),
            status: ProcedureStatus::Success,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_manual_conn_params_request_is_surfaced_then_applied() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;

    orchestrator
        .dispatch(TransportEvent::ConnParamUpdateRequest {
            address: address.clone(),
            params: requested_params(),
        })
        .await;
    assert!(transport.commands().is_empty());
    let id = match drain(&mut events).as_slice() {
        [UpstreamEvent::ConnectionParamsRequest { id, params, .. }] => {
            assert_eq!(*params, requested_params());
            *id
        }
        other => panic!("unexpected events {:?}", other),
    };

    orchestrator
        .update_connection_params(&address, id, requested_params())
        .await
        .unwrap();

    assert_eq!(transport.count("updateConnectionParameters"), 1);
    assert_eq!(
        drain(&mut events),
        vec![UpstreamEvent::ConnectionParamsStatus {
            address,
            id: Some(id),
            status: ProcedureStatus::Success,
        }]
    );
}

#[tokio::test]
async fn test_reject_connection_params() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;
    orchestrator
        .dispatch(TransportEvent::ConnParamUpdateRequest {
            address: address.clone(),
            params: requested_params(),
        })
        .await;
    let id = match drain(&mut events).as_slice() {
        [UpstreamEvent::ConnectionParamsRequest { id, .. }] => *id,
        other => panic!("unexpected events {:?}", other),
    };

    orchestrator
        .reject_connection_params(&address, id)
        .await
        .unwrap();

    assert_eq!(transport.command_names(), vec!["rejectConnParams"]);
    assert_eq!(
        drain(&mut events),
        vec![UpstreamEvent::ConnectionParamsStatus {
            address: address.clone(),
            id: Some(id),
            status: ProcedureStatus::Rejected,
        }]
    );
    let session = orchestrator.session(&address).unwrap();
    assert_eq!(
        session.slots.get(ProcedureKind::ConnParams).map(|s| s.status),
        Some(ProcedureStatus::Rejected)
    );
}

#[tokio::test]
async fn test_failed_reject_reports_error_not_rejected() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;
    transport.fail_on("rejectConnParams");
    let id = orchestrator.next_correlation_id();

    let result = orchestrator.reject_connection_params(&address, id).await;

    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(
        drain(&mut events),
        vec![UpstreamEvent::ConnectionParamsStatus {
            address,
            id: Some(id),
            status: ProcedureStatus::Error,
        }]
    );
}

#[tokio::test]
async fn test_central_param_change_surfaced_when_manual() {
    let (orchestrator, mut events, _) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Central).await;
    let updated = ConnectionParams::fixed(15.0, 0, 2000);

    orchestrator
        .dispatch(TransportEvent::ConnParamUpdate {
            address: address.clone(),
            params: updated,
        })
        .await;

    let names: Vec<_> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec![
            "connection_params_request",
            "connection_params_status",
            "connection_params_updated",
        ]
    );
    assert_eq!(
        orchestrator.session(&address).unwrap().link.conn_params,
        Some(updated)
    );
}

#[tokio::test]
async fn test_peripheral_param_change_only_reported() {
    let (orchestrator, mut events, _) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;
    let updated = ConnectionParams::fixed(15.0, 0, 2000);

    orchestrator
        .dispatch(TransportEvent::ConnParamUpdate {
            address: address.clone(),
            params: updated,
        })
        .await;

    assert_eq!(
        drain(&mut events),
        vec![
            UpstreamEvent::ConnectionParamsStatus {
                address: address.clone(),
                id: None,
                status: ProcedureStatus::Success,
            },
            UpstreamEvent::ConnectionParamsUpdated {
                address,
                params: updated,
            },
        ]
    );
}

// ============================================================================
// SLOT DISCIPLINE
// ============================================================================

#[tokio::test]
async fn test_local_phy_update_busy_while_peer_request_pending() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;

    orchestrator
        .dispatch(TransportEvent::PhyUpdateRequest {
            address: address.clone(),
            phys: two_mbps(),
        })
        .await;
    let peer_id = match drain(&mut events).as_slice() {
        [UpstreamEvent::PhyRequest { id, .. }] => *id,
        other => panic!("unexpected events {:?}", other),
    };

    let other_id = orchestrator.next_correlation_id();
    let result = orchestrator.update_phy(&address, other_id, two_mbps()).await;
    assert!(matches!(
        result,
        Err(SessionError::ProcedureBusy { kind: ProcedureKind::Phy, outstanding }) if outstanding == peer_id
    ));
    assert!(transport.commands().is_empty());
    assert_eq!(
        drain(&mut events),
        vec![UpstreamEvent::PhyStatus {
            address: address.clone(),
            id: Some(other_id),
            status: ProcedureStatus::Error,
        }]
    );

    // the peer's procedure is still answerable
    orchestrator
        .update_phy(&address, peer_id, two_mbps())
        .await
        .unwrap();
    assert_eq!(transport.command_names(), vec!["phyUpdate"]);
}

#[tokio::test]
async fn test_duplicate_peer_request_dropped() {
    let (orchestrator, mut events, _) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;

    for _ in 0..2 {
        orchestrator
            .dispatch(TransportEvent::AttMtuRequest {
                address: address.clone(),
                mtu: 247,
            })
            .await;
    }

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name(), "mtu_request");
}

#[tokio::test]
async fn test_different_kinds_run_together() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;
    transport.hold("phyUpdate");

    let phy_id = orchestrator.next_correlation_id();
    let mtu_id = orchestrator.next_correlation_id();
    let late_phy_id = orchestrator.next_correlation_id();

    let (phy, (mtu, late_phy)) = tokio::join!(
        orchestrator.update_phy(&address, phy_id, two_mbps()),
        async {
            // phyUpdate is parked in the transport at this point
            let mtu = orchestrator.request_mtu(&address, mtu_id, 247).await;
            let late_phy = orchestrator
                .update_phy(&address, late_phy_id, two_mbps())
                .await;
            transport.release("phyUpdate");
            (mtu, late_phy)
        }
    );

    phy.unwrap();
    assert_eq!(mtu.unwrap(), 247);
    assert!(matches!(late_phy, Err(SessionError::ProcedureBusy { .. })));
    assert_eq!(transport.count("phyUpdate"), 1);

    let session = orchestrator.session(&address).unwrap();
    assert_eq!(session.link.mtu, 247);
    assert_eq!(
        session.slots.get(ProcedureKind::Phy).map(|s| (s.id, s.status)),
        Some((phy_id, ProcedureStatus::Success))
    );

    let statuses: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            UpstreamEvent::PhyStatus { id, status, .. } => Some(("phy", id, status)),
            UpstreamEvent::MtuStatus { id, status, .. } => Some(("mtu", id, status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("mtu", Some(mtu_id), ProcedureStatus::Success),
            ("phy", Some(late_phy_id), ProcedureStatus::Error),
            ("phy", Some(phy_id), ProcedureStatus::Success),
        ]
    );
}

#[tokio::test]
async fn test_command_failure_fails_slot() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::default());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;
    transport.fail_on("phyUpdate");

    orchestrator
        .dispatch(TransportEvent::PhyUpdateRequest {
            address: address.clone(),
            phys: two_mbps(),
        })
        .await;

    let session = orchestrator.session(&address).unwrap();
    let slot = session.slots.get(ProcedureKind::Phy).copied().unwrap();
    assert_eq!(slot.status, ProcedureStatus::Error);
    assert_eq!(
        drain(&mut events),
        vec![UpstreamEvent::PhyStatus {
            address,
            id: Some(slot.id),
            status: ProcedureStatus::Error,
        }]
    );
}

// ============================================================================
// PHY, MTU, DATA LENGTH
// ============================================================================

#[tokio::test]
async fn test_auto_phy_applies_requested_phys() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::default());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;
    let requested = PhyParams {
        tx_phys: Phy::TwoMbps,
        rx_phys: Phy::Coded,
    };

    orchestrator
        .dispatch(TransportEvent::PhyUpdateRequest {
            address: address.clone(),
            phys: requested,
        })
        .await;
    orchestrator
        .dispatch(TransportEvent::PhyUpdated {
            address: address.clone(),
            phys: requested,
        })
        .await;

    assert_eq!(
        transport.commands(),
        vec![TransportCommand::PhyUpdate {
            address: address.clone(),
            phys: requested,
        }]
    );
    assert_eq!(
        drain(&mut events).last(),
        Some(&UpstreamEvent::PhyUpdated {
            address: address.clone(),
            phys: requested,
        })
    );
    assert_eq!(orchestrator.session(&address).unwrap().link.phys, requested);
}

#[tokio::test]
async fn test_auto_mtu_reply_reports_new_mtu() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::default());
    let address = connect(&orchestrator, &mut events, Role::Central).await;

    orchestrator
        .dispatch(TransportEvent::AttMtuRequest {
            address: address.clone(),
            mtu: 185,
        })
        .await;

    assert_eq!(
        transport.commands(),
        vec![TransportCommand::AttMtuReply {
            address: address.clone(),
            mtu: 185,
        }]
    );
    let events = drain(&mut events);
    assert!(matches!(
        events.as_slice(),
        [
            UpstreamEvent::MtuStatus {
                status: ProcedureStatus::Success,
                id: Some(_),
                ..
            },
            UpstreamEvent::MtuUpdated { mtu: 185, .. },
        ]
    ));
    assert_eq!(orchestrator.session(&address).unwrap().link.mtu, 185);
}

#[tokio::test]
async fn test_manual_mtu_reply() {
    let (orchestrator, mut events, _) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Central).await;
    orchestrator
        .dispatch(TransportEvent::AttMtuRequest {
            address: address.clone(),
            mtu: 247,
        })
        .await;
    let id = match drain(&mut events).as_slice() {
        [UpstreamEvent::MtuRequest { id, mtu: 247, .. }] => *id,
        other => panic!("unexpected events {:?}", other),
    };

    orchestrator.reply_mtu(&address, id, 100).await.unwrap();

    assert_eq!(
        drain(&mut events),
        vec![
            UpstreamEvent::MtuStatus {
                address: address.clone(),
                id: Some(id),
                status: ProcedureStatus::Success,
            },
            UpstreamEvent::MtuUpdated {
                address: address.clone(),
                mtu: 100,
            },
        ]
    );
}

#[tokio::test]
async fn test_data_length_request_proposes_larger_side() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::default());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;

    orchestrator
        .dispatch(TransportEvent::DataLengthUpdateRequest {
            address: address.clone(),
            params: DataLengthParams {
                max_tx_octets: 150,
                max_rx_octets: 200,
            },
        })
        .await;

    assert_eq!(
        transport.commands(),
        vec![TransportCommand::DataLengthUpdate {
            address,
            params: DataLengthParams::symmetric(200),
        }]
    );
}

#[tokio::test]
async fn test_manual_data_length_request_surfaces_proposal() {
    let (orchestrator, mut events, _) = setup(OrchestratorConfig::manual());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;

    orchestrator
        .dispatch(TransportEvent::DataLengthUpdateRequest {
            address: address.clone(),
            params: DataLengthParams {
                max_tx_octets: 251,
                max_rx_octets: 27,
            },
        })
        .await;

    assert!(matches!(
        drain(&mut events).as_slice(),
        [UpstreamEvent::DataLengthRequest {
            data_length: 251,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_data_length_updated_reports_smaller_side() {
    let (orchestrator, mut events, _) = setup(OrchestratorConfig::default());
    let address = connect(&orchestrator, &mut events, Role::Peripheral).await;
    let id = CorrelationId(100);
    orchestrator
        .update_data_length(&address, id, 200)
        .await
        .unwrap();
    drain(&mut events);

    orchestrator
        .dispatch(TransportEvent::DataLengthUpdated {
            address: address.clone(),
            params: DataLengthParams {
                max_tx_octets: 150,
                max_rx_octets: 200,
            },
        })
        .await;

    assert_eq!(
        drain(&mut events),
        vec![
            UpstreamEvent::DataLengthStatus {
                address: address.clone(),
                id: None,
                status: ProcedureStatus::Success,
            },
            UpstreamEvent::DataLengthUpdated {
                address: address.clone(),
                data_length: 150,
            },
        ]
    );
    assert_eq!(orchestrator.session(&address).unwrap().link.data_length, 150);
}

#[tokio::test]
async fn test_link_update_for_unknown_device_is_rejected() {
    let (orchestrator, mut events, transport) = setup(OrchestratorConfig::default());
    let address = DeviceAddress::new("00:00:00:00:00:00");
    let id = orchestrator.next_correlation_id();

    let result = orchestrator.request_mtu(&address, id, 247).await;

    assert!(matches!(result, Err(SessionError::UnknownDevice(_))));
    assert!(transport.commands().is_empty());
    assert_eq!(
        drain(&mut events),
        vec![UpstreamEvent::MtuStatus {
            address,
            id: Some(id),
            status: ProcedureStatus::Error,
        }]
    );
}
