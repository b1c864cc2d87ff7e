// Link parameter negotiation: connection parameters, PHY, ATT MTU, data length

use tracing::{debug, warn};

use crate::events::{CorrelationId, ProcedureStatus, UpstreamEvent};
use crate::orchestrator::Orchestrator;
use crate::session::{Initiator, ProcedureKind, SessionError};
use crate::transport::ble::{
    ConnectionParams, DataLengthParams, DeviceAddress, PhyParams, Role,
};
use crate::transport::TransportError;

// ============================================================================
// NEGOTIATION RULES
// ============================================================================

/// Parameters sent back when a peer request is auto-accepted: the interval is
/// pinned to the requested minimum.
pub fn auto_accept_connection_params(requested: &ConnectionParams) -> ConnectionParams {
    ConnectionParams {
        max_conn_interval_ms: requested.min_conn_interval_ms,
        ..*requested
    }
}

/// Data length to propose for a peer request
pub fn proposed_data_length(params: &DataLengthParams) -> u16 {
    params.max_rx_octets.max(params.max_tx_octets)
}

/// Data length in effect after an update
pub fn effective_data_length(params: &DataLengthParams) -> u16 {
    params.max_rx_octets.min(params.max_tx_octets)
}

/// Link procedure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    ConnParams,
    Phy,
    Mtu,
    DataLength,
}

impl LinkKind {
    fn procedure(self) -> ProcedureKind {
        match self {
            LinkKind::ConnParams => ProcedureKind::ConnParams,
            LinkKind::Phy => ProcedureKind::Phy,
            LinkKind::Mtu => ProcedureKind::Mtu,
            LinkKind::DataLength => ProcedureKind::DataLength,
        }
    }

    fn status_event(
        self,
        address: &DeviceAddress,
        id: Option<CorrelationId>,
        status: ProcedureStatus,
    ) -> UpstreamEvent {
        let address = address.clone();
        match self {
            LinkKind::ConnParams => UpstreamEvent::ConnectionParamsStatus {
                address,
                id,
                status,
            },
            LinkKind::Phy => UpstreamEvent::PhyStatus {
                address,
                id,
                status,
            },
            LinkKind::Mtu => UpstreamEvent::MtuStatus {
                address,
                id,
                status,
            },
            LinkKind::DataLength => UpstreamEvent::DataLengthStatus {
                address,
                id,
                status,
            },
        }
    }
}

// ============================================================================
// SLOT HANDLING
// ============================================================================

impl Orchestrator {
    /// Open a peer slot for an incoming request. None when the device is
    /// unknown or a procedure of that kind is already outstanding.
    fn begin_peer_link_request(&self, address: &DeviceAddress, kind: LinkKind) -> Option<CorrelationId> {
        let id = self.next_correlation_id();
        let claimed = self.with_session(address, |session| {
            session
                .slots
                .begin(kind.procedure(), id, Initiator::Peer)
                .map(|_| ())
        })?;

        match claimed {
            Ok(()) => Some(id),
            Err(busy) => {
                warn!(
                    "{} request from {} while {} is outstanding, dropping",
                    kind.procedure(),
                    address,
                    busy.outstanding
                );
                None
            }
        }
    }

    /// Join the peer procedure `id` or start a local one. A busy slot is
    /// reported as an error status and no command goes out.
    fn claim_link(
        &self,
        address: &DeviceAddress,
        kind: LinkKind,
        id: CorrelationId,
    ) -> Result<(), SessionError> {
        let claimed = self
            .require_session(address, |session| {
                session
                    .slots
                    .begin(kind.procedure(), id, Initiator::Local)
                    .map(|_| session.slots.mark_applying(kind.procedure(), id))
                    .map_err(|busy| SessionError::ProcedureBusy {
                        kind: kind.procedure(),
                        outstanding: busy.outstanding,
                    })
            })
            .and_then(|claimed| claimed);

        if let Err(e) = &claimed {
            warn!("Cannot start {} procedure {} on {}: {}", kind.procedure(), id, address, e);
            self.emit(kind.status_event(address, Some(id), ProcedureStatus::Error));
        }
        claimed
    }

    /// Settle procedure `id` from a command result and report it
    fn complete_link(
        &self,
        address: &DeviceAddress,
        kind: LinkKind,
        id: CorrelationId,
        result: &Result<(), TransportError>,
    ) {
        let status = match result {
            Ok(()) => ProcedureStatus::Success,
            Err(e) => {
                warn!("{} procedure {} on {} failed: {}", kind.procedure(), id, address, e);
                ProcedureStatus::Error
            }
        };

        let finished = self
            .with_session(address, |session| {
                session.slots.finish(kind.procedure(), id, status)
            })
            .unwrap_or(false);

        if finished || status == ProcedureStatus::Error {
            self.emit(kind.status_event(address, Some(id), status));
        } else {
            debug!("{} procedure {} already settled", kind.procedure(), id);
        }
    }

    /// An update landed: settle whatever is outstanding as a success
    fn link_updated(&self, address: &DeviceAddress, kind: LinkKind) -> Option<CorrelationId> {
        self.with_session(address, |session| {
            session
                .slots
                .finish_outstanding(kind.procedure(), ProcedureStatus::Success)
        })
        .flatten()
    }
}

// ============================================================================
// PEER REQUESTS AND UPDATES
// ============================================================================

impl Orchestrator {
    pub(crate) async fn on_conn_param_update_request(
        &self,
        address: &DeviceAddress,
        params: ConnectionParams,
    ) {
        let Some(id) = self.begin_peer_link_request(address, LinkKind::ConnParams) else {
            return;
        };

        if !self.config().auto_accept_link_updates {
            self.emit(UpstreamEvent::ConnectionParamsRequest {
                address: address.clone(),
                id,
                params,
            });
            return;
        }

        let accepted = auto_accept_connection_params(&params);
        debug!("Auto-accepting connection parameters for {}: {:?}", address, accepted);
        self.with_session(address, |session| {
            session.slots.mark_applying(ProcedureKind::ConnParams, id)
        });
        let result = self
            .transport
            .update_connection_parameters(address, accepted)
            .await;
        self.complete_link(address, LinkKind::ConnParams, id, &result);
    }

    pub(crate) fn on_conn_param_update(&self, address: &DeviceAddress, params: ConnectionParams) {
        let auto_accept = self.config().auto_accept_link_updates;
        let Some(role) = self.with_session(address, |session| {
            session.link.conn_params = Some(params);
            session.role
        }) else {
            return;
        };

        // A central changing parameters without asking is still surfaced
        let surfaced = if role == Some(Role::Central) && !auto_accept {
            let id = self.next_correlation_id();
            self.emit(UpstreamEvent::ConnectionParamsRequest {
                address: address.clone(),
                id,
                params,
            });
            Some(id)
        } else {
            None
        };

        let id = self.link_updated(address, LinkKind::ConnParams).or(surfaced);
        self.emit(LinkKind::ConnParams.status_event(address, id, ProcedureStatus::Success));
        self.emit(UpstreamEvent::ConnectionParamsUpdated {
            address: address.clone(),
            params,
        });
    }

    pub(crate) async fn on_phy_update_request(&self, address: &DeviceAddress, phys: PhyParams) {
        let Some(id) = self.begin_peer_link_request(address, LinkKind::Phy) else {
            return;
        };

        if !self.config().auto_accept_link_updates {
            self.emit(UpstreamEvent::PhyRequest {
                address: address.clone(),
                id,
                phys,
            });
            return;
        }

        self.with_session(address, |session| {
            session.slots.mark_applying(ProcedureKind::Phy, id)
        });
        let result = self.transport.phy_update(address, phys).await;
        self.complete_link(address, LinkKind::Phy, id, &result);
    }

    pub(crate) fn on_phy_updated(&self, address: &DeviceAddress, phys: PhyParams) {
        if self
            .with_session(address, |session| session.link.phys = phys)
            .is_none()
        {
            return;
        }
        let id = self.link_updated(address, LinkKind::Phy);
        self.emit(LinkKind::Phy.status_event(address, id, ProcedureStatus::Success));
        self.emit(UpstreamEvent::PhyUpdated {
            address: address.clone(),
            phys,
        });
    }

    pub(crate) async fn on_att_mtu_request(&self, address: &DeviceAddress, mtu: u16) {
        let Some(id) = self.begin_peer_link_request(address, LinkKind::Mtu) else {
            return;
        };

        if !self.config().auto_accept_link_updates {
            self.emit(UpstreamEvent::MtuRequest {
                address: address.clone(),
                id,
                mtu,
            });
            return;
        }

        self.with_session(address, |session| {
            session.slots.mark_applying(ProcedureKind::Mtu, id)
        });
        let result = self.transport.att_mtu_reply(address, mtu).await;
        self.complete_link(address, LinkKind::Mtu, id, &result);
        if result.is_ok() {
            self.mtu_changed(address, mtu);
        }
    }

    pub(crate) fn on_att_mtu_changed(&self, address: &DeviceAddress, mtu: u16) {
        if !self.contains_session(address) {
            return;
        }
        let id = self.link_updated(address, LinkKind::Mtu);
        self.emit(LinkKind::Mtu.status_event(address, id, ProcedureStatus::Success));
        self.mtu_changed(address, mtu);
    }

    fn mtu_changed(&self, address: &DeviceAddress, mtu: u16) {
        self.with_session(address, |session| session.link.mtu = mtu);
        self.emit(UpstreamEvent::MtuUpdated {
            address: address.clone(),
            mtu,
        });
    }

    pub(crate) async fn on_data_length_update_request(
        &self,
        address: &DeviceAddress,
        params: DataLengthParams,
    ) {
        let Some(id) = self.begin_peer_link_request(address, LinkKind::DataLength) else {
            return;
        };

        let data_length = proposed_data_length(&params);
        if !self.config().auto_accept_link_updates {
            self.emit(UpstreamEvent::DataLengthRequest {
                address: address.clone(),
                id,
                data_length,
            });
            return;
        }

        self.with_session(address, |session| {
            session.slots.mark_applying(ProcedureKind::DataLength, id)
        });
        let result = self
            .transport
            .data_length_update(address, DataLengthParams::symmetric(data_length))
            .await;
        self.complete_link(address, LinkKind::DataLength, id, &result);
    }

    pub(crate) fn on_data_length_updated(&self, address: &DeviceAddress, params: DataLengthParams) {
        let data_length = effective_data_length(&params);
        if self
            .with_session(address, |session| session.link.data_length = data_length)
            .is_none()
        {
            return;
        }
        let id = self.link_updated(address, LinkKind::DataLength);
        self.emit(LinkKind::DataLength.status_event(address, id, ProcedureStatus::Success));
        self.emit(UpstreamEvent::DataLengthUpdated {
            address: address.clone(),
            data_length,
        });
    }
}

// ============================================================================
// LOCAL OPERATIONS
// ============================================================================

impl Orchestrator {
    /// Apply connection parameters, answering the peer request `id` or
    /// starting a local update
    pub async fn update_connection_params(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        params: ConnectionParams,
    ) -> Result<(), SessionError> {
        self.claim_link(address, LinkKind::ConnParams, id)?;
        let result = self
            .transport
            .update_connection_parameters(address, params)
            .await;
        self.complete_link(address, LinkKind::ConnParams, id, &result);
        result.map_err(Into::into)
    }

    /// Turn down the peer's connection parameter request `id`
    pub async fn reject_connection_params(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
    ) -> Result<(), SessionError> {
        self.claim_link(address, LinkKind::ConnParams, id)?;
        match self.transport.reject_conn_params(address).await {
            Ok(()) => {
                self.with_session(address, |session| {
                    session
                        .slots
                        .finish(ProcedureKind::ConnParams, id, ProcedureStatus::Rejected)
                });
                self.emit(LinkKind::ConnParams.status_event(
                    address,
                    Some(id),
                    ProcedureStatus::Rejected,
                ));
                Ok(())
            }
            Err(e) => {
                let result = Err(e);
                self.complete_link(address, LinkKind::ConnParams, id, &result);
                result.map_err(Into::into)
            }
        }
    }

    pub async fn update_phy(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        phys: PhyParams,
    ) -> Result<(), SessionError> {
        self.claim_link(address, LinkKind::Phy, id)?;
        let result = self.transport.phy_update(address, phys).await;
        self.complete_link(address, LinkKind::Phy, id, &result);
        result.map_err(Into::into)
    }

    /// Start an ATT MTU exchange. Returns the MTU the transport settled on.
    pub async fn request_mtu(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        mtu: u16,
    ) -> Result<u16, SessionError> {
        self.claim_link(address, LinkKind::Mtu, id)?;
        match self.transport.request_att_mtu(address, mtu).await {
            Ok(negotiated) => {
                self.with_session(address, |session| session.link.mtu = negotiated);
                self.complete_link(address, LinkKind::Mtu, id, &Ok(()));
                Ok(negotiated)
            }
            Err(e) => {
                let result = Err(e);
                self.complete_link(address, LinkKind::Mtu, id, &result);
                result.map(|()| mtu).map_err(Into::into)
            }
        }
    }

    /// Answer the peer's MTU request `id`
    pub async fn reply_mtu(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        mtu: u16,
    ) -> Result<(), SessionError> {
        self.claim_link(address, LinkKind::Mtu, id)?;
        let result = self.transport.att_mtu_reply(address, mtu).await;
        self.complete_link(address, LinkKind::Mtu, id, &result);
        if result.is_ok() {
            self.mtu_changed(address, mtu);
        }
        result.map_err(Into::into)
    }

    /// Request a symmetric data length of `data_length` octets
    pub async fn update_data_length(
        &self,
        address: &DeviceAddress,
        id: CorrelationId,
        data_length: u16,
    ) -> Result<(), SessionError> {
        self.claim_link(address, LinkKind::DataLength, id)?;
        let result = self
            .transport
            .data_length_update(address, DataLengthParams::symmetric(data_length))
            .await;
        self.complete_link(address, LinkKind::DataLength, id, &result);
        result.map_err(Into::into)
    }
}
