//! Session orchestrator
//!
//! Owns the adapter transport, the session registry and the notification
//! batcher. Transport events are dispatched serially through
//! [`Orchestrator::dispatch`]; application operations are async methods that
//! issue transport commands and report every outcome as an [`UpstreamEvent`].
//!
//! Locks are only held for synchronous bookkeeping, never across a transport
//! command.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::batcher::NotificationBatcher;
use crate::bond::BondStore;
use crate::config::OrchestratorConfig;
use crate::events::{AttributeValue, CorrelationId, UpstreamEvent};
use crate::session::{ConnectAttempt, ConnectionState, DeviceSession, SessionError, SessionRegistry};
use crate::transport::ble::{
    AddressType, ConnectOptions, DeviceAddress, DeviceInfo, OpenOptions, Role, ScanParams,
};
use crate::transport::{
    AdapterStatus, AdapterTransport, AttributeKind, LogSeverity, TransportEvent,
    STATUS_CONNECTION_ACTIVE, STATUS_RESET_PERFORMED,
};

pub struct Orchestrator {
    pub(crate) transport: Arc<dyn AdapterTransport>,
    pub(crate) bonds: Arc<dyn BondStore>,
    config: RwLock<OrchestratorConfig>,
    registry: RwLock<SessionRegistry>,
    batcher: NotificationBatcher,
    upstream: mpsc::UnboundedSender<UpstreamEvent>,
    next_id: AtomicU64,
}

impl Orchestrator {
    /// Create a new orchestrator and the receiving end of its upstream events
    pub fn new(
        transport: Arc<dyn AdapterTransport>,
        bonds: Arc<dyn BondStore>,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<UpstreamEvent>) {
        let (upstream, receiver) = mpsc::unbounded_channel();
        let batcher = NotificationBatcher::new(config.batch_window(), upstream.clone());

        let orchestrator = Self {
            transport,
            bonds,
            config: RwLock::new(config),
            registry: RwLock::new(SessionRegistry::new()),
            batcher,
            upstream,
            next_id: AtomicU64::new(1),
        };
        (orchestrator, receiver)
    }

    // ========================================================================
    // CONFIGURATION
    // ========================================================================

    pub fn config(&self) -> OrchestratorConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. The batch window is fixed at construction.
    pub fn set_config(&self, config: OrchestratorConfig) {
        *self.config.write() = config;
    }

    pub fn set_auto_accept_pairing(&self, enabled: bool) {
        self.config.write().auto_accept_pairing = enabled;
    }

    pub fn set_auto_accept_link_updates(&self, enabled: bool) {
        self.config.write().auto_accept_link_updates = enabled;
    }

    /// Fresh id for a locally started procedure
    pub fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // SESSION ACCESS
    // ========================================================================

    /// Snapshot of the session for `address`
    pub fn session(&self, address: &DeviceAddress) -> Option<DeviceSession> {
        self.registry.read().get(address).cloned()
    }

    /// Addresses of every known session, sorted
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.registry.read().addresses()
    }

    pub fn connect_attempt(&self) -> Option<ConnectAttempt> {
        self.registry.read().connect_attempt().cloned()
    }

    pub fn batcher(&self) -> &NotificationBatcher {
        &self.batcher
    }

    pub(crate) fn contains_session(&self, address: &DeviceAddress) -> bool {
        self.registry.read().contains(address)
    }

    pub(crate) fn with_session<R>(
        &self,
        address: &DeviceAddress,
        f: impl FnOnce(&mut DeviceSession) -> R,
    ) -> Option<R> {
        self.registry.write().get_mut(address).map(f)
    }

    pub(crate) fn require_session<R>(
        &self,
        address: &DeviceAddress,
        f: impl FnOnce(&mut DeviceSession) -> R,
    ) -> Result<R, SessionError> {
        self.with_session(address, f)
            .ok_or_else(|| SessionError::UnknownDevice(address.clone()))
    }

    pub(crate) fn emit(&self, event: UpstreamEvent) {
        debug!("Upstream: {}", event);
        if self.upstream.send(event).is_err() {
            debug!("Upstream receiver dropped");
        }
    }

    // ========================================================================
    // EVENT DISPATCH
    // ========================================================================

    /// Consume transport events until the stream closes
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>) {
        info!("Orchestrator started");
        while let Some(event) = events.recv().await {
            self.dispatch(event).await;
        }
        self.batcher.flush();
        info!("Transport event stream closed");
    }

    /// Route one transport event
    pub async fn dispatch(&self, event: TransportEvent) {
        if let Some(address) = event.address() {
            let registry = self.registry.read();
            if registry.is_ignored(address) {
                return;
            }
            if !event.creates_session() && !registry.contains(address) {
                debug!("Dropping {} for unknown device {}", event.name(), address);
                return;
            }
        }

        match event {
            TransportEvent::Error { message, code } => {
                error!("{}", message);
                self.emit(UpstreamEvent::AdapterError { message, code });
            }
            TransportEvent::Warning { message } => {
                if message.contains("not supported") {
                    warn!("{}", message);
                } else {
                    info!("{}", message);
                }
            }
            TransportEvent::LogMessage { severity, message } => {
                log_transport_message(severity, &message)
            }
            TransportEvent::StateChanged { state } => {
                self.emit(UpstreamEvent::AdapterStateChanged { state });
            }
            TransportEvent::Status { status } => self.on_status(status).await,
            TransportEvent::ScanTimedOut => {
                info!("Scan timed out");
                self.emit(UpstreamEvent::ScanTimedOut);
            }
            TransportEvent::AdvertiseTimedOut => {
                info!("Advertising timed out");
                self.emit(UpstreamEvent::AdvertiseTimedOut);
            }

            TransportEvent::DeviceDiscovered { device } => self.on_device_discovered(device),
            TransportEvent::DeviceConnected { device } => self.on_device_connected(device).await,
            TransportEvent::DeviceDisconnected { address, reason } => {
                self.on_device_disconnected(&address, reason)
            }
            TransportEvent::ConnectTimedOut { address } => self.on_connect_timed_out(&address),

            TransportEvent::SecurityRequest {
                address,
                requirements,
            } => self.on_security_request(&address, requirements).await,
            TransportEvent::SecParamsRequest {
                address,
                peer_params,
            } => self.on_sec_params_request(&address, peer_params).await,
            TransportEvent::SecInfoRequest { address } => self.on_sec_info_request(&address).await,
            TransportEvent::AuthKeyRequest { address, key_type } => {
                self.on_auth_key_request(&address, key_type)
            }
            TransportEvent::PasskeyDisplay {
                address,
                passkey,
                match_request,
            } => self.on_passkey_display(&address, passkey, match_request),
            TransportEvent::LescDhkeyRequest {
                address,
                peer_public_key,
                oob_required,
            } => {
                self.on_lesc_dhkey_request(&address, peer_public_key, oob_required)
                    .await
            }
            TransportEvent::KeyPressed { address, keypress } => {
                self.on_key_pressed(&address, keypress)
            }
            TransportEvent::AuthStatus { address, status } => self.on_auth_status(&address, status),
            TransportEvent::SecurityChanged { address, security } => {
                self.on_security_changed(&address, security)
            }
            TransportEvent::SecurityRequestTimedOut { address } => {
                self.on_security_request_timed_out(&address)
            }

            TransportEvent::ConnParamUpdateRequest { address, params } => {
                self.on_conn_param_update_request(&address, params).await
            }
            TransportEvent::ConnParamUpdate { address, params } => {
                self.on_conn_param_update(&address, params)
            }
            TransportEvent::PhyUpdateRequest { address, phys } => {
                self.on_phy_update_request(&address, phys).await
            }
            TransportEvent::PhyUpdated { address, phys } => self.on_phy_updated(&address, phys),
            TransportEvent::AttMtuRequest { address, mtu } => {
                self.on_att_mtu_request(&address, mtu).await
            }
            TransportEvent::AttMtuChanged { address, mtu } => self.on_att_mtu_changed(&address, mtu),
            TransportEvent::DataLengthUpdateRequest { address, params } => {
                self.on_data_length_update_request(&address, params).await
            }
            TransportEvent::DataLengthUpdated { address, params } => {
                self.on_data_length_updated(&address, params)
            }

            TransportEvent::CharacteristicValueChanged {
                address,
                handle,
                value,
            } => self.batcher.push(AttributeValue {
                address,
                kind: AttributeKind::Characteristic,
                handle,
                value,
            }),
            TransportEvent::DescriptorValueChanged {
                address,
                handle,
                value,
            } => self.batcher.push(AttributeValue {
                address,
                kind: AttributeKind::Descriptor,
                handle,
                value,
            }),
        }
    }

    async fn on_status(&self, status: AdapterStatus) {
        match status.name.as_str() {
            STATUS_RESET_PERFORMED => {
                info!("Adapter reset performed, dropping all sessions");
                self.registry.write().clear();
                self.emit(UpstreamEvent::AdapterResetPerformed);
            }
            STATUS_CONNECTION_ACTIVE => {
                debug!("Connection to adapter is active, enabling BLE stack");
                self.enable_stack().await;
            }
            _ => error!(
                "Adapter status {} ({}): {}",
                status.name, status.id, status.message
            ),
        }
    }

    async fn enable_stack(&self) {
        if let Err(e) = self.transport.enable_ble().await {
            self.emit(UpstreamEvent::AdapterError {
                message: format!("Failed to enable BLE stack: {}", e),
                code: None,
            });
            return;
        }

        match self.transport.get_state().await {
            Ok(state) => {
                debug!("BLE stack enabled");
                self.emit(UpstreamEvent::AdapterStateChanged { state });
            }
            Err(e) => self.emit(UpstreamEvent::AdapterError {
                message: format!("Failed to get adapter state: {}", e),
                code: None,
            }),
        }
    }

    fn on_device_discovered(&self, device: DeviceInfo) {
        let device = {
            let mut registry = self.registry.write();
            let session = registry.get_or_create(&device.address);
            session.update_from(&device);
            session.device_info()
        };
        self.emit(UpstreamEvent::DeviceDiscovered { device });
    }

    async fn on_device_connected(&self, device: DeviceInfo) {
        let address = device.address.clone();
        let role = {
            let mut registry = self.registry.write();
            if registry.park_connection(&device) {
                debug!("{} connected while a cancel is pending, holding", address);
                return;
            }
            registry.end_connect(&address);
            let session = registry.get_or_create(&address);
            session.on_connected(&device);
            session.role
        };

        if role == Some(Role::Peripheral) {
            self.encrypt_if_bonded(&address).await;
        }

        if let Some(device) = self.with_session(&address, |session| session.device_info()) {
            info!("Connected to {}", address);
            self.emit(UpstreamEvent::DeviceConnected { device });
        }
    }

    fn on_device_disconnected(&self, address: &DeviceAddress, reason: Option<u8>) {
        {
            let mut registry = self.registry.write();
            registry.end_connect(address);
            if let Some(session) = registry.get_mut(address) {
                session.on_disconnected();
            }
        }
        info!("Disconnected from {}, reason: {:?}", address, reason);
        self.emit(UpstreamEvent::DeviceDisconnected {
            address: address.clone(),
            reason,
        });
    }

    fn on_connect_timed_out(&self, address: &DeviceAddress) {
        self.registry.write().end_connect(address);
        info!("Connect to {} timed out", address);
        self.emit(UpstreamEvent::ConnectTimedOut {
            address: address.clone(),
        });
    }

    // ========================================================================
    // ADAPTER OPERATIONS
    // ========================================================================

    pub async fn open(&self, options: &OpenOptions) -> Result<(), SessionError> {
        match self.transport.open(options).await {
            Ok(()) => {
                info!("Adapter opened, baud rate {}", options.baud_rate);
                self.emit(UpstreamEvent::AdapterOpened);
                Ok(())
            }
            Err(e) => {
                self.emit(UpstreamEvent::AdapterError {
                    message: format!("Failed to open adapter: {}", e),
                    code: None,
                });
                Err(e.into())
            }
        }
    }

    /// Close the adapter, dropping every session and flushing pending values
    pub async fn close(&self) -> Result<(), SessionError> {
        if let Err(e) = self.transport.close().await {
            self.emit(UpstreamEvent::AdapterError {
                message: format!("Failed to close adapter: {}", e),
                code: None,
            });
            return Err(e.into());
        }

        self.registry.write().clear();
        self.batcher.flush();
        info!("Adapter closed");
        self.emit(UpstreamEvent::AdapterClosed);
        Ok(())
    }

    // ========================================================================
    // CONNECTION OPERATIONS
    // ========================================================================

    pub async fn connect(
        &self,
        address: &DeviceAddress,
        address_type: Option<AddressType>,
    ) -> Result<(), SessionError> {
        let options = ConnectOptions {
            scan_params: ScanParams::default(),
            conn_params: self.config.read().outgoing_connection_params(),
        };

        let claimed = {
            let mut registry = self.registry.write();
            if registry.get(address).map(|s| s.is_connected()).unwrap_or(false) {
                Err(SessionError::InvalidArgument(format!(
                    "{} is already connected",
                    address
                )))
            } else {
                registry.begin_connect(address).map(|()| {
                    let session = registry.get_or_create(address);
                    if address_type.is_some() {
                        session.address_type = address_type;
                    }
                    session.address_type
                })
            }
        };
        let address_type = match claimed {
            Ok(address_type) => address_type,
            Err(e) => {
                warn!("Cannot connect to {}: {}", address, e);
                self.emit(UpstreamEvent::ConnectFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        self.emit(UpstreamEvent::DeviceConnecting {
            address: address.clone(),
        });
        match self.transport.connect(address, address_type, &options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Connect to {} failed: {}", address, e);
                self.registry.write().end_connect(address);
                self.emit(UpstreamEvent::ConnectFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Cancel the pending connect attempt. The session leaves `Connecting`
    /// only once the transport confirms; a connection reported in the meantime
    /// is dropped on success and applied if the cancel fails.
    pub async fn cancel_connect(&self) -> Result<(), SessionError> {
        let address = match self.registry.write().request_cancel() {
            Ok(address) => address,
            Err(e) => {
                self.emit(UpstreamEvent::AdapterError {
                    message: format!("Cannot cancel connect: {}", e),
                    code: None,
                });
                return Err(e);
            }
        };

        self.emit(UpstreamEvent::CancelConnectRequested {
            address: address.clone(),
        });
        match self.transport.cancel_connect().await {
            Ok(()) => {
                self.registry.write().end_connect(&address);
                info!("Connect to {} canceled", address);
                self.emit(UpstreamEvent::ConnectCanceled { address });
                Ok(())
            }
            Err(e) => {
                warn!("Cancel connect to {} failed: {}", address, e);
                let parked = self.registry.write().withdraw_cancel();
                self.emit(UpstreamEvent::CancelConnectFailed {
                    address,
                    reason: e.to_string(),
                });
                if let Some(device) = parked {
                    self.on_device_connected(device).await;
                }
                Err(e.into())
            }
        }
    }

    pub async fn disconnect(&self, address: &DeviceAddress) -> Result<(), SessionError> {
        if let Err(e) = self.require_session(address, |session| {
            session.connection = ConnectionState::Disconnecting;
        }) {
            self.emit(UpstreamEvent::DisconnectFailed {
                address: address.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }

        self.emit(UpstreamEvent::DeviceDisconnecting {
            address: address.clone(),
        });
        match self.transport.disconnect(address).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Disconnect from {} failed: {}", address, e);
                self.with_session(address, |session| {
                    if session.connection == ConnectionState::Disconnecting {
                        session.connection = ConnectionState::Connected;
                    }
                });
                self.emit(UpstreamEvent::DisconnectFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Treat a device as disconnected without touching the link
    pub fn detach_device(&self, address: &DeviceAddress) -> Result<(), SessionError> {
        self.require_session(address, DeviceSession::on_disconnected)?;
        self.emit(UpstreamEvent::DeviceDisconnected {
            address: address.clone(),
            reason: None,
        });
        Ok(())
    }

    /// Drop every future event for `address`
    pub fn ignore_device(&self, address: &DeviceAddress) {
        if self.registry.write().ignore(address.clone()) {
            debug!("Ignoring events from {}", address);
        }
    }

    pub fn unignore_device(&self, address: &DeviceAddress) {
        if self.registry.write().unignore(address) {
            debug!("Accepting events from {} again", address);
        }
    }
}

fn log_transport_message(severity: u8, message: &str) {
    match LogSeverity::from_u8(severity) {
        Some(LogSeverity::Trace) | Some(LogSeverity::Debug) => debug!("{}", message),
        Some(LogSeverity::Info) => info!("{}", message),
        Some(LogSeverity::Warning) => warn!("{}", message),
        Some(LogSeverity::Error) | Some(LogSeverity::Fatal) => error!("{}", message),
        None => warn!("Log message of unknown severity {}: {}", severity, message),
    }
}
