// blelink core: BLE adapter session orchestration
//
// Raw adapter callbacks go in, a per-device session model and typed upstream
// events come out. The physical adapter sits behind `AdapterTransport`.

pub mod batcher;
pub mod bond;
pub mod config;
pub mod events;
pub mod link;
pub mod orchestrator;
pub mod security;
pub mod session;
pub mod transport;

pub use batcher::NotificationBatcher;
pub use bond::{BondRecord, BondStore, BondStoreError, InMemoryBondStore};
pub use config::{OrchestratorConfig, DEFAULT_BATCH_WINDOW_MS};
pub use events::{AttributeValue, CorrelationId, ProcedureStatus, UpstreamEvent};
pub use orchestrator::Orchestrator;
pub use security::{KeyExchange, SecurityContext, SecurityState};
pub use session::{
    ConnectAttempt, ConnectionState, DeviceSession, Initiator, LinkParameters, ProcedureKind,
    SessionError,
};
pub use transport::{
    AdapterTransport, LoopbackTransport, TransportCommand, TransportError, TransportEvent,
};

use tracing_subscriber::EnvFilter;

/// Install a stderr `tracing` subscriber honouring `RUST_LOG`, falling back
/// to `default_filter`. Later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
