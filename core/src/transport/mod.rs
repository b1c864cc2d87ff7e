// Transport module: adapter contract, BLE value types and the loopback transport

pub mod abstraction;
pub mod adapter;
pub mod ble;
pub mod loopback;

pub use abstraction::{
    AdapterStatus, AttributeKind, LogSeverity, TransportCommand, TransportError, TransportEvent,
    STATUS_CONNECTION_ACTIVE, STATUS_RESET_PERFORMED,
};
pub use adapter::AdapterTransport;
pub use loopback::LoopbackTransport;
