// Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transport::ble::{ConnectionParams, SecurityParams};

/// Default throttle window of the notification batcher
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 500;

/// Adapter-level settings read by the orchestrator at decision time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Accept pairing requests with the default security params
    pub auto_accept_pairing: bool,

    /// Accept connection parameter, PHY, MTU and data length requests
    pub auto_accept_link_updates: bool,

    /// Security params used for auto-accepted and peer-initiated pairing.
    /// Security requests are ignored while this is unset.
    pub security_params: Option<SecurityParams>,

    /// Connection parameters used for outgoing connections.
    /// The min/max interval pair is always sent with min == max.
    pub connection_params: ConnectionParams,

    /// Notification batching window in milliseconds
    pub batch_window_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_accept_pairing: true,
            auto_accept_link_updates: true,
            security_params: Some(SecurityParams::default()),
            connection_params: ConnectionParams::fixed(7.5, 0, 4000),
            batch_window_ms: DEFAULT_BATCH_WINDOW_MS,
        }
    }
}

impl OrchestratorConfig {
    /// Config that surfaces every request for manual confirmation
    pub fn manual() -> Self {
        Self {
            auto_accept_pairing: false,
            auto_accept_link_updates: false,
            ..Self::default()
        }
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Connection parameters with the interval pinned to the configured minimum
    pub fn outgoing_connection_params(&self) -> ConnectionParams {
        ConnectionParams::fixed(
            self.connection_params.min_conn_interval_ms,
            self.connection_params.slave_latency,
            self.connection_params.conn_sup_timeout_ms,
        )
    }
}
