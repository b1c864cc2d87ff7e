// Session registry: sessions by address, the ignore list and the connect slot

use std::collections::{HashMap, HashSet};

use super::{ConnectionState, DeviceSession, SessionError};
use crate::transport::ble::{DeviceAddress, DeviceInfo};

/// The single outgoing connect attempt an adapter may have
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectAttempt {
    pub address: DeviceAddress,
    /// A cancel was requested and awaits confirmation
    pub cancel_requested: bool,
    /// Link reported up while the cancel was unconfirmed
    pub parked: Option<DeviceInfo>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<DeviceAddress, DeviceSession>,
    ignored: HashSet<DeviceAddress>,
    connecting: Option<ConnectAttempt>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&DeviceSession> {
        self.sessions.get(address)
    }

    pub fn get_mut(&mut self, address: &DeviceAddress) -> Option<&mut DeviceSession> {
        self.sessions.get_mut(address)
    }

    pub fn get_or_create(&mut self, address: &DeviceAddress) -> &mut DeviceSession {
        self.sessions
            .entry(address.clone())
            .or_insert_with(|| DeviceSession::new(address.clone()))
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.sessions.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn addresses(&self) -> Vec<DeviceAddress> {
        let mut addresses: Vec<_> = self.sessions.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Drop every session and any connect attempt. The ignore list survives.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.connecting = None;
    }

    // ---- ignore list ----

    pub fn ignore(&mut self, address: DeviceAddress) -> bool {
        self.ignored.insert(address)
    }

    pub fn unignore(&mut self, address: &DeviceAddress) -> bool {
        self.ignored.remove(address)
    }

    pub fn is_ignored(&self, address: &DeviceAddress) -> bool {
        self.ignored.contains(address)
    }

    // ---- connect slot ----

    pub fn connect_attempt(&self) -> Option<&ConnectAttempt> {
        self.connecting.as_ref()
    }

    /// Claim the adapter's connect slot and move the session to `Connecting`
    pub fn begin_connect(&mut self, address: &DeviceAddress) -> Result<(), SessionError> {
        if self.connecting.is_some() {
            return Err(SessionError::ConnectInProgress);
        }
        self.connecting = Some(ConnectAttempt {
            address: address.clone(),
            cancel_requested: false,
            parked: None,
        });
        self.get_or_create(address).connection = ConnectionState::Connecting;
        Ok(())
    }

    /// Mark the current attempt as being canceled, returning its address
    pub fn request_cancel(&mut self) -> Result<DeviceAddress, SessionError> {
        let attempt = self
            .connecting
            .as_mut()
            .ok_or(SessionError::NoConnectInProgress)?;
        attempt.cancel_requested = true;
        Ok(attempt.address.clone())
    }

    /// Cancel did not go through; the attempt stays in place.
    /// Returns the connection that arrived meanwhile, if any.
    pub fn withdraw_cancel(&mut self) -> Option<DeviceInfo> {
        let attempt = self.connecting.as_mut()?;
        attempt.cancel_requested = false;
        attempt.parked.take()
    }

    /// Hold a connection for the attempt being canceled until the cancel
    /// settles. Returns false when no cancel is pending for that device.
    pub fn park_connection(&mut self, device: &DeviceInfo) -> bool {
        match self.connecting.as_mut() {
            Some(attempt) if attempt.cancel_requested && attempt.address == device.address => {
                attempt.parked = Some(device.clone());
                true
            }
            _ => false,
        }
    }

    /// Free the connect slot if it belongs to `address`.
    /// A session still `Connecting` falls back to `Disconnected`.
    pub fn end_connect(&mut self, address: &DeviceAddress) -> bool {
        match &self.connecting {
            Some(attempt) if &attempt.address == address => {
                self.connecting = None;
                if let Some(session) = self.sessions.get_mut(address) {
                    if session.connection == ConnectionState::Connecting {
                        session.connection = ConnectionState::Disconnected;
                    }
                }
                true
            }
            _ => false,
        }
    }
}
