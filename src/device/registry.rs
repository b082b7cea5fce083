use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::models::{Device, DeviceId};
use super::motion::{MoveListener, SharedLink};
use super::{DeviceError, Result};

/// One registered rotator: its state, its line (while open) and the
/// completion task of the last move
pub struct DeviceEntry {
    pub port_name: String,
    pub state: Arc<Mutex<Device>>,
    pub link: Option<SharedLink>,
    pub listener: Option<MoveListener>,
}

impl DeviceEntry {
    pub fn new(id: DeviceId, port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            state: Arc::new(Mutex::new(Device::new(id, port_name.to_string()))),
            link: None,
            listener: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// The open line, or a communication error
    pub fn open_link(&self) -> Result<SharedLink> {
        self.link
            .clone()
            .ok_or_else(|| crate::serial::SerialError::ConnectionFailed(format!("{} is not open", self.port_name)).into())
    }

    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(MoveListener::is_running)
    }

    /// Cancel and join the completion task of a previous move
    pub async fn cancel_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            if listener.is_running() {
                log::debug!("Superseding move listener on {}", self.port_name);
            }
            listener.cancel().await;
        }
    }

    /// Cancel the listener and close the line
    pub async fn shutdown(&mut self) {
        self.cancel_listener().await;
        if let Some(link) = self.link.take() {
            link.lock().await.close();
        }
    }
}

/// Handle-to-device table. Callers hold the surrounding lock for the whole
/// of one public operation.
#[derive(Default)]
pub struct Registry {
    devices: BTreeMap<DeviceId, DeviceEntry>,
    next_id: DeviceId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: DeviceId) -> Result<&DeviceEntry> {
        self.devices.get(&id).ok_or(DeviceError::InvalidHandle(id))
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Result<&mut DeviceEntry> {
        self.devices.get_mut(&id).ok_or(DeviceError::InvalidHandle(id))
    }

    pub fn find_by_port(&self, port_name: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|(_, entry)| entry.port_name == port_name)
            .map(|(id, _)| *id)
    }

    /// Handle for `port_name`, registering it if unknown
    pub fn register(&mut self, port_name: &str) -> DeviceId {
        if let Some(id) = self.find_by_port(port_name) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.devices.insert(id, DeviceEntry::new(id, port_name));
        log::info!("Registered rotator {} on {}", id, port_name);
        id
    }

    pub fn remove(&mut self, id: DeviceId) -> Result<DeviceEntry> {
        self.devices.remove(&id).ok_or(DeviceError::InvalidHandle(id))
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
