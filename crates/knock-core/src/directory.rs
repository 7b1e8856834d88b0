//! Device registry boundary: read-only descriptor lookup.

use crate::types::DeviceDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, thiserror::Error)]
#[error("device directory unavailable: {0}")]
pub struct DirectoryError(pub String);

/// Source of device descriptors, refreshed out-of-band.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// `Ok(None)` when the device is unknown.
    async fn fetch_descriptor(&self, device_id: &str) -> Result<Option<DeviceDescriptor>, DirectoryError>;
}

/// In-process directory, for embedding a fixed device list.
#[derive(Default)]
pub struct StaticDirectory {
    devices: RwLock<HashMap<String, DeviceDescriptor>>,
}

impl StaticDirectory {
    pub fn new(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let map = devices
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();
        Self {
            devices: RwLock::new(map),
        }
    }

    pub fn upsert(&self, device: DeviceDescriptor) {
        let mut map = self.devices.write().unwrap_or_else(|p| p.into_inner());
        map.insert(device.device_id.clone(), device);
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn fetch_descriptor(&self, device_id: &str) -> Result<Option<DeviceDescriptor>, DirectoryError> {
        let map = self.devices.read().unwrap_or_else(|p| p.into_inner());
        Ok(map.get(device_id).cloned())
    }
}
