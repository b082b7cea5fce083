pub mod serial;
pub mod device;
pub mod config;
pub mod commands;

use once_cell::sync::Lazy;
use device::DeviceManager;

static DEVICE_MANAGER: Lazy<DeviceManager> = Lazy::new(DeviceManager::new);

/// Process-wide rotator manager backing [`commands`]
pub fn manager() -> &'static DeviceManager {
    &DEVICE_MANAGER
}
