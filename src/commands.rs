//! Flat, handle-based entry points over the process-wide [`DeviceManager`].
//!
//! Each call maps driver errors onto the numeric [`ErrorCode`] of the rotator
//! SDK and logs the underlying cause.

use crate::device::{
    DeviceError, DeviceId, ErrorCode, MotionInfo, RotatorConfig, RotatorConfigUpdate, RotatorStatus, VersionInfo,
};
use crate::manager;

fn report<T>(operation: &str, result: Result<T, DeviceError>) -> Result<T, ErrorCode> {
    result.map_err(|e| {
        log::error!("{} failed: {}", operation, e);
        e.code()
    })
}

/// Version of this driver
pub fn sdk_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Scan for rotators; returns their handles
pub async fn rotator_scan() -> Result<Vec<DeviceId>, ErrorCode> {
    report("Scan", manager().scan().await)
}

pub async fn rotator_open(id: DeviceId) -> Result<(), ErrorCode> {
    report("Open", manager().open(id).await)
}

/// Open the rotator on a known port path
pub async fn rotator_open_port(port_name: &str) -> Result<DeviceId, ErrorCode> {
    report("Open port", manager().open_port(port_name).await)
}

pub async fn rotator_close(id: DeviceId) -> Result<(), ErrorCode> {
    report("Close", manager().close(id).await)
}

pub async fn rotator_get_config(id: DeviceId) -> Result<RotatorConfig, ErrorCode> {
    report("Get config", manager().get_config(id).await)
}

pub async fn rotator_set_config(id: DeviceId, update: RotatorConfigUpdate) -> Result<(), ErrorCode> {
    report("Set config", manager().set_config(id, update).await)
}

pub async fn rotator_get_status(id: DeviceId) -> Result<RotatorStatus, ErrorCode> {
    report("Get status", manager().get_status(id).await)
}

pub async fn rotator_get_motion(id: DeviceId) -> Result<MotionInfo, ErrorCode> {
    report("Get motion", manager().get_motion(id).await)
}

pub async fn rotator_get_version(id: DeviceId) -> Result<VersionInfo, ErrorCode> {
    report("Get version", manager().get_version(id).await)
}

pub async fn rotator_find_home(id: DeviceId) -> Result<(), ErrorCode> {
    report("Find home", manager().find_home(id).await)
}

pub async fn rotator_sync_position(id: DeviceId, angle: f64) -> Result<(), ErrorCode> {
    report("Sync position", manager().sync_position(id, angle).await)
}

/// Relative move; positive angles turn counterclockwise
pub async fn rotator_move(id: DeviceId, angle: f64) -> Result<(), ErrorCode> {
    report("Move", manager().move_relative(id, angle).await)
}

pub async fn rotator_move_to(id: DeviceId, angle: f64) -> Result<(), ErrorCode> {
    report("Move to", manager().move_to(id, angle).await)
}

pub async fn rotator_stop(id: DeviceId) -> Result<(), ErrorCode> {
    report("Stop", manager().stop(id).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdk_version() {
        assert_eq!(sdk_version(), "1.0.0");
    }

    #[tokio::test]
    async fn test_unknown_handle_maps_to_invalid_id() {
        let id = DeviceId::MAX;
        assert_eq!(rotator_get_status(id).await, Err(ErrorCode::InvalidId));
        assert_eq!(rotator_move(id, 10.0).await, Err(ErrorCode::InvalidId));
        assert_eq!(rotator_stop(id).await, Err(ErrorCode::InvalidId));
        assert_eq!(rotator_get_motion(id).await, Err(ErrorCode::InvalidId));
        assert_eq!(rotator_close(id).await, Err(ErrorCode::InvalidId));
    }

    #[tokio::test]
    async fn test_parameter_checks_precede_handle_lookup() {
        assert_eq!(rotator_move_to(DeviceId::MAX, 360.0).await, Err(ErrorCode::InvalidParameter));
        assert_eq!(rotator_move(DeviceId::MAX, f64::NAN).await, Err(ErrorCode::InvalidParameter));
    }
}
