use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::models::{
    shortest_delta, Device, DeviceId, MotionInfo, RotatorConfig, RotatorConfigUpdate, RotatorStatus, VersionInfo,
};
use super::motion::{self, MoveListener};
use super::registry::{DeviceEntry, Registry};
use super::{DeviceError, Result};
use crate::config::RotatorSettings;
use crate::serial::protocol::Command;
use crate::serial::{ClearBuffer, PortConnector, SerialConnector};

/// Central rotator management.
///
/// Every public operation holds the registry lock for its whole duration.
/// Move completion runs in a background task that only shares the device
/// state and the line, so the lock is free while a move is in flight.
pub struct DeviceManager {
    registry: Mutex<Registry>,
    connector: Arc<dyn PortConnector>,
    settings: RotatorSettings,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::with_settings(RotatorSettings::default())
    }

    pub fn with_settings(settings: RotatorSettings) -> Self {
        let connector = Arc::new(SerialConnector::new(&settings));
        Self::with_connector(connector, settings)
    }

    pub fn with_connector(connector: Arc<dyn PortConnector>, settings: RotatorSettings) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &RotatorSettings {
        &self.settings
    }

    /// Probe every candidate port and register the ones that answer the
    /// handshake. Returns the handles of all rotators found.
    pub async fn scan(&self) -> Result<Vec<DeviceId>> {
        let mut registry = self.registry.lock().await;
        let candidates = self.connector.candidate_ports()?;
        let mut found = Vec::new();

        for port_name in candidates {
            if found.len() >= self.settings.max_devices {
                log::warn!("Rotator limit of {} reached, ignoring remaining ports", self.settings.max_devices);
                break;
            }

            // An open rotator is busy; probing it would disturb it
            if let Some(id) = registry.find_by_port(&port_name) {
                if registry.get(id)?.is_open() {
                    found.push(id);
                    continue;
                }
            }

            match self.probe(&port_name).await {
                Ok(()) => {
                    log::info!("Valid Wanderer rotator found on {}", port_name);
                    found.push(registry.register(&port_name));
                }
                Err(e) => log::debug!("No rotator on {}: {}", port_name, e),
            }
        }

        log::info!("Scan found {} rotator(s)", found.len());
        Ok(found)
    }

    /// Handshake on a fresh line, then close it again
    async fn probe(&self, port_name: &str) -> Result<()> {
        let mut port = self.connector.connect(port_name)?;
        let result = motion::handshake(&mut *port, &self.settings.timing).await;
        port.close();
        result.map(|_| ()).map_err(DeviceError::from)
    }

    /// Open a scanned rotator: connect, handshake and read its status
    pub async fn open(&self, id: DeviceId) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let entry = registry.get_mut(id)?;
        self.open_entry(entry).await
    }

    /// Register the rotator on `port_name` if needed and open it
    pub async fn open_port(&self, port_name: &str) -> Result<DeviceId> {
        let mut registry = self.registry.lock().await;
        let id = match registry.find_by_port(port_name) {
            Some(id) => id,
            None => {
                self.probe(port_name).await?;
                registry.register(port_name)
            }
        };
        self.open_entry(registry.get_mut(id)?).await?;
        Ok(id)
    }

    async fn open_entry(&self, entry: &mut DeviceEntry) -> Result<()> {
        if entry.is_open() {
            return Err(DeviceError::InvalidState(format!("{} is already open", entry.port_name)));
        }

        log::debug!("Opening rotator on {}", entry.port_name);
        let mut port = self.connector.connect(&entry.port_name)?;
        let timing = &self.settings.timing;

        if let Err(e) = motion::handshake(&mut *port, timing).await {
            log::error!("Handshake with {} failed: {}", entry.port_name, e);
            port.close();
            return Err(e.into());
        }

        let report = match motion::query_status(&mut *port, timing).await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Querying status of {} failed: {}", entry.port_name, e);
                port.close();
                return Err(e.into());
            }
        };

        entry.state.lock().await.apply_status(&report);
        entry.link = Some(Arc::new(Mutex::new(port)));

        log::info!("Rotator opened on {} (model {})", entry.port_name, report.model);
        Ok(())
    }

    /// Close the line and forget the rotator
    pub async fn close(&self, id: DeviceId) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let mut entry = registry.remove(id)?;
        entry.shutdown().await;

        log::info!("Rotator {} closed", id);
        Ok(())
    }

    pub async fn get_config(&self, id: DeviceId) -> Result<RotatorConfig> {
        let registry = self.registry.lock().await;
        let entry = registry.get(id)?;
        let config = entry.state.lock().await.config();
        Ok(config)
    }

    /// Apply the set fields of `update`. Everything is validated before the
    /// first write.
    pub async fn set_config(&self, id: DeviceId, update: RotatorConfigUpdate) -> Result<()> {
        let registry = self.registry.lock().await;
        let entry = registry.get(id)?;

        if let Some(backlash) = update.backlash {
            if !backlash.is_finite() || backlash < 0.0 {
                return Err(DeviceError::InvalidParameter(format!("backlash {} must be >= 0", backlash)));
            }
            if Command::set_backlash(backlash).encode().is_err() {
                return Err(DeviceError::InvalidParameter(format!("backlash {} too large", backlash)));
            }
        }
        if let Some(angle) = update.overshoot_angle {
            if !angle.is_finite() || !(0.0..360.0).contains(&angle) {
                return Err(DeviceError::InvalidParameter(format!("overshoot angle {} outside [0, 360)", angle)));
            }
        }

        if update.touches_hardware() {
            let link = entry.open_link()?;
            if entry.is_listening() {
                return Err(DeviceError::InvalidState("rotator is moving".to_string()));
            }
            let mut port = link.lock().await;

            if let Some(reverse) = update.reverse_direction {
                motion::send_command(&mut **port, &Command::SetReverse(reverse), &self.settings.timing).await?;
                entry.state.lock().await.reverse_direction = reverse;
            }
            if let Some(backlash) = update.backlash {
                let command = Command::set_backlash(backlash);
                motion::send_command(&mut **port, &command, &self.settings.timing).await?;
                entry.state.lock().await.backlash_tenths = (backlash * 10.0).round() as i32;
            }
        }

        let mut device = entry.state.lock().await;
        if let Some(enabled) = update.overshoot {
            device.overshoot.enabled = enabled;
        }
        if let Some(angle) = update.overshoot_angle {
            device.overshoot.angle = angle;
        }
        if let Some(reverse) = update.overshoot_direction {
            device.overshoot.reverse = reverse;
        }
        Ok(())
    }

    /// Last known status. The rotator cannot report while moving, so this
    /// does not touch the line.
    pub async fn get_status(&self, id: DeviceId) -> Result<RotatorStatus> {
        let registry = self.registry.lock().await;
        let status = registry.get(id)?.state.lock().await.status();
        Ok(status)
    }

    /// Motion bookkeeping of the current or last move
    pub async fn get_motion(&self, id: DeviceId) -> Result<MotionInfo> {
        let registry = self.registry.lock().await;
        let motion = registry.get(id)?.state.lock().await.motion();
        Ok(motion)
    }

    pub async fn get_version(&self, id: DeviceId) -> Result<VersionInfo> {
        let registry = self.registry.lock().await;
        let version = registry.get(id)?.state.lock().await.version();
        Ok(version)
    }

    /// Whether a move completion task is still running for `id`
    pub async fn is_listening(&self, id: DeviceId) -> Result<bool> {
        let registry = self.registry.lock().await;
        Ok(registry.get(id)?.is_listening())
    }

    pub async fn devices(&self) -> Vec<DeviceId> {
        self.registry.lock().await.ids()
    }

    pub async fn find_home(&self, id: DeviceId) -> Result<()> {
        self.move_to(id, 0.0).await
    }

    /// Declare the current mechanical position to be `angle`. Only 0 is
    /// supported by the firmware.
    pub async fn sync_position(&self, id: DeviceId, angle: f64) -> Result<()> {
        let registry = self.registry.lock().await;
        let entry = registry.get(id)?;
        let link = entry.open_link()?;

        if angle != 0.0 {
            return Err(DeviceError::InvalidParameter(format!("cannot sync to {} degrees, only 0", angle)));
        }
        if entry.is_listening() {
            return Err(DeviceError::InvalidState("rotator is moving".to_string()));
        }

        motion::send_command(&mut **link.lock().await, &Command::SyncZero, &self.settings.timing).await?;
        entry.state.lock().await.set_mechanical_angle(0);
        Ok(())
    }

    /// Rotate by `angle` degrees; positive is counterclockwise
    pub async fn move_relative(&self, id: DeviceId, angle: f64) -> Result<()> {
        if !angle.is_finite() {
            return Err(DeviceError::InvalidParameter(format!("invalid angle {}", angle)));
        }

        let mut registry = self.registry.lock().await;
        let entry = registry.get_mut(id)?;
        entry.open_link()?;
        move_command(&*entry.state.lock().await, angle)?;
        entry.cancel_listener().await;
        self.start_move(entry, angle, None).await
    }

    /// Rotate to the absolute position `angle` along the shorter way
    pub async fn move_to(&self, id: DeviceId, angle: f64) -> Result<()> {
        if !angle.is_finite() || !(0.0..360.0).contains(&angle) {
            return Err(DeviceError::InvalidParameter(format!("target {} outside [0, 360)", angle)));
        }

        let mut registry = self.registry.lock().await;
        let entry = registry.get_mut(id)?;
        let link = entry.open_link()?;
        entry.cancel_listener().await;

        let report = motion::query_status(&mut **link.lock().await, &self.settings.timing).await?;
        let current = {
            let mut device = entry.state.lock().await;
            device.apply_status(&report);
            device.current_angle()
        };

        let delta = shortest_delta(current, angle);
        if delta == 0.0 {
            log::debug!("Already at {} degrees", angle);
            return Ok(());
        }

        log::debug!("Moving from {} by {} to {}", current, delta, angle);
        self.start_move(entry, delta, Some(angle)).await
    }

    async fn start_move(&self, entry: &mut DeviceEntry, angle: f64, target_position: Option<f64>) -> Result<()> {
        let link = entry.open_link()?;
        let timing = &self.settings.timing;

        let command = {
            let mut device = entry.state.lock().await;
            let command = move_command(&device, angle)?;
            device.plan_move(angle);
            device.target_position = target_position;
            command
        };

        // Let leftover frames arrive, then drop them
        sleep(timing.move_settle_delay()).await;
        let sent = {
            let mut port = link.lock().await;
            match port.clear(ClearBuffer::Input) {
                Ok(()) => motion::send_command(&mut **port, &command, timing).await,
                Err(e) => Err(e),
            }
        };

        let mut device = entry.state.lock().await;
        if let Err(e) = sent {
            device.halt();
            return Err(e.into());
        }
        device.moving = true;
        device.listener_active = true;
        drop(device);

        entry.listener = Some(MoveListener::spawn(entry.state.clone(), link, timing.clone()));
        Ok(())
    }

    /// Send the stop command and mark the rotator as resting.
    ///
    /// A moving rotator reports where it halted; that position is applied
    /// when it arrives within the frame timeout.
    pub async fn stop(&self, id: DeviceId) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let entry = registry.get_mut(id)?;
        let link = entry.open_link()?;
        entry.cancel_listener().await;

        let was_moving = entry.state.lock().await.moving;
        let timing = &self.settings.timing;
        let (sent, report) = {
            let mut port = link.lock().await;
            let sent = motion::send_command(&mut **port, &Command::Stop, timing).await;
            let report = match sent {
                Ok(()) if was_moving => Some(motion::await_stop_report(&mut **port, timing).await),
                _ => None,
            };
            (sent, report)
        };

        let mut device = entry.state.lock().await;
        match report {
            Some(Ok(report)) => {
                log::info!("Rotator halted at {:.3} degrees", report.mechanical_angle as f64 / 1000.0);
                device.last_rotated = report.rotated;
                device.set_mechanical_angle(report.mechanical_angle);
            }
            Some(Err(e)) => log::warn!("No position report after stop: {}", e),
            None => {}
        }
        device.halt();
        sent.map_err(DeviceError::from)
    }
}

/// Move command for `angle` including any overshoot, checked against the
/// rotator's resolution and the command range
fn move_command(device: &Device, angle: f64) -> Result<Command> {
    if device.steps_per_degree == 0 {
        return Err(DeviceError::InvalidState("rotator resolution unknown; open it first".to_string()));
    }
    Command::move_by(device.outbound_angle(angle), device.steps_per_degree)
        .map_err(|e| DeviceError::InvalidParameter(format!("cannot move by {} degrees: {}", angle, e)))
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
