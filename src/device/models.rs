use serde::{Deserialize, Serialize};

use crate::serial::protocol::{steps_per_degree_for_model, CompletionReport, StatusReport};

/// Small integer handle of a registered rotator
pub type DeviceId = u32;

/// Progress of a backlash-compensated move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OvershootPhase {
    #[default]
    None,
    /// Outbound move past the target has been sent
    OutboundSent,
    /// Return move back onto the target has been sent
    Returning,
}

/// What the completion task does after a move-finished report
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompletionAction {
    Settled,
    /// Send the return half of an overshoot by `angle` degrees
    Return { angle: f64 },
}

/// Host-side backlash overshoot settings
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OvershootSettings {
    pub enabled: bool,
    /// Degrees travelled past the target
    pub angle: f64,
    /// Overshoot against the direction of travel instead of along it
    pub reverse: bool,
}

/// Configuration view
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RotatorConfig {
    pub reverse_direction: bool,
    /// Degrees
    pub backlash: f64,
    pub overshoot: bool,
    pub overshoot_angle: f64,
    pub overshoot_direction: bool,
}

/// Partial configuration write; `None` fields are left untouched
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RotatorConfigUpdate {
    pub reverse_direction: Option<bool>,
    pub backlash: Option<f64>,
    pub overshoot: Option<bool>,
    pub overshoot_angle: Option<f64>,
    pub overshoot_direction: Option<bool>,
}

impl RotatorConfigUpdate {
    /// True if applying this update writes to the rotator
    pub fn touches_hardware(&self) -> bool {
        self.reverse_direction.is_some() || self.backlash.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RotatorStatus {
    /// Degrees
    pub position: f64,
    pub moving: bool,
    pub steps_per_revolution: u32,
    /// Degrees per step
    pub step_size: f64,
}

/// Progress of the current or last move
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionInfo {
    pub moving: bool,
    /// Set while a completion task is believed to be running
    pub listener_active: bool,
    pub overshoot_phase: OvershootPhase,
    /// Signed relative angle of the last move request
    pub target_angle: f64,
    /// Absolute target of the last `move_to`, `None` after a relative move
    pub target_position: Option<f64>,
    /// Angle the rotator reported for its last finished move
    pub last_rotated: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub firmware: u32,
    pub model: String,
}

/// In-memory record of one rotator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub port_name: String,
    pub model: String,
    pub firmware_version: u32,
    /// 0 until a status report with a known model has been applied
    pub steps_per_degree: u32,
    /// Degrees x 1000, as reported by the rotator
    pub mechanical_angle: i32,
    /// Last known position in degrees
    pub position: f64,
    /// Signed angle of the last requested move, before overshoot
    pub target_angle: f64,
    /// Absolute destination of the last `move_to`
    pub target_position: Option<f64>,
    /// Angle the rotator reported for its last finished move
    pub last_rotated: f64,
    /// Degrees x 10
    pub backlash_tenths: i32,
    pub reverse_direction: bool,
    pub overshoot: OvershootSettings,
    pub overshoot_phase: OvershootPhase,
    /// Return angle of the overshoot in progress
    pub overshoot_return: f64,
    pub moving: bool,
    pub listener_active: bool,
}

impl Device {
    pub fn new(id: DeviceId, port_name: String) -> Self {
        Self {
            id,
            port_name,
            model: String::new(),
            firmware_version: 0,
            steps_per_degree: 0,
            mechanical_angle: 0,
            position: 0.0,
            target_angle: 0.0,
            target_position: None,
            last_rotated: 0.0,
            backlash_tenths: 0,
            reverse_direction: false,
            overshoot: OvershootSettings::default(),
            overshoot_phase: OvershootPhase::None,
            overshoot_return: 0.0,
            moving: false,
            listener_active: false,
        }
    }

    /// Apply a complete status report
    pub fn apply_status(&mut self, report: &StatusReport) {
        self.model = report.model.clone();
        self.firmware_version = report.firmware_version;
        self.backlash_tenths = report.backlash_tenths;
        self.reverse_direction = report.reverse_direction;
        self.set_mechanical_angle(report.mechanical_angle);

        match steps_per_degree_for_model(&report.model) {
            Some(steps) => self.steps_per_degree = steps,
            None => log::warn!(
                "Unknown rotator model '{}', keeping {} steps per degree",
                report.model,
                self.steps_per_degree
            ),
        }
    }

    pub fn set_mechanical_angle(&mut self, milli_degrees: i32) {
        self.mechanical_angle = milli_degrees;
        self.position = milli_degrees as f64 / 1000.0;
    }

    /// Current angle as reported by the hardware, in degrees
    pub fn current_angle(&self) -> f64 {
        self.mechanical_angle as f64 / 1000.0
    }

    /// Record a relative move of `angle` degrees and return the angle to send.
    ///
    /// With overshoot enabled the outbound angle travels past the target and
    /// the phase becomes [`OvershootPhase::OutboundSent`].
    pub fn plan_move(&mut self, angle: f64) -> f64 {
        self.target_angle = angle;

        let extra = self.overshoot_extra(angle);
        if extra != 0.0 {
            self.overshoot_return = -extra;
            self.overshoot_phase = OvershootPhase::OutboundSent;
        } else {
            self.overshoot_return = 0.0;
            self.overshoot_phase = OvershootPhase::None;
        }
        angle + extra
    }

    /// Angle [`plan_move`](Self::plan_move) would send for `angle`, without
    /// recording anything
    pub fn outbound_angle(&self, angle: f64) -> f64 {
        angle + self.overshoot_extra(angle)
    }

    fn overshoot_extra(&self, angle: f64) -> f64 {
        if self.overshoot.enabled && self.overshoot.angle > 0.0 && angle != 0.0 {
            let direction = if self.overshoot.reverse { -angle.signum() } else { angle.signum() };
            direction * self.overshoot.angle
        } else {
            0.0
        }
    }

    /// Advance the motion state machine after a move-finished report
    pub fn complete_move(&mut self, report: &CompletionReport) -> CompletionAction {
        self.last_rotated = report.rotated;
        self.set_mechanical_angle(report.mechanical_angle);

        match self.overshoot_phase {
            OvershootPhase::OutboundSent => {
                self.overshoot_phase = OvershootPhase::Returning;
                CompletionAction::Return { angle: self.overshoot_return }
            }
            OvershootPhase::Returning => {
                self.overshoot_phase = OvershootPhase::None;
                self.moving = false;
                CompletionAction::Settled
            }
            OvershootPhase::None => {
                self.moving = false;
                CompletionAction::Settled
            }
        }
    }

    /// Back to rest: no motion, no overshoot in progress
    pub fn halt(&mut self) {
        self.moving = false;
        self.overshoot_phase = OvershootPhase::None;
        self.overshoot_return = 0.0;
    }

    pub fn status(&self) -> RotatorStatus {
        let step_size = if self.steps_per_degree > 0 {
            1.0 / self.steps_per_degree as f64
        } else {
            0.0
        };
        RotatorStatus {
            position: self.position,
            moving: self.moving,
            steps_per_revolution: self.steps_per_degree * 360,
            step_size,
        }
    }

    pub fn config(&self) -> RotatorConfig {
        RotatorConfig {
            reverse_direction: self.reverse_direction,
            backlash: self.backlash_tenths as f64 / 10.0,
            overshoot: self.overshoot.enabled,
            overshoot_angle: self.overshoot.angle,
            overshoot_direction: self.overshoot.reverse,
        }
    }

    pub fn motion(&self) -> MotionInfo {
        MotionInfo {
            moving: self.moving,
            listener_active: self.listener_active,
            overshoot_phase: self.overshoot_phase,
            target_angle: self.target_angle,
            target_position: self.target_position,
            last_rotated: self.last_rotated,
        }
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            firmware: self.firmware_version,
            model: self.model.clone(),
        }
    }
}

/// Shortest signed rotation from `current` to `target`, in (-180, 180]
pub fn shortest_delta(current: f64, target: f64) -> f64 {
    let delta = (target - current + 180.0).rem_euclid(360.0) - 180.0;
    if delta <= -180.0 {
        delta + 360.0
    } else {
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_report(model: &str) -> StatusReport {
        StatusReport {
            model: model.to_string(),
            firmware_version: 20240101,
            mechanical_angle: 45_500,
            backlash_tenths: 25,
            reverse_direction: true,
        }
    }

    fn report(mechanical_angle: i32) -> CompletionReport {
        CompletionReport { rotated: 0.0, mechanical_angle }
    }

    #[test]
    fn test_shortest_delta_range_and_congruence() {
        let mut current = 0.0;
        while current < 360.0 {
            let mut target = 0.0;
            while target < 360.0 {
                let delta = shortest_delta(current, target);
                assert!(delta > -180.0 && delta <= 180.0, "delta {} out of range", delta);
                let landed = (current + delta).rem_euclid(360.0);
                let error = (landed - target).abs();
                assert!(error < 1e-9 || (360.0 - error) < 1e-9, "{} + {} != {}", current, delta, target);
                target += 7.5;
            }
            current += 12.25;
        }
    }

    #[test]
    fn test_shortest_delta_edges() {
        assert_eq!(shortest_delta(90.0, 90.0), 0.0);
        assert_eq!(shortest_delta(0.0, 180.0), 180.0);
        assert_eq!(shortest_delta(180.0, 0.0), 180.0);
        assert_eq!(shortest_delta(350.0, 10.0), 20.0);
        assert_eq!(shortest_delta(10.0, 350.0), -20.0);
    }

    #[test]
    fn test_apply_status_derives_resolution() {
        let mut device = Device::new(0, "/dev/ttyUSB0".to_string());
        assert_eq!(device.status().steps_per_revolution, 0);

        device.apply_status(&status_report("Lite V2"));
        assert_eq!(device.steps_per_degree, 1199);
        assert_eq!(device.position, 45.5);
        assert_eq!(device.config().backlash, 2.5);
        assert!(device.config().reverse_direction);

        let status = device.status();
        assert_eq!(status.steps_per_revolution, 1199 * 360);
        assert!((status.step_size - 1.0 / 1199.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_keeps_resolution() {
        let mut device = Device::new(0, "/dev/ttyUSB0".to_string());
        device.apply_status(&status_report("Mini"));
        device.apply_status(&status_report("Max"));
        assert_eq!(device.steps_per_degree, 1142);
        assert_eq!(device.model, "Max");
    }

    #[test]
    fn test_plain_move_settles_after_one_report() {
        let mut device = Device::new(0, "p".to_string());
        assert_eq!(device.plan_move(30.0), 30.0);
        device.moving = true;

        assert_eq!(device.complete_move(&report(30_000)), CompletionAction::Settled);
        assert!(!device.moving);
        assert_eq!(device.position, 30.0);
    }

    #[test]
    fn test_overshoot_phases() {
        let mut device = Device::new(0, "p".to_string());
        device.overshoot = OvershootSettings { enabled: true, angle: 2.0, reverse: false };

        assert_eq!(device.plan_move(30.0), 32.0);
        assert_eq!(device.overshoot_phase, OvershootPhase::OutboundSent);
        device.moving = true;

        let action = device.complete_move(&report(32_000));
        assert_eq!(action, CompletionAction::Return { angle: -2.0 });
        assert_eq!(device.overshoot_phase, OvershootPhase::Returning);
        assert!(device.moving);

        assert_eq!(device.complete_move(&report(30_000)), CompletionAction::Settled);
        assert_eq!(device.overshoot_phase, OvershootPhase::None);
        assert!(!device.moving);
    }

    #[test]
    fn test_overshoot_negative_and_reversed() {
        let mut device = Device::new(0, "p".to_string());
        device.overshoot = OvershootSettings { enabled: true, angle: 1.5, reverse: false };
        assert_eq!(device.plan_move(-10.0), -11.5);
        assert_eq!(device.overshoot_return, 1.5);

        device.overshoot.reverse = true;
        assert_eq!(device.outbound_angle(-10.0), -8.5);
        assert_eq!(device.overshoot_phase, OvershootPhase::OutboundSent);
        assert_eq!(device.plan_move(-10.0), -8.5);
        assert_eq!(device.overshoot_return, -1.5);
    }

    #[test]
    fn test_motion_view() {
        let mut device = Device::new(0, "p".to_string());
        device.target_position = Some(45.0);
        device.plan_move(-15.0);
        device.moving = true;
        device.listener_active = true;
        device.complete_move(&CompletionReport { rotated: -15.0, mechanical_angle: 345_000 });

        let motion = device.motion();
        assert!(!motion.moving);
        assert!(motion.listener_active);
        assert_eq!(motion.target_angle, -15.0);
        assert_eq!(motion.target_position, Some(45.0));
        assert_eq!(motion.last_rotated, -15.0);
        assert_eq!(motion.overshoot_phase, OvershootPhase::None);
    }

    #[test]
    fn test_halt_clears_overshoot() {
        let mut device = Device::new(0, "p".to_string());
        device.overshoot = OvershootSettings { enabled: true, angle: 1.0, reverse: false };
        device.plan_move(5.0);
        device.moving = true;
        device.halt();
        assert!(!device.moving);
        assert_eq!(device.overshoot_phase, OvershootPhase::None);
    }
}
