//! Wanderer rotator wire protocol.
//!
//! Requests are plain ASCII decimal tokens. Every response field is a short
//! ASCII payload terminated by the byte `'A'`.

use std::fmt;
use serde::{Deserialize, Serialize};

use super::{Result, SerialError};

pub const FRAME_DELIMITER: u8 = b'A';
pub const FRAME_BUFFER_LEN: usize = 32;
pub const MODEL_TAG: &str = "WandererRotator";

pub const HANDSHAKE_COMMAND: &str = "1500001\n";
pub const SYNC_ZERO_COMMAND: &str = "1500002";
pub const STOP_COMMAND: &str = "stop";

const MOVE_BASE: i64 = 1_000_000;
/// Largest step count a relative move can carry without colliding with the
/// other command codes
pub const MAX_MOVE_STEPS: i64 = 499_999;
const BACKLASH_BASE: i64 = 1_600_000;

/// Outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Identification probe; also requests the full status report
    Handshake,
    SyncZero,
    Stop,
    /// Relative move by a signed number of motor steps
    MoveRelative { steps: i64 },
    SetBacklash { tenths: i64 },
    SetReverse(bool),
}

impl Command {
    /// Relative move by `angle` degrees on a rotator with `steps_per_degree`.
    ///
    /// Fails when the step count does not fit in the move command.
    pub fn move_by(angle: f64, steps_per_degree: u32) -> Result<Self> {
        let steps = (angle * steps_per_degree as f64).round();
        if !steps.is_finite() || steps.abs() > MAX_MOVE_STEPS as f64 {
            return Err(SerialError::ProtocolError(format!(
                "Move of {} degrees exceeds {} steps",
                angle, MAX_MOVE_STEPS
            )));
        }
        Ok(Command::MoveRelative { steps: steps as i64 })
    }

    pub fn set_backlash(backlash: f64) -> Self {
        Command::SetBacklash {
            tenths: (backlash * 10.0).round() as i64,
        }
    }

    /// Text written to the line
    pub fn encode(&self) -> Result<String> {
        let text = match self {
            Command::Handshake => HANDSHAKE_COMMAND.to_string(),
            Command::SyncZero => SYNC_ZERO_COMMAND.to_string(),
            Command::Stop => STOP_COMMAND.to_string(),
            Command::MoveRelative { steps } => {
                MOVE_BASE
                    .checked_add(*steps)
                    .filter(|_| (-MAX_MOVE_STEPS..=MAX_MOVE_STEPS).contains(steps))
                    .ok_or_else(|| SerialError::ProtocolError(format!("Move of {} steps out of range", steps)))?
                    .to_string()
            }
            Command::SetBacklash { tenths } => {
                let value = BACKLASH_BASE
                    .checked_add(*tenths)
                    .filter(|value| (BACKLASH_BASE..BACKLASH_BASE + 100_000).contains(value))
                    .ok_or_else(|| SerialError::ProtocolError(format!("Backlash of {} tenths out of range", tenths)))?;
                format!("{}\n", value)
            }
            Command::SetReverse(reverse) => reverse_direction_to_command(*reverse).to_string(),
        };
        Ok(text)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(text) => write!(f, "{}", text.trim_end()),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Numeric value of the set-backlash command for `backlash` degrees
pub fn backlash_to_command(backlash: f64) -> i64 {
    ((backlash * 10.0).round() as i64).saturating_add(BACKLASH_BASE)
}

pub fn reverse_direction_to_command(reverse: bool) -> &'static str {
    if reverse {
        "1700001\n"
    } else {
        "1700000\n"
    }
}

/// Motor resolution for a model suffix, `None` for unknown models
pub fn steps_per_degree_for_model(model: &str) -> Option<u32> {
    if model.contains("Mini") {
        Some(1142)
    } else if model.contains("Lite") {
        if model.contains("V2") {
            Some(1199)
        } else {
            Some(1155)
        }
    } else {
        None
    }
}

/// Full status report, in wire order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub model: String,
    pub firmware_version: u32,
    /// Degrees x 1000
    pub mechanical_angle: i32,
    /// Degrees x 10
    pub backlash_tenths: i32,
    pub reverse_direction: bool,
}

/// Frames sent by the rotator once a move has finished
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub rotated: f64,
    pub mechanical_angle: i32,
}

/// Payload of a raw frame with the trailing delimiter removed
pub fn frame_payload(frame: &[u8]) -> Result<&str> {
    let body = match frame.split_last() {
        Some((&FRAME_DELIMITER, body)) => body,
        _ => frame,
    };
    std::str::from_utf8(body)
        .map(str::trim)
        .map_err(|_| SerialError::ProtocolError(format!("Non-ASCII frame: {:?}", frame)))
}

/// True if `frame` identifies a Wanderer rotator
pub fn is_handshake_reply(frame: &[u8]) -> bool {
    String::from_utf8_lossy(frame).contains(MODEL_TAG)
}

/// Model suffix from the identification frame, e.g. `"Lite V2"`
pub fn parse_model(frame: &[u8]) -> Result<String> {
    let payload = frame_payload(frame)?;
    let model = payload
        .strip_prefix(MODEL_TAG)
        .ok_or_else(|| SerialError::ProtocolError(format!("Invalid model frame: {}", payload)))?;
    if model.is_empty() {
        return Err(SerialError::ProtocolError("Missing model name".to_string()));
    }
    Ok(model.to_string())
}

pub fn parse_int<T: std::str::FromStr>(frame: &[u8]) -> Result<T> {
    let payload = frame_payload(frame)?;
    payload
        .parse()
        .map_err(|_| SerialError::ProtocolError(format!("Invalid integer frame: {}", payload)))
}

pub fn parse_float(frame: &[u8]) -> Result<f64> {
    let payload = frame_payload(frame)?;
    payload
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| SerialError::ProtocolError(format!("Invalid number frame: {}", payload)))
}

pub fn parse_flag(frame: &[u8]) -> Result<bool> {
    Ok(parse_int::<i32>(frame)? != 0)
}

/// Backlash frame (degrees, fractional) as tenths of a degree
pub fn parse_backlash(frame: &[u8]) -> Result<i32> {
    Ok((parse_float(frame)? * 10.0).round() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlash_command_values() {
        assert_eq!(backlash_to_command(2.5), 1600025);
        assert_eq!(backlash_to_command(0.0), 1600000);
        assert_eq!(Command::set_backlash(2.5).encode().unwrap(), "1600025\n");
        assert!(Command::set_backlash(-1.0).encode().is_err());
    }

    #[test]
    fn test_reverse_direction_commands() {
        assert_eq!(reverse_direction_to_command(false), "1700000\n");
        assert_eq!(reverse_direction_to_command(true), "1700001\n");
        assert_eq!(Command::SetReverse(true).encode().unwrap(), "1700001\n");
    }

    #[test]
    fn test_move_command_encoding() {
        assert_eq!(Command::move_by(10.0, 1199).unwrap().encode().unwrap(), "1011990");
        assert_eq!(Command::move_by(-10.0, 1199).unwrap().encode().unwrap(), "988010");
        assert_eq!(Command::move_by(90.0, 1142).unwrap(), Command::MoveRelative { steps: 102780 });
        assert_eq!(Command::Stop.encode().unwrap(), "stop");
        assert_eq!(Command::SyncZero.encode().unwrap(), "1500002");
        assert_eq!(Command::Handshake.encode().unwrap(), "1500001\n");
    }

    #[test]
    fn test_move_range_stays_clear_of_other_codes() {
        // 525.4 degrees on a Mini would encode as the backlash code 1600007
        assert!(Command::move_by(525.4, 1142).is_err());
        assert!(Command::move_by(-525.4, 1142).is_err());
        assert!(Command::move_by(1e300, 1142).is_err());
        assert!(Command::move_by(f64::NAN, 1142).is_err());

        let widest = Command::move_by(437.0, 1142).unwrap();
        assert_eq!(widest.encode().unwrap(), "1499054");
        assert_eq!(Command::MoveRelative { steps: -499_999 }.encode().unwrap(), "500001");
        assert!(Command::MoveRelative { steps: 500_000 }.encode().is_err());
        assert!(Command::MoveRelative { steps: i64::MAX }.encode().is_err());
        assert!(Command::MoveRelative { steps: i64::MIN }.encode().is_err());
    }

    #[test]
    fn test_steps_per_degree_by_model() {
        assert_eq!(steps_per_degree_for_model("Lite V2"), Some(1199));
        assert_eq!(steps_per_degree_for_model("Lite"), Some(1155));
        assert_eq!(steps_per_degree_for_model("Mini"), Some(1142));
        assert_eq!(steps_per_degree_for_model("Pro"), None);
    }

    #[test]
    fn test_parse_status_frames() {
        assert_eq!(parse_model(b"WandererRotatorLiteV2A").unwrap(), "LiteV2");
        assert!(parse_model(b"WandererRotatorA").is_err());
        assert!(parse_model(b"SomethingElseA").is_err());
        assert_eq!(parse_int::<u32>(b"20240101A").unwrap(), 20240101);
        assert_eq!(parse_int::<i32>(b"-12500A").unwrap(), -12500);
        assert_eq!(parse_backlash(b"2.5A").unwrap(), 25);
        assert!(parse_flag(b"1A").unwrap());
        assert!(!parse_flag(b"0A").unwrap());
        assert!(parse_int::<i32>(b"A").is_err());
        assert!(parse_float(b"abcA").is_err());
    }

    #[test]
    fn test_handshake_reply_detection() {
        assert!(is_handshake_reply(b"WandererRotatorMiniA"));
        assert!(is_handshake_reply(b"\x00noiseWandererRotatorLiteA"));
        assert!(!is_handshake_reply(b""));
        assert!(!is_handshake_reply(b"1500001A"));
    }
}
