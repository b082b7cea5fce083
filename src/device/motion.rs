//! Handshake, status query and move-completion handling.
//!
//! After a move command the rotator stays silent until the motor stops, then
//! reports the angle it rotated and its new mechanical angle. A
//! [`MoveListener`] waits for those frames in the background and, for
//! backlash-compensated moves, sends the return half of the overshoot.

use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::models::{CompletionAction, Device};
use crate::config::TimingConfig;
use crate::serial::protocol::{self, Command, CompletionReport, StatusReport, FRAME_BUFFER_LEN, FRAME_DELIMITER};
use crate::serial::{ClearBuffer, Result, SerialError, SerialPortIO};

/// Line shared between foreground calls and the completion task
pub type SharedLink = Arc<Mutex<Box<dyn SerialPortIO>>>;

fn ensure_open(link: &dyn SerialPortIO) -> Result<()> {
    if link.is_open() {
        Ok(())
    } else {
        Err(SerialError::ConnectionFailed("Port not open".to_string()))
    }
}

/// Write `command` after the pacing delay; the response is not read
pub async fn send_command(link: &mut dyn SerialPortIO, command: &Command, timing: &TimingConfig) -> Result<()> {
    ensure_open(link)?;
    sleep(timing.command_delay()).await;

    let text = command.encode()?;
    log::debug!("Sending command {}", command);
    link.send_data(text.as_bytes()).await
}

/// Read one frame; an empty read is a timeout
async fn read_frame(link: &mut dyn SerialPortIO, timeout_ms: u64, field: &str) -> Result<Vec<u8>> {
    let frame = link.read_until(FRAME_BUFFER_LEN, FRAME_DELIMITER, timeout_ms).await?;
    if frame.is_empty() {
        log::debug!("Timeout reading {} from rotator", field);
        return Err(SerialError::Timeout);
    }
    log::debug!("Read {} frame {:?}", field, String::from_utf8_lossy(&frame));
    Ok(frame)
}

/// Confirm the line hosts a Wanderer rotator.
///
/// Returns the number of attempts it took.
pub async fn handshake(link: &mut dyn SerialPortIO, timing: &TimingConfig) -> Result<u32> {
    ensure_open(link)?;
    sleep(timing.command_delay()).await;

    let request = Command::Handshake.encode()?;
    for attempt in 1..=timing.handshake_attempts {
        link.clear(ClearBuffer::All)?;
        link.send_data(request.as_bytes()).await?;

        // A failed read counts as an unanswered probe
        let frame = match link
            .read_until(FRAME_BUFFER_LEN, FRAME_DELIMITER, timing.frame_timeout_ms)
            .await
        {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Handshake attempt {} read failed: {}", attempt, e);
                Vec::new()
            }
        };
        if protocol::is_handshake_reply(&frame) {
            log::info!("Rotator answered handshake after {} attempt(s)", attempt);
            return Ok(attempt);
        }

        log::debug!("Handshake attempt {} got {:?}", attempt, String::from_utf8_lossy(&frame));
        sleep(timing.handshake_retry_delay()).await;
    }

    log::debug!("Handshake timed out after {} attempts", timing.handshake_attempts);
    Err(SerialError::HandshakeFailed(timing.handshake_attempts))
}

/// Request and decode the five-frame status report
pub async fn query_status(link: &mut dyn SerialPortIO, timing: &TimingConfig) -> Result<StatusReport> {
    ensure_open(link)?;
    sleep(timing.command_delay()).await;

    link.clear(ClearBuffer::All)?;
    link.send_data(Command::Handshake.encode()?.as_bytes()).await?;

    let timeout = timing.frame_timeout_ms;
    let model = protocol::parse_model(&read_frame(link, timeout, "model").await?)?;
    let firmware_version = protocol::parse_int(&read_frame(link, timeout, "firmware").await?)?;
    let mechanical_angle = protocol::parse_int(&read_frame(link, timeout, "position").await?)?;
    let backlash_tenths = protocol::parse_backlash(&read_frame(link, timeout, "backlash").await?)?;
    let reverse_direction = protocol::parse_flag(&read_frame(link, timeout, "reverse state").await?)?;

    Ok(StatusReport {
        model,
        firmware_version,
        mechanical_angle,
        backlash_tenths,
        reverse_direction,
    })
}

async fn read_completion(link: &mut dyn SerialPortIO, first_timeout_ms: u64, timing: &TimingConfig) -> Result<CompletionReport> {
    ensure_open(link)?;

    let rotated = protocol::parse_float(&read_frame(link, first_timeout_ms, "rotated angle").await?)?;
    let mechanical_angle = protocol::parse_int(&read_frame(link, timing.frame_timeout_ms, "position").await?)?;

    Ok(CompletionReport { rotated, mechanical_angle })
}

/// Wait for the two move-finished frames
pub async fn await_completion(link: &mut dyn SerialPortIO, timing: &TimingConfig) -> Result<CompletionReport> {
    read_completion(link, timing.move_timeout_ms, timing).await
}

/// Read the report a halted rotator sends after the stop command
pub async fn await_stop_report(link: &mut dyn SerialPortIO, timing: &TimingConfig) -> Result<CompletionReport> {
    read_completion(link, timing.frame_timeout_ms, timing).await
}

/// Background completion task owned by a device
pub struct MoveListener {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MoveListener {
    pub fn spawn(device: Arc<Mutex<Device>>, link: SharedLink, timing: TimingConfig) -> Self {
        let (cancel, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(run_listener(device, link, timing, cancel_rx));
        log::debug!("Move listener started");
        Self { cancel, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the task, interrupting a pending read, and wait for it to exit
    pub async fn cancel(self) {
        let _ = self.cancel.send(());
        if let Err(e) = self.handle.await {
            log::warn!("Move listener ended abnormally: {}", e);
        }
    }
}

async fn run_listener(
    device: Arc<Mutex<Device>>,
    link: SharedLink,
    timing: TimingConfig,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        let outcome = tokio::select! {
            _ = &mut cancel_rx => {
                log::debug!("Move listener cancelled");
                break;
            }
            outcome = async {
                let mut port = link.lock().await;
                await_completion(&mut **port, &timing).await
            } => outcome,
        };

        // A timed out or garbled report leaves the motion flag as it is
        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Move listener abandoned: {}", e);
                break;
            }
        };

        let action = device.lock().await.complete_move(&report);
        let angle = match action {
            CompletionAction::Settled => {
                log::info!("Move complete at {:.3} degrees", report.mechanical_angle as f64 / 1000.0);
                break;
            }
            CompletionAction::Return { angle } => angle,
        };

        log::info!("Backlash compensation: returning from overshoot by {:.2} degrees", angle);
        tokio::select! {
            _ = &mut cancel_rx => {
                log::debug!("Move listener cancelled before return move");
                break;
            }
            _ = sleep(timing.overshoot_return_delay()) => {}
        }

        let steps_per_degree = device.lock().await.steps_per_degree;
        let sent = match Command::move_by(angle, steps_per_degree) {
            Ok(command) => {
                let mut port = link.lock().await;
                match port.clear(ClearBuffer::Input) {
                    Ok(()) => send_command(&mut **port, &command, &timing).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            log::error!("Failed to send return movement command: {}", e);
            device.lock().await.halt();
            break;
        }
    }

    device.lock().await.listener_active = false;
}
