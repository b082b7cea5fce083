//! In-memory Wanderer rotator.
//!
//! Answers the wire protocol the way the firmware does, so the device layer
//! can be exercised without hardware. Reads honour the tokio clock, which lets
//! tests run the long protocol timeouts under a paused runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use serialport::ClearBuffer;
use tokio::time::{sleep, Instant};

use super::protocol::{self, MODEL_TAG};
use super::{PortConnector, Result, SerialError, SerialPortIO};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const FULL_TURN_MILLI: i64 = 360_000;

struct SimState {
    open: bool,
    model: String,
    firmware: u32,
    mechanical_angle: i32,
    backlash_tenths: i32,
    reverse: bool,
    rx: VecDeque<u8>,
    held: VecDeque<u8>,
    writes: Vec<String>,
    write_times: Vec<Instant>,
    silent: bool,
    status_frame_limit: Option<usize>,
    hold_moves: bool,
    failing_reads: u32,
}

impl SimState {
    fn push_frame(&mut self, payload: &str) {
        self.rx.extend(payload.bytes());
        self.rx.push_back(protocol::FRAME_DELIMITER);
    }

    fn status_frames(&self) -> Vec<String> {
        vec![
            format!("{}{}", MODEL_TAG, self.model),
            self.firmware.to_string(),
            self.mechanical_angle.to_string(),
            format!("{:.1}", self.backlash_tenths as f64 / 10.0),
            if self.reverse { "1" } else { "0" }.to_string(),
        ]
    }

    fn handle(&mut self, command: &str) {
        let token = command.trim();
        if token == protocol::STOP_COMMAND {
            // The halted motor reports the move it was running
            let held: Vec<u8> = self.held.drain(..).collect();
            self.rx.extend(held);
            return;
        }
        let value: i64 = match token.parse() {
            Ok(value) => value,
            Err(_) => return,
        };

        match value {
            1_500_001 => {
                if self.silent {
                    return;
                }
                let limit = self.status_frame_limit.unwrap_or(usize::MAX);
                for frame in self.status_frames().into_iter().take(limit) {
                    self.push_frame(&frame);
                }
            }
            1_500_002 => self.mechanical_angle = 0,
            1_700_000 => self.reverse = false,
            1_700_001 => self.reverse = true,
            v if (1_600_000..1_700_000).contains(&v) => self.backlash_tenths = (v - 1_600_000) as i32,
            v if (0..1_500_000).contains(&v) => self.rotate(v - 1_000_000),
            _ => {}
        }
    }

    fn rotate(&mut self, steps: i64) {
        let steps_per_degree = protocol::steps_per_degree_for_model(&self.model).unwrap_or(1142) as f64;
        let degrees = steps as f64 / steps_per_degree;
        let milli = self.mechanical_angle as i64 + (degrees * 1000.0).round() as i64;
        self.mechanical_angle = milli.rem_euclid(FULL_TURN_MILLI) as i32;

        if self.silent {
            return;
        }
        let frames = format!("{:.2}A{}A", degrees, self.mechanical_angle);
        if self.hold_moves {
            self.held.extend(frames.bytes());
        } else {
            self.rx.extend(frames.bytes());
        }
    }
}

/// Simulated rotator line. Clones share the same device.
#[derive(Clone)]
pub struct SimulatedRotator {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRotator {
    /// Rotator reporting `WandererRotator{model}`, e.g. `"Mini"`
    pub fn new(model: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                open: true,
                model: model.to_string(),
                firmware: 20240101,
                mechanical_angle: 0,
                backlash_tenths: 0,
                reverse: false,
                rx: VecDeque::new(),
                held: VecDeque::new(),
                writes: Vec::new(),
                write_times: Vec::new(),
                silent: false,
                status_frame_limit: None,
                hold_moves: false,
                failing_reads: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_firmware(self, firmware: u32) -> Self {
        self.state().firmware = firmware;
        self
    }

    /// Start at `degrees`
    pub fn with_angle(self, degrees: f64) -> Self {
        self.state().mechanical_angle = (degrees * 1000.0).round() as i32;
        self
    }

    pub fn with_backlash(self, backlash: f64) -> Self {
        self.state().backlash_tenths = (backlash * 10.0).round() as i32;
        self
    }

    /// Never answer anything
    pub fn silent(self) -> Self {
        self.state().silent = true;
        self
    }

    /// Stop a status report after `frames` frames
    pub fn truncate_status_after(self, frames: usize) -> Self {
        self.state().status_frame_limit = Some(frames);
        self
    }

    /// Keep move-finished frames back until [`release_move_completions`](Self::release_move_completions)
    pub fn hold_move_completions(self) -> Self {
        self.state().hold_moves = true;
        self
    }

    /// Make the next `count` reads fail with an I/O error
    pub fn fail_reads(self, count: u32) -> Self {
        self.state().failing_reads = count;
        self
    }

    /// Drop the line as if the cable were pulled
    pub fn unplug(&self) {
        self.state().open = false;
    }

    /// Deliver every held move-finished frame
    pub fn release_move_completions(&self) {
        let mut state = self.state();
        let held: Vec<u8> = state.held.drain(..).collect();
        state.rx.extend(held);
    }

    /// Queue a raw frame, delimiter appended
    pub fn push_frame(&self, payload: &str) {
        self.state().push_frame(payload);
    }

    /// Every write so far, as text
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    pub fn write_times(&self) -> Vec<Instant> {
        self.state().write_times.clone()
    }

    /// Writes that were relative move commands, as signed step counts
    pub fn move_steps(&self) -> Vec<i64> {
        self.writes()
            .iter()
            .filter_map(|w| w.trim().parse::<i64>().ok())
            .filter(|v| (0..1_500_000).contains(v))
            .map(|v| v - 1_000_000)
            .collect()
    }

    /// Degrees x 1000
    pub fn mechanical_angle(&self) -> i32 {
        self.state().mechanical_angle
    }

    pub fn backlash_tenths(&self) -> i32 {
        self.state().backlash_tenths
    }

    pub fn reverse(&self) -> bool {
        self.state().reverse
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    fn reopen(&self) {
        let mut state = self.state();
        state.open = true;
        state.rx.clear();
    }
}

#[async_trait::async_trait]
impl SerialPortIO for SimulatedRotator {
    fn is_open(&self) -> bool {
        SimulatedRotator::is_open(self)
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if !state.open {
            return Err(SerialError::ConnectionFailed("Port not open".to_string()));
        }
        let text = String::from_utf8_lossy(data).into_owned();
        state.writes.push(text.clone());
        state.write_times.push(Instant::now());
        state.handle(&text);
        Ok(())
    }

    async fn read_until(&mut self, max_len: usize, stop: u8, timeout_ms: u64) -> Result<Vec<u8>> {
        {
            let mut state = self.state();
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(SerialError::IoError(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "simulated read fault",
                )));
            }
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut frame = Vec::new();

        loop {
            {
                let mut state = self.state();
                while frame.len() + 1 < max_len {
                    match state.rx.pop_front() {
                        Some(byte) => {
                            frame.push(byte);
                            if byte == stop {
                                return Ok(frame);
                            }
                        }
                        None => break,
                    }
                }
            }
            if frame.len() + 1 >= max_len || Instant::now() >= deadline {
                return Ok(frame);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn clear(&mut self, buffer: ClearBuffer) -> Result<()> {
        if matches!(buffer, ClearBuffer::Input | ClearBuffer::All) {
            self.state().rx.clear();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }
}

/// Connector serving simulated rotators by port path
#[derive(Clone, Default)]
pub struct SimulatedBus {
    ports: Arc<Mutex<HashMap<String, SimulatedRotator>>>,
    order: Arc<Mutex<Vec<String>>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `rotator` at `path`
    pub fn add(&self, path: &str, rotator: SimulatedRotator) {
        let mut ports = self.ports.lock().unwrap_or_else(|p| p.into_inner());
        if ports.insert(path.to_string(), rotator).is_none() {
            self.order.lock().unwrap_or_else(|p| p.into_inner()).push(path.to_string());
        }
    }

    pub fn get(&self, path: &str) -> Option<SimulatedRotator> {
        self.ports.lock().unwrap_or_else(|p| p.into_inner()).get(path).cloned()
    }
}

impl PortConnector for SimulatedBus {
    fn candidate_ports(&self) -> Result<Vec<String>> {
        Ok(self.order.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn connect(&self, port_name: &str) -> Result<Box<dyn SerialPortIO>> {
        let rotator = self
            .get(port_name)
            .ok_or_else(|| SerialError::PortNotFound(port_name.to_string()))?;
        rotator.reopen();
        Ok(Box::new(rotator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_status_report_frames() {
        let mut sim = SimulatedRotator::new("Lite V2").with_angle(12.5).with_backlash(0.5);
        sim.send_data(b"1500001\n").await.unwrap();

        let model = sim.read_until(32, b'A', 100).await.unwrap();
        assert_eq!(model, b"WandererRotatorLite V2A");
        let firmware = sim.read_until(32, b'A', 100).await.unwrap();
        assert_eq!(firmware, b"20240101A");
        let angle = sim.read_until(32, b'A', 100).await.unwrap();
        assert_eq!(angle, b"12500A");
        let backlash = sim.read_until(32, b'A', 100).await.unwrap();
        assert_eq!(backlash, b"0.5A");
        let reverse = sim.read_until(32, b'A', 100).await.unwrap();
        assert_eq!(reverse, b"0A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_read_waits_for_deadline() {
        let mut sim = SimulatedRotator::new("Mini").silent();
        sim.send_data(b"1500001\n").await.unwrap();

        let start = Instant::now();
        let frame = sim.read_until(32, b'A', 3000).await.unwrap();
        assert!(frame.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_move_updates_position() {
        let mut sim = SimulatedRotator::new("Mini");
        sim.send_data(b"1102780").await.unwrap();
        assert_eq!(sim.mechanical_angle(), 90_000);
        assert_eq!(sim.move_steps(), vec![102_780]);

        let rotated = sim.read_until(32, b'A', 100).await.unwrap();
        assert_eq!(rotated, b"90.00A");

        sim.send_data(b"1500002").await.unwrap();
        assert_eq!(sim.mechanical_angle(), 0);
    }

    #[tokio::test]
    async fn test_stop_releases_held_report() {
        let mut sim = SimulatedRotator::new("Mini").hold_move_completions();
        sim.send_data(b"1034260").await.unwrap();
        assert!(sim.read_until(32, b'A', 100).await.unwrap().is_empty());

        sim.send_data(b"stop").await.unwrap();
        assert_eq!(sim.read_until(32, b'A', 100).await.unwrap(), b"30.00A");
        assert_eq!(sim.read_until(32, b'A', 100).await.unwrap(), b"30000A");
    }

    #[tokio::test]
    async fn test_failing_reads() {
        let mut sim = SimulatedRotator::new("Mini").fail_reads(1);
        sim.push_frame("1");
        assert!(sim.read_until(32, b'A', 100).await.is_err());
        assert_eq!(sim.read_until(32, b'A', 100).await.unwrap(), b"1A");
    }

    #[tokio::test]
    async fn test_closed_line_rejects_writes() {
        let mut sim = SimulatedRotator::new("Mini");
        sim.close();
        assert!(sim.send_data(b"stop").await.is_err());
    }
}
