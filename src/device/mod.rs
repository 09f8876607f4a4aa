//! Hardware side of dispensing: one [`DeviceController`] call releases at
//! most one unit.

pub mod cycle;
pub mod protocol;
mod serial;
mod simulated;

pub use cycle::{CycleError, CycleState, UnitCycle};
pub use protocol::{Command, Direction, FrameCodec, Token};
pub use serial::{SerialDeviceController, SerialPort};
pub use simulated::{SimLog, SimStep, SimulatedDeviceController};

use std::io;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DeviceConfig;
use crate::model::SlotId;

/// Per-stage timeouts for a unit cycle. All are mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    /// `INIT` → `READY`.
    pub ready: Duration,
    /// `MOTOR` → `ACK`.
    pub motor_ack: Duration,
    /// `ACK` → `DROP`.
    pub sensor_confirm: Duration,
    /// `DROP` → `DONE`.
    pub cycle_complete: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(3),
            motor_ack: Duration::from_secs(2),
            sensor_confirm: Duration::from_secs(8),
            cycle_complete: Duration::from_secs(5),
        }
    }
}

impl StageTimeouts {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.ready.is_zero() {
            return Err("ready timeout must be non-zero");
        }
        if self.motor_ack.is_zero() {
            return Err("motor ack timeout must be non-zero");
        }
        if self.sensor_confirm.is_zero() {
            return Err("sensor confirm timeout must be non-zero");
        }
        if self.cycle_complete.is_zero() {
            return Err("cycle complete timeout must be non-zero");
        }
        Ok(())
    }
}

/// A unit that left the machine, with the states it went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub slot_id: SlotId,
    pub trace: Vec<CycleState>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("slot {slot_id}: {error}")]
pub struct CycleFailure {
    pub slot_id: SlotId,
    #[source]
    pub error: CycleError,
    pub trace: Vec<CycleState>,
}

/// Owner of the hardware handle. Implementations are driven by one caller at
/// a time (the dispense service holds them behind a mutex).
#[async_trait]
pub trait DeviceController: Send {
    fn name(&self) -> &'static str;

    /// Bring the session up (`INIT`/`READY`) if it is not already. Called
    /// before the first motor command of a request.
    async fn prepare(&mut self) -> Result<(), CycleError>;

    /// Run exactly one unit cycle on `slot_id`.
    async fn dispense_unit(&mut self, slot_id: &SlotId) -> Result<CycleReport, CycleFailure>;

    /// Called once per request after the last cycle.
    async fn finish(&mut self) {}
}

/// Open the configured transport. The returned controller owns the handle.
pub async fn connect(
    config: &DeviceConfig,
    timeouts: StageTimeouts,
    direction: Direction,
) -> io::Result<Box<dyn DeviceController>> {
    let device: Box<dyn DeviceController> = match config {
        DeviceConfig::Simulated { script } => {
            Box::new(SimulatedDeviceController::new(timeouts, direction).with_script(script.iter().copied()))
        }
        DeviceConfig::Serial { path } => {
            let port = SerialPort::open(path).await?;
            Box::new(SerialDeviceController::new(port, timeouts, direction))
        }
        DeviceConfig::Tcp { addr } => {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Box::new(SerialDeviceController::new(stream, timeouts, direction))
        }
    };
    tracing::info!(device = device.name(), "device connected");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeouts_rejected() {
        assert!(StageTimeouts::default().validate().is_ok());
        let t = StageTimeouts { motor_ack: Duration::ZERO, ..Default::default() };
        assert!(t.validate().is_err());
    }
}
