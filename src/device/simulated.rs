use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::model::SlotId;

use super::cycle::{Action, CycleError, CycleState, UnitCycle};
use super::protocol::{Command, Direction, Token};
use super::{CycleFailure, CycleReport, DeviceController, StageTimeouts};

/// How the simulated firmware answers one motor command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimStep {
    #[default]
    Ok,
    /// Drops off the bus: the next `INIT` goes unanswered.
    NotReady,
    NoAck,
    /// `ACK`, then the sensor stays silent.
    NoDrop,
    /// `ACK`, `DROP`, then no `DONE`.
    NoDone,
    /// `ACK`, then silence; the `DROP` turns up ahead of `READY` on the
    /// next `INIT`.
    LateDrop,
    Garbage,
}

impl SimStep {
    fn replies(self) -> Vec<Token> {
        match self {
            SimStep::Ok => vec![Token::Accepted, Token::SensorActivated, Token::CycleComplete],
            SimStep::NoDrop | SimStep::LateDrop => vec![Token::Accepted],
            SimStep::NoDone => vec![Token::Accepted, Token::SensorActivated],
            SimStep::Garbage => vec![Token::Unknown("BZZT".into())],
            SimStep::NotReady | SimStep::NoAck => Vec::new(),
        }
    }

    /// Parse a comma-separated script such as `ok,no_ack,ok`.
    pub fn parse_script(s: &str) -> Result<Vec<SimStep>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for SimStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(SimStep::Ok),
            "not_ready" => Ok(SimStep::NotReady),
            "no_ack" => Ok(SimStep::NoAck),
            "no_drop" => Ok(SimStep::NoDrop),
            "no_done" => Ok(SimStep::NoDone),
            "late_drop" => Ok(SimStep::LateDrop),
            "garbage" => Ok(SimStep::Garbage),
            other => Err(format!("unknown simulator step: {other}")),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    script: VecDeque<SimStep>,
    unpowered: bool,
    commands: Vec<Command>,
    traces: Vec<Vec<CycleState>>,
}

/// Shared view into a [`SimulatedDeviceController`]: queue fault steps, cut
/// power, and inspect what the host sent.
#[derive(Debug, Clone, Default)]
pub struct SimLog {
    inner: Arc<Mutex<SimState>>,
}

impl SimLog {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        // State is plain data; a panic elsewhere cannot leave it half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_script(&self, steps: impl IntoIterator<Item = SimStep>) {
        self.lock().script.extend(steps);
    }

    pub fn set_powered(&self, powered: bool) {
        self.lock().unpowered = !powered;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    pub fn inits(&self) -> usize {
        self.lock().commands.iter().filter(|c| matches!(c, Command::Init)).count()
    }

    pub fn motor_commands(&self) -> Vec<SlotId> {
        self.lock()
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Motor { slot_id, .. } => Some(slot_id.clone()),
                Command::Init => None,
            })
            .collect()
    }

    /// State sequence of every unit cycle run so far.
    pub fn traces(&self) -> Vec<Vec<CycleState>> {
        self.lock().traces.clone()
    }

    pub fn ever_entered(&self, state: CycleState) -> bool {
        self.lock().traces.iter().any(|t| t.contains(&state))
    }

    fn record(&self, cmd: Command) {
        self.lock().commands.push(cmd);
    }

    fn next_step(&self) -> SimStep {
        self.lock().script.pop_front().unwrap_or_default()
    }

    fn powered(&self) -> bool {
        !self.lock().unpowered
    }
}

/// In-process firmware model. Runs the same [`UnitCycle`] as the serial
/// controller; silent stages sleep out their full timeout.
pub struct SimulatedDeviceController {
    log: SimLog,
    timeouts: StageTimeouts,
    direction: Direction,
    /// Delay before each firmware reply.
    latency: Duration,
    ready: bool,
    desynced: bool,
    /// Tokens from an earlier cycle still on the bus.
    stale: VecDeque<Token>,
}

impl SimulatedDeviceController {
    pub fn new(timeouts: StageTimeouts, direction: Direction) -> Self {
        Self {
            log: SimLog::default(),
            timeouts,
            direction,
            latency: Duration::ZERO,
            ready: false,
            desynced: false,
            stale: VecDeque::new(),
        }
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = SimStep>) -> Self {
        self.log.push_script(steps);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn log(&self) -> SimLog {
        self.log.clone()
    }

    fn next_step(&mut self) -> SimStep {
        let step = self.log.next_step();
        if step == SimStep::NotReady {
            self.ready = false;
        }
        step
    }

    async fn reply_delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    async fn run(&mut self, cycle: &mut UnitCycle, step: SimStep) -> Result<(), CycleError> {
        let mut pending: VecDeque<Token> = VecDeque::new();
        let mut action = cycle.begin(self.ready, self.desynced);
        loop {
            match action {
                Action::WriteInit => {
                    self.log.record(Command::Init);
                    pending.extend(self.stale.drain(..));
                    if step != SimStep::NotReady && self.log.powered() {
                        pending.push_back(Token::Ready);
                    }
                    action = cycle.init_sent();
                }
                Action::WriteMotor => {
                    self.ready = true;
                    self.log.record(Command::Motor { slot_id: cycle.slot_id().clone(), direction: self.direction });
                    pending.extend(step.replies());
                    action = cycle.motor_sent();
                }
                Action::AwaitToken => match pending.pop_front() {
                    Some(token) => {
                        self.reply_delay().await;
                        action = cycle.on_token(token)?;
                    }
                    None => {
                        tokio::time::sleep(cycle.stage_timeout(&self.timeouts)).await;
                        return Err(cycle.on_timeout(&self.timeouts));
                    }
                },
                Action::Complete => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl DeviceController for SimulatedDeviceController {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn prepare(&mut self) -> Result<(), CycleError> {
        if self.ready {
            return Ok(());
        }
        self.log.record(Command::Init);
        if self.stale.drain(..).any(|t| t == Token::SensorActivated) {
            self.desynced = true;
            return Err(CycleError::ProtocolDesync {
                state: CycleState::Initializing,
                detail: "late DROP before READY".into(),
            });
        }
        if !self.log.powered() {
            tokio::time::sleep(self.timeouts.ready).await;
            self.desynced = true;
            return Err(CycleError::NotReady(format!("no READY within {:?}", self.timeouts.ready)));
        }
        self.reply_delay().await;
        self.ready = true;
        self.desynced = false;
        Ok(())
    }

    async fn dispense_unit(&mut self, slot_id: &SlotId) -> Result<CycleReport, CycleFailure> {
        let started = Instant::now();
        let step = self.next_step();
        let mut cycle = UnitCycle::new(slot_id.clone());
        let result = self.run(&mut cycle, step).await;
        if step == SimStep::LateDrop {
            self.stale.push_back(Token::SensorActivated);
        }
        let trace = cycle.into_trace();
        self.log.lock().traces.push(trace.clone());
        match result {
            Ok(()) => {
                self.desynced = false;
                Ok(CycleReport { slot_id: slot_id.clone(), trace, elapsed: started.elapsed() })
            }
            Err(error) => {
                self.ready = false;
                self.desynced = true;
                Err(CycleFailure { slot_id: slot_id.clone(), error, trace })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cycle::FULL_CYCLE;
    use crate::model::FailureKind;

    fn slot(s: &str) -> SlotId {
        SlotId::parse(s).unwrap()
    }

    fn sim(script: &[SimStep]) -> SimulatedDeviceController {
        SimulatedDeviceController::new(StageTimeouts::default(), Direction::Forward).with_script(script.iter().copied())
    }

    #[test]
    fn script_parsing() {
        assert_eq!(
            SimStep::parse_script("ok, no_ack,,garbage").unwrap(),
            vec![SimStep::Ok, SimStep::NoAck, SimStep::Garbage]
        );
        assert!(SimStep::parse_script("ok,explode").is_err());
        assert!(SimStep::parse_script("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn healthy_device_runs_full_cycles() {
        let mut dev = sim(&[]);
        let log = dev.log();
        dev.prepare().await.unwrap();
        for _ in 0..3 {
            assert_eq!(dev.dispense_unit(&slot("11")).await.unwrap().trace, FULL_CYCLE);
        }
        assert_eq!(log.inits(), 1);
        assert_eq!(log.motor_commands(), vec![slot("11"); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_faults_map_to_failure_kinds() {
        let mut dev = sim(&[SimStep::NoAck, SimStep::NoDrop, SimStep::NoDone, SimStep::Garbage, SimStep::NotReady]);
        let log = dev.log();
        dev.prepare().await.unwrap();
        let mut kinds = Vec::new();
        for _ in 0..5 {
            let failure = dev.dispense_unit(&slot("3")).await.unwrap_err();
            kinds.push(failure.error.kind());
        }
        assert_eq!(
            kinds,
            vec![
                FailureKind::MotorAckTimeout,
                FailureKind::SensorConfirmTimeout,
                FailureKind::ProtocolDesync,
                FailureKind::ProtocolDesync,
                FailureKind::DeviceNotReady,
            ]
        );
        // Every failure forces a fresh INIT on the next cycle.
        assert_eq!(log.inits(), 5);
        assert_eq!(log.motor_commands().len(), 4);
        // Recovers once the script runs dry.
        assert!(dev.dispense_unit(&slot("3")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn late_drop_arrives_before_ready() {
        let mut dev = sim(&[SimStep::LateDrop]);
        let log = dev.log();
        dev.prepare().await.unwrap();
        assert!(dev.dispense_unit(&slot("4")).await.unwrap_err().error.is_ambiguous());
        let failure = dev.dispense_unit(&slot("4")).await.unwrap_err();
        assert_eq!(failure.error, CycleError::LateSensor { slot_id: slot("4") });
        assert_eq!(log.motor_commands().len(), 1);
        // Drained; the bus is clean for the next cycle.
        assert!(dev.dispense_unit(&slot("4")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn late_drop_left_for_the_next_session_fails_prepare() {
        let mut dev = sim(&[SimStep::LateDrop]);
        dev.prepare().await.unwrap();
        dev.dispense_unit(&slot("4")).await.unwrap_err();
        assert_eq!(dev.prepare().await.unwrap_err().kind(), FailureKind::ProtocolDesync);
        dev.prepare().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unpowered_device_fails_prepare_without_motor_commands() {
        let mut dev = sim(&[]);
        let log = dev.log();
        log.set_powered(false);
        assert_eq!(dev.prepare().await.unwrap_err().kind(), FailureKind::DeviceNotReady);
        assert!(log.motor_commands().is_empty());
        assert!(!log.ever_entered(CycleState::MotorCommandSent));

        log.set_powered(true);
        dev.prepare().await.unwrap();
    }
}
