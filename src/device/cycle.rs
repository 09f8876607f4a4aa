use std::fmt;
use std::time::Duration;

use crate::model::{FailureKind, SlotId};

use super::protocol::Token;
use super::StageTimeouts;

/// One state of a unit cycle. In each waiting state the named token moves
/// the cycle forward; its absence within the stage timeout fails it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleState {
    Idle,
    /// `INIT` sent (or session already up); waiting for `READY`.
    Initializing,
    /// Motor subsystem ready; next step is the motor command.
    AwaitingMotorReady,
    /// Motor command written; waiting for `ACK`.
    MotorCommandSent,
    /// Command accepted; waiting for `DROP`.
    AwaitingMotorAck,
    /// Sensor fired; waiting for `DONE`.
    AwaitingSensorConfirm,
    Completed,
    Failed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("motor command for slot {slot_id} not acknowledged within {timeout:?}")]
    MotorAckTimeout { slot_id: SlotId, timeout: Duration },
    #[error("slot {slot_id} acknowledged but drop sensor silent for {timeout:?}")]
    SensorConfirmTimeout { slot_id: SlotId, timeout: Duration },
    /// `DROP` arrived while resyncing after a failed cycle: the previous
    /// unit fell after its cycle had been given up on.
    #[error("late drop sensor report before READY for slot {slot_id}")]
    LateSensor { slot_id: SlotId },
    #[error("protocol desync in {state}: {detail}")]
    ProtocolDesync { state: CycleState, detail: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl CycleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CycleError::NotReady(_) => FailureKind::DeviceNotReady,
            CycleError::MotorAckTimeout { .. } => FailureKind::MotorAckTimeout,
            CycleError::SensorConfirmTimeout { .. } => FailureKind::SensorConfirmTimeout,
            CycleError::ProtocolDesync { .. } | CycleError::LateSensor { .. } => FailureKind::ProtocolDesync,
            CycleError::Transport(_) => FailureKind::Transport,
        }
    }

    /// The motor moved (it acknowledged) but nobody saw an item fall.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, CycleError::SensorConfirmTimeout { .. })
    }
}

/// What the driver must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    WriteInit,
    WriteMotor,
    AwaitToken,
    Complete,
}

/// Pure state machine for releasing exactly one unit. Drivers feed it
/// tokens and timeouts and perform the writes it asks for; it never does
/// I/O itself, so the serial and simulated controllers share it.
#[derive(Debug)]
pub struct UnitCycle {
    slot_id: SlotId,
    state: CycleState,
    trace: Vec<CycleState>,
    /// After a failed cycle, stale `ACK`/`DONE` may still be in flight;
    /// skip them until `READY`. A stale `DROP` fails the cycle.
    resync: bool,
}

impl UnitCycle {
    pub fn new(slot_id: SlotId) -> Self {
        Self {
            slot_id,
            state: CycleState::Idle,
            trace: vec![CycleState::Idle],
            resync: false,
        }
    }

    pub fn slot_id(&self) -> &SlotId {
        &self.slot_id
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn trace(&self) -> &[CycleState] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<CycleState> {
        self.trace
    }

    fn enter(&mut self, next: CycleState) {
        self.state = next;
        self.trace.push(next);
    }

    /// Leave `Idle`. With a live session the handshake is already done and
    /// the cycle goes straight to the motor command.
    pub fn begin(&mut self, session_ready: bool, resync: bool) -> Action {
        debug_assert_eq!(self.state, CycleState::Idle);
        self.resync = resync;
        self.enter(CycleState::Initializing);
        if session_ready {
            self.enter(CycleState::AwaitingMotorReady);
            Action::WriteMotor
        } else {
            Action::WriteInit
        }
    }

    pub fn init_sent(&mut self) -> Action {
        Action::AwaitToken
    }

    pub fn motor_sent(&mut self) -> Action {
        debug_assert_eq!(self.state, CycleState::AwaitingMotorReady);
        self.enter(CycleState::MotorCommandSent);
        Action::AwaitToken
    }

    pub fn on_token(&mut self, token: Token) -> Result<Action, CycleError> {
        use CycleState::*;
        match (self.state, &token) {
            (Initializing, Token::Ready) => {
                self.enter(AwaitingMotorReady);
                Ok(Action::WriteMotor)
            }
            (Initializing, Token::SensorActivated) if self.resync => {
                Err(self.fail(CycleError::LateSensor { slot_id: self.slot_id.clone() }))
            }
            (Initializing, Token::Accepted | Token::CycleComplete) if self.resync => {
                tracing::debug!(slot = %self.slot_id, %token, "skipping stale token while resyncing");
                Ok(Action::AwaitToken)
            }
            (MotorCommandSent, Token::Accepted) => {
                self.enter(AwaitingMotorAck);
                Ok(Action::AwaitToken)
            }
            (AwaitingMotorAck, Token::SensorActivated) => {
                self.enter(AwaitingSensorConfirm);
                Ok(Action::AwaitToken)
            }
            (AwaitingSensorConfirm, Token::CycleComplete) => {
                self.enter(Completed);
                Ok(Action::Complete)
            }
            (state, Token::Fault(msg)) => Err(self.fail(CycleError::ProtocolDesync {
                state,
                detail: format!("firmware fault: {msg}"),
            })),
            (state, token) => Err(self.fail(CycleError::ProtocolDesync {
                state,
                detail: format!("unexpected {token}"),
            })),
        }
    }

    /// The current stage's timeout expired.
    pub fn on_timeout(&mut self, timeouts: &StageTimeouts) -> CycleError {
        let timeout = self.stage_timeout(timeouts);
        let err = match self.state {
            CycleState::Initializing => CycleError::NotReady(format!("no READY within {timeout:?}")),
            CycleState::MotorCommandSent => CycleError::MotorAckTimeout { slot_id: self.slot_id.clone(), timeout },
            CycleState::AwaitingMotorAck => {
                CycleError::SensorConfirmTimeout { slot_id: self.slot_id.clone(), timeout }
            }
            CycleState::AwaitingSensorConfirm => CycleError::ProtocolDesync {
                state: self.state,
                detail: format!("no DONE within {timeout:?} after sensor confirmation"),
            },
            state => CycleError::ProtocolDesync { state, detail: "timeout outside a waiting state".into() },
        };
        self.fail(err)
    }

    /// Move to `Failed`, returning `err` for convenience.
    pub fn fail(&mut self, err: CycleError) -> CycleError {
        if self.state != CycleState::Failed {
            self.enter(CycleState::Failed);
        }
        err
    }

    /// How long the current waiting state may last.
    pub fn stage_timeout(&self, timeouts: &StageTimeouts) -> Duration {
        match self.state {
            CycleState::Initializing => timeouts.ready,
            CycleState::MotorCommandSent => timeouts.motor_ack,
            CycleState::AwaitingMotorAck => timeouts.sensor_confirm,
            CycleState::AwaitingSensorConfirm => timeouts.cycle_complete,
            _ => Duration::ZERO,
        }
    }
}

/// Full traversal of a unit cycle on a fresh session.
pub const FULL_CYCLE: [CycleState; 7] = [
    CycleState::Idle,
    CycleState::Initializing,
    CycleState::AwaitingMotorReady,
    CycleState::MotorCommandSent,
    CycleState::AwaitingMotorAck,
    CycleState::AwaitingSensorConfirm,
    CycleState::Completed,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle() -> UnitCycle {
        UnitCycle::new(SlotId::parse("11").unwrap())
    }

    fn drive_to_motor_sent(c: &mut UnitCycle) {
        assert_eq!(c.begin(false, false), Action::WriteInit);
        assert_eq!(c.init_sent(), Action::AwaitToken);
        assert_eq!(c.on_token(Token::Ready).unwrap(), Action::WriteMotor);
        assert_eq!(c.motor_sent(), Action::AwaitToken);
    }

    #[test]
    fn happy_path_traverses_every_state() {
        let mut c = cycle();
        drive_to_motor_sent(&mut c);
        assert_eq!(c.on_token(Token::Accepted).unwrap(), Action::AwaitToken);
        assert_eq!(c.on_token(Token::SensorActivated).unwrap(), Action::AwaitToken);
        assert_eq!(c.on_token(Token::CycleComplete).unwrap(), Action::Complete);
        assert_eq!(c.trace(), &FULL_CYCLE);
    }

    #[test]
    fn live_session_skips_handshake_but_not_states() {
        let mut c = cycle();
        assert_eq!(c.begin(true, false), Action::WriteMotor);
        c.motor_sent();
        c.on_token(Token::Accepted).unwrap();
        c.on_token(Token::SensorActivated).unwrap();
        c.on_token(Token::CycleComplete).unwrap();
        assert_eq!(c.trace(), &FULL_CYCLE);
    }

    #[test]
    fn out_of_order_token_is_desync() {
        let mut c = cycle();
        drive_to_motor_sent(&mut c);
        let err = c.on_token(Token::SensorActivated).unwrap_err();
        assert!(matches!(err, CycleError::ProtocolDesync { state: CycleState::MotorCommandSent, .. }));
        assert_eq!(c.state(), CycleState::Failed);
    }

    #[test]
    fn unknown_line_is_desync() {
        let mut c = cycle();
        drive_to_motor_sent(&mut c);
        let err = c.on_token(Token::Unknown("BEEP".into())).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProtocolDesync);
    }

    #[test]
    fn firmware_fault_is_desync() {
        let mut c = cycle();
        drive_to_motor_sent(&mut c);
        c.on_token(Token::Accepted).unwrap();
        let err = c.on_token(Token::Fault("jam".into())).unwrap_err();
        assert!(err.to_string().contains("jam"));
    }

    #[test]
    fn timeouts_map_per_stage() {
        let t = StageTimeouts::default();

        let mut c = cycle();
        c.begin(false, false);
        assert!(matches!(c.on_timeout(&t), CycleError::NotReady(_)));

        let mut c = cycle();
        drive_to_motor_sent(&mut c);
        assert_eq!(c.on_timeout(&t).kind(), FailureKind::MotorAckTimeout);

        let mut c = cycle();
        drive_to_motor_sent(&mut c);
        c.on_token(Token::Accepted).unwrap();
        let err = c.on_timeout(&t);
        assert!(err.is_ambiguous());
        assert_eq!(err, CycleError::SensorConfirmTimeout { slot_id: SlotId::parse("11").unwrap(), timeout: t.sensor_confirm });

        let mut c = cycle();
        drive_to_motor_sent(&mut c);
        c.on_token(Token::Accepted).unwrap();
        c.on_token(Token::SensorActivated).unwrap();
        assert_eq!(c.on_timeout(&t).kind(), FailureKind::ProtocolDesync);
        assert_eq!(c.trace().last(), Some(&CycleState::Failed));
    }

    #[test]
    fn resync_skips_stale_tokens_until_ready() {
        let mut c = cycle();
        c.begin(false, true);
        assert_eq!(c.on_token(Token::CycleComplete).unwrap(), Action::AwaitToken);
        assert_eq!(c.on_token(Token::Ready).unwrap(), Action::WriteMotor);

        let mut strict = cycle();
        strict.begin(false, false);
        assert!(strict.on_token(Token::CycleComplete).is_err());
    }

    #[test]
    fn late_drop_while_resyncing_fails_the_cycle() {
        let mut c = cycle();
        c.begin(false, true);
        assert_eq!(c.on_token(Token::Accepted).unwrap(), Action::AwaitToken);
        let err = c.on_token(Token::SensorActivated).unwrap_err();
        assert_eq!(err, CycleError::LateSensor { slot_id: SlotId::parse("11").unwrap() });
        assert_eq!(err.kind(), FailureKind::ProtocolDesync);
        assert!(!err.is_ambiguous());
        assert_eq!(c.trace(), &[CycleState::Idle, CycleState::Initializing, CycleState::Failed]);
    }
}
