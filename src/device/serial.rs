use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_util::codec::Framed;

use crate::model::SlotId;

use super::cycle::{Action, CycleError, CycleState, UnitCycle};
use super::protocol::{Command, Direction, FrameCodec, FrameError, Token};
use super::{CycleFailure, CycleReport, DeviceController, StageTimeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    /// No `INIT` sent yet.
    Closed,
    Ready,
    /// A cycle failed; the firmware may still be mid-cycle.
    Desynced,
}

/// Drives real firmware over any byte stream: a tty, or a TCP bridge.
pub struct SerialDeviceController<T> {
    framed: Framed<T, FrameCodec>,
    timeouts: StageTimeouts,
    direction: Direction,
    session: Session,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialDeviceController<T> {
    pub fn new(io: T, timeouts: StageTimeouts, direction: Direction) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new()),
            timeouts,
            direction,
            session: Session::Closed,
        }
    }

    async fn send(&mut self, cmd: Command) -> Result<(), CycleError> {
        tracing::debug!(frame = %cmd, "device tx");
        self.framed.send(cmd).await.map_err(|e| CycleError::Transport(e.to_string()))
    }

    /// Next token, or `None` if `deadline` passed first.
    async fn recv(&mut self, deadline: Instant) -> Result<Option<Token>, CycleError> {
        match tokio::time::timeout_at(deadline, self.framed.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(CycleError::Transport("device closed the connection".into())),
            Ok(Some(Err(FrameError::TooLong))) => Err(CycleError::ProtocolDesync {
                state: CycleState::Failed,
                detail: FrameError::TooLong.to_string(),
            }),
            Ok(Some(Err(FrameError::Io(e)))) => Err(CycleError::Transport(e.to_string())),
            Ok(Some(Ok(token))) => {
                tracing::debug!(frame = %token, "device rx");
                Ok(Some(token))
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), CycleError> {
        self.send(Command::Init).await?;
        let deadline = Instant::now() + self.timeouts.ready;
        loop {
            match self.recv(deadline).await? {
                Some(Token::Ready) => return Ok(()),
                Some(Token::Fault(msg)) => return Err(CycleError::NotReady(format!("firmware fault: {msg}"))),
                Some(Token::Unknown(line)) => {
                    return Err(CycleError::ProtocolDesync {
                        state: CycleState::Initializing,
                        detail: format!("unexpected {line:?}"),
                    });
                }
                // The last unit of an earlier request fell after all; its
                // accounting is closed, so the operator has to look.
                Some(Token::SensorActivated) => {
                    tracing::warn!("late drop sensor report during handshake");
                    return Err(CycleError::ProtocolDesync {
                        state: CycleState::Initializing,
                        detail: "late DROP before READY".into(),
                    });
                }
                // Leftovers from a cycle that failed before this session.
                Some(stale) => tracing::debug!(frame = %stale, "skipping stale token during handshake"),
                None => {
                    return Err(CycleError::NotReady(format!("no READY within {:?}", self.timeouts.ready)));
                }
            }
        }
    }

    /// Drive `cycle` until it completes or fails.
    async fn run(&mut self, cycle: &mut UnitCycle) -> Result<(), CycleError> {
        let mut action = cycle.begin(self.session == Session::Ready, self.session == Session::Desynced);
        let mut stage: Option<(CycleState, Instant)> = None;
        loop {
            match action {
                Action::WriteInit => {
                    self.send(Command::Init).await.map_err(|e| cycle.fail(e))?;
                    action = cycle.init_sent();
                }
                Action::WriteMotor => {
                    self.session = Session::Ready;
                    let cmd = Command::Motor { slot_id: cycle.slot_id().clone(), direction: self.direction };
                    self.send(cmd).await.map_err(|e| cycle.fail(e))?;
                    action = cycle.motor_sent();
                }
                Action::AwaitToken => {
                    let state = cycle.state();
                    let deadline = match stage {
                        Some((s, at)) if s == state => at,
                        _ => {
                            let at = Instant::now() + cycle.stage_timeout(&self.timeouts);
                            stage = Some((state, at));
                            at
                        }
                    };
                    action = match self.recv(deadline).await {
                        Ok(Some(token)) => cycle.on_token(token)?,
                        Ok(None) => return Err(cycle.on_timeout(&self.timeouts)),
                        Err(e) => return Err(cycle.fail(e)),
                    };
                }
                Action::Complete => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceController for SerialDeviceController<T> {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn prepare(&mut self) -> Result<(), CycleError> {
        if self.session == Session::Ready {
            return Ok(());
        }
        match self.handshake().await {
            Ok(()) => {
                self.session = Session::Ready;
                Ok(())
            }
            Err(e) => {
                self.session = Session::Desynced;
                Err(e)
            }
        }
    }

    async fn dispense_unit(&mut self, slot_id: &SlotId) -> Result<CycleReport, CycleFailure> {
        let started = Instant::now();
        let mut cycle = UnitCycle::new(slot_id.clone());
        match self.run(&mut cycle).await {
            Ok(()) => Ok(CycleReport {
                slot_id: slot_id.clone(),
                trace: cycle.into_trace(),
                elapsed: started.elapsed(),
            }),
            Err(error) => {
                self.session = Session::Desynced;
                Err(CycleFailure { slot_id: slot_id.clone(), error, trace: cycle.into_trace() })
            }
        }
    }
}

/// A tty opened twice so a read parked on a silent device never blocks the
/// next write.
pub struct SerialPort {
    rx: tokio::fs::File,
    tx: tokio::fs::File,
}

impl SerialPort {
    /// Line settings (baud, parity) are left to the OS.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let rx = tokio::fs::OpenOptions::new().read(true).open(path).await?;
        let tx = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        Ok(Self { rx, tx })
    }
}

impl AsyncRead for SerialPort {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.rx).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialPort {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.tx).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.tx).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.tx).poll_shutdown(cx)
    }
}
