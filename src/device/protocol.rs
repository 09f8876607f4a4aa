//! Line protocol spoken by the dispenser firmware.
//!
//! Every frame is one ASCII line terminated by CRLF. The host sends
//! `INIT` once per session and `MOTOR <slot> <FWD|REV>` once per unit. The
//! firmware answers `READY` to `INIT`, and `ACK`, `DROP`, `DONE` (in that
//! order) to each motor command. `ERR <text>` reports a firmware fault.

use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::limits::MAX_FRAME_LEN;
use crate::model::SlotId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn wire(self) -> &'static str {
        match self {
            Direction::Forward => "FWD",
            Direction::Reverse => "REV",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fwd" | "forward" => Ok(Direction::Forward),
            "rev" | "reverse" => Ok(Direction::Reverse),
            other => Err(format!("unknown motor direction: {other}")),
        }
    }
}

/// Host → firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init,
    Motor { slot_id: SlotId, direction: Direction },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Init => f.write_str("INIT"),
            Command::Motor { slot_id, direction } => write!(f, "MOTOR {slot_id} {}", direction.wire()),
        }
    }
}

/// Firmware → host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Motor subsystem ready.
    Ready,
    /// Motor command accepted.
    Accepted,
    /// Drop sensor saw an item fall.
    SensorActivated,
    /// Motor stopped, cycle over.
    CycleComplete,
    Fault(String),
    Unknown(String),
}

impl Token {
    /// `None` for blank lines, which the firmware emits as keep-alives.
    pub fn parse(line: &str) -> Option<Token> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let token = match line {
            "READY" => Token::Ready,
            "ACK" => Token::Accepted,
            "DROP" => Token::SensorActivated,
            "DONE" => Token::CycleComplete,
            _ => match line.strip_prefix("ERR") {
                Some(rest) if rest.is_empty() || rest.starts_with(' ') => Token::Fault(rest.trim().to_string()),
                _ => Token::Unknown(line.to_string()),
            },
        };
        Some(token)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ready => f.write_str("READY"),
            Token::Accepted => f.write_str("ACK"),
            Token::SensorActivated => f.write_str("DROP"),
            Token::CycleComplete => f.write_str("DONE"),
            Token::Fault(msg) => write!(f, "ERR {msg}"),
            Token::Unknown(line) => write!(f, "{line:?}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame longer than {MAX_FRAME_LEN} bytes")]
    TooLong,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<LinesCodecError> for FrameError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => FrameError::TooLong,
            LinesCodecError::Io(e) => FrameError::Io(e),
        }
    }
}

/// CRLF framing. Decodes straight to [`Token`]s, skipping blank lines.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { lines: LinesCodec::new_with_max_length(MAX_FRAME_LEN) }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Token;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Token>, FrameError> {
        while let Some(line) = self.lines.decode(src)? {
            if let Some(token) = Token::parse(&line) {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Token>, FrameError> {
        while let Some(line) = self.lines.decode_eof(src)? {
            if let Some(token) = Token::parse(&line) {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), FrameError> {
        let line = cmd.to_string();
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
