use std::convert::Infallible;
use std::fmt;
use aliri_braid::braid;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid line identity")]
pub struct InvalidLineId;

impl From<Infallible> for InvalidLineId {
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

/// Transport address of a line, such as `/dev/ttyUSB0` or `COM3`.
#[braid(validator)]
pub struct LineId;

impl aliri_braid::Validator for LineId {
    type Error = InvalidLineId;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            Ok(())
        } else {
            Err(InvalidLineId)
        }
    }
}

/// Where a line currently is in the answer cycle.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Opened,
    Ringing,
    Connected,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Idle => "idle",
            Self::Opened => "opened",
            Self::Ringing => "ringing",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(value)
    }
}
