use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::LineId;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_MIN_READ: usize = 4;
pub const DEFAULT_ESCAPE_GUARD: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// Smallest read the medium should be asked for.
    pub min_read: usize,
    /// Silence kept on either side of `+++` so the modem drops back to
    /// command mode.
    pub escape_guard: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            min_read: DEFAULT_MIN_READ,
            escape_guard: DEFAULT_ESCAPE_GUARD,
        }
    }
}

#[derive(Debug, Error)]
pub enum InvalidLineSpec {
    #[error("invalid line identity in `{0}`")]
    Id(String),
    #[error("invalid baud rate in `{0}`")]
    BaudRate(String),
}

/// One line to serve, written as `PORT` or `PORT@BAUD`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineSpec {
    pub id: LineId,
    pub baud_rate: Option<u32>,
}

impl LineSpec {
    pub fn settings(&self, defaults: SerialSettings) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baud_rate.unwrap_or(defaults.baud_rate),
            ..defaults
        }
    }
}

impl FromStr for LineSpec {
    type Err = InvalidLineSpec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (port, baud_rate) = match s.rsplit_once('@') {
            Some((port, rate)) => {
                let rate = rate.parse::<u32>()
                    .ok()
                    .filter(|&r| r > 0)
                    .ok_or_else(|| InvalidLineSpec::BaudRate(s.to_owned()))?;
                (port, Some(rate))
            }
            None => (s, None),
        };
        let id = LineId::new(port.to_owned()).map_err(|_| InvalidLineSpec::Id(s.to_owned()))?;
        Ok(Self { id, baud_rate })
    }
}

impl fmt::Display for LineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)?;
        if let Some(rate) = self.baud_rate {
            write!(f, "@{}", rate)?;
        }
        Ok(())
    }
}
