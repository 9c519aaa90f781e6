//! The contract every telephony endpoint satisfies, and the values it hands
//! to the switchboard along the way.

use std::io;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::config::LineSpec;
use crate::{LineId, LineIdRef, Phase};

#[derive(Debug, Error)]
pub enum LineError {
    #[error("unable to open medium for line {line}")]
    MediumOpen {
        line: LineId,
        #[source]
        source: io::Error,
    },
    #[error("failed reading from medium")]
    MediumRead(#[source] io::Error),
    #[error("failed writing to medium")]
    MediumWrite(#[source] io::Error),
    #[error("failed closing medium")]
    MediumClose(#[source] io::Error),
    #[error("no carrier on line")]
    NoCarrier,
    #[error("`{operation}` is not possible while the line is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },
    #[error("medium is not open")]
    Closed,
    #[error("session relay task failed")]
    Relay(#[from] tokio::task::JoinError),
}

/// The modem picked up an incoming call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallEvent;

/// The modem reported an established carrier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectEvent {
    /// Line rate announced with the result code, if any.
    pub rate: Option<u32>,
    /// The result line as received, trimmed.
    pub message: String,
}

/// Fires once when the carrier of a session is lost.
///
/// Cloning yields another handle to the same signal.
#[derive(Clone, Debug, Default)]
pub struct Hangup(CancellationToken);

impl Hangup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.0.cancel();
    }

    pub fn has_fired(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn wait(&self) {
        self.0.cancelled().await
    }
}

pub type SessionReader = ReadHalf<DuplexStream>;
pub type SessionWriter = WriteHalf<DuplexStream>;

/// The byte stream of a connected call.
///
/// Reading yields what the caller sends; writing goes to the caller. Both
/// halves hit end of stream once the line releases the session.
#[derive(Debug)]
pub struct Session {
    pub line: LineId,
    pub reader: SessionReader,
    pub writer: SessionWriter,
    pub hangup: Hangup,
}

#[async_trait]
pub trait Line: Send {
    fn id(&self) -> &LineIdRef;

    fn phase(&self) -> Phase;

    /// Opens the underlying medium.
    async fn init(&mut self) -> Result<(), LineError>;

    /// Resolves once an incoming call has been answered.
    async fn wait_for_call(&mut self) -> Result<CallEvent, LineError>;

    /// Resolves once the answered call has a carrier.
    async fn wait_for_connect(&mut self) -> Result<ConnectEvent, LineError>;

    /// Exposes the live connection. Only valid once connected.
    fn get_read_writer(&mut self) -> Result<Session, LineError>;

    /// Ends the current session, however it ended, and takes the medium back.
    /// A caller still on the line is hung up first.
    async fn release_session(&mut self) -> Result<(), LineError>;

    /// Hangs up and releases the medium. Fails with [`LineError::Closed`]
    /// when there is nothing left to close.
    async fn close(&mut self) -> Result<(), LineError>;
}

/// Builds concrete lines from their configuration.
pub trait LineFactory {
    fn build(&self, spec: &LineSpec) -> Box<dyn Line>;
}
