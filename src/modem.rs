//! A Hayes-compatible modem answering calls on a serial line.

use async_trait::async_trait;

use crate::config::SerialSettings;
use crate::line::{CallEvent, ConnectEvent, Line, LineError, Session};
use crate::{LineId, LineIdRef, Phase};

mod port;
mod relay;
pub mod response;
pub mod serial;

use port::Port;
use relay::Relay;
use response::Response;
pub use serial::{ModemFactory, Opener, SerialOpener};

pub(crate) const ANSWER: &[u8] = b"\r\nATA\r\n";
pub(crate) const HANG_UP: &[u8] = b"\r\nATH\r\n";
pub(crate) const ESCAPE: &[u8] = b"+++";

pub struct Modem<O: Opener = SerialOpener> {
    id: LineId,
    settings: SerialSettings,
    opener: O,
    phase: Phase,
    port: Option<Port<O::Medium>>,
    relay: Option<Relay<O::Medium>>,
}

impl Modem {
    pub fn new(id: LineId, settings: SerialSettings) -> Self {
        Self::with_opener(id, settings, SerialOpener)
    }
}

impl<O: Opener> Modem<O> {
    pub fn with_opener(id: LineId, settings: SerialSettings, opener: O) -> Self {
        Self {
            id,
            settings,
            opener,
            phase: Phase::Idle,
            port: None,
            relay: None,
        }
    }

    pub fn settings(&self) -> SerialSettings {
        self.settings
    }

    fn expect_phase(&self, operation: &'static str, expected: Phase) -> Result<(), LineError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(LineError::InvalidPhase { operation, phase: self.phase })
        }
    }

    fn port(&mut self) -> Result<&mut Port<O::Medium>, LineError> {
        self.port.as_mut().ok_or(LineError::Closed)
    }

    async fn next_response(&mut self) -> Result<String, LineError> {
        let line = self.port()?.read_line().await.map_err(LineError::MediumRead)?;
        tracing::debug!(line = line.trim(), "received line from modem");
        Ok(line)
    }

    /// Gets the medium back from a running session, if there is one, and
    /// tells whether the caller was still on the line.
    async fn stop_relay(&mut self) -> Result<bool, LineError> {
        match self.relay.take() {
            Some(relay) => {
                let (medium, carrier_up) = relay.stop().await?;
                self.port = Some(Port::new(medium, self.settings.min_read));
                Ok(carrier_up)
            }
            None => Ok(false),
        }
    }

    /// Sends ATH. A live call is first escaped back to command mode with a
    /// guarded `+++`, or the modem would pass ATH on to the caller.
    async fn hang_up(&mut self, carrier_up: bool) -> Result<(), LineError> {
        let guard = self.settings.escape_guard;
        let port = self.port()?;
        if carrier_up {
            tokio::time::sleep(guard).await;
            port.send(ESCAPE).await.map_err(LineError::MediumWrite)?;
            tokio::time::sleep(guard).await;
        }
        port.send(HANG_UP).await.map_err(LineError::MediumWrite)
    }
}

#[async_trait]
impl<O: Opener> Line for Modem<O> {
    fn id(&self) -> &LineIdRef {
        &self.id
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    #[tracing::instrument(skip(self), fields(line = %self.id), err)]
    async fn init(&mut self) -> Result<(), LineError> {
        self.expect_phase("init", Phase::Idle)?;
        let medium = self.opener.open(&self.id, &self.settings).map_err(|source| LineError::MediumOpen {
            line: self.id.clone(),
            source,
        })?;
        self.port = Some(Port::new(medium, self.settings.min_read));
        self.phase = Phase::Opened;
        tracing::info!(baud_rate = self.settings.baud_rate, "line opened");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(line = %self.id))]
    async fn wait_for_call(&mut self) -> Result<CallEvent, LineError> {
        self.expect_phase("wait_for_call", Phase::Opened)?;
        loop {
            let line = self.next_response().await?;
            match response::classify(&line) {
                Response::Ring => {
                    self.port()?.send(ANSWER).await.map_err(LineError::MediumWrite)?;
                    self.phase = Phase::Ringing;
                    tracing::info!("answering call");
                    return Ok(CallEvent);
                }
                other => tracing::trace!(?other, "ignoring line while waiting for a call"),
            }
        }
    }

    #[tracing::instrument(skip(self), fields(line = %self.id))]
    async fn wait_for_connect(&mut self) -> Result<ConnectEvent, LineError> {
        self.expect_phase("wait_for_connect", Phase::Ringing)?;
        loop {
            let line = match self.next_response().await {
                Ok(line) => line,
                Err(err) => {
                    self.phase = Phase::Opened;
                    return Err(err);
                }
            };
            match response::classify(&line) {
                Response::Connect { rate } => {
                    self.phase = Phase::Connected;
                    tracing::info!(?rate, "carrier established");
                    return Ok(ConnectEvent {
                        rate,
                        message: line.trim().to_owned(),
                    });
                }
                Response::NoCarrier => {
                    self.phase = Phase::Opened;
                    return Err(LineError::NoCarrier);
                }
                other => tracing::trace!(?other, "ignoring line while waiting for a carrier"),
            }
        }
    }

    fn get_read_writer(&mut self) -> Result<Session, LineError> {
        self.expect_phase("get_read_writer", Phase::Connected)?;
        if self.relay.is_some() {
            return Err(LineError::InvalidPhase { operation: "get_read_writer", phase: self.phase });
        }
        let (medium, pending) = self.port.take().ok_or(LineError::Closed)?.into_parts();
        let (relay, session) = Relay::start(self.id.clone(), medium, pending);
        self.relay = Some(relay);
        Ok(session)
    }

    #[tracing::instrument(skip(self), fields(line = %self.id), err)]
    async fn release_session(&mut self) -> Result<(), LineError> {
        self.expect_phase("release_session", Phase::Connected)?;
        let carrier_up = self.stop_relay().await?;
        self.phase = Phase::Opened;
        if carrier_up {
            tracing::info!("hanging up on caller");
            self.hang_up(true).await?;
        }
        tracing::debug!("session released");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(line = %self.id))]
    async fn close(&mut self) -> Result<(), LineError> {
        let stopped = self.stop_relay().await;
        self.phase = Phase::Closed;
        let carrier_up = stopped?;

        if self.port.is_none() {
            return Err(LineError::Closed);
        }
        if let Err(err) = self.hang_up(carrier_up).await {
            tracing::warn!(error = %err, "failed to hang up");
        }
        let mut port = self.port.take().ok_or(LineError::Closed)?;
        port.shutdown().await.map_err(LineError::MediumClose)?;
        tracing::info!("line closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use test_log::test;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use super::*;

    /// Hands out one end of an in-memory pipe; the test plays the modem on
    /// the other end.
    struct PipeOpener(Mutex<Option<DuplexStream>>);

    impl Opener for PipeOpener {
        type Medium = DuplexStream;

        fn open(&self, _line: &LineIdRef, _settings: &SerialSettings) -> io::Result<DuplexStream> {
            self.0.lock().unwrap().take().ok_or_else(|| io::ErrorKind::NotFound.into())
        }
    }

    async fn opened_modem() -> (Modem<PipeOpener>, DuplexStream) {
        let (remote, medium) = tokio::io::duplex(1024);
        let id = LineId::new(String::from("/dev/ttyTEST")).unwrap();
        let settings = SerialSettings { escape_guard: Duration::ZERO, ..SerialSettings::default() };
        let mut modem = Modem::with_opener(id, settings, PipeOpener(Mutex::new(Some(medium))));
        modem.init().await.unwrap();
        (modem, remote)
    }

    async fn read_available(remote: &mut DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let read = tokio::time::timeout(Duration::from_millis(50), remote.read(&mut buf)).await;
        match read {
            Ok(Ok(n)) => buf[..n].to_vec(),
            _ => Vec::new(),
        }
    }

    #[test(tokio::test)]
    async fn open_failure_is_reported() {
        let id = LineId::new(String::from("/dev/ttyGONE")).unwrap();
        let mut modem = Modem::with_opener(id, SerialSettings::default(), PipeOpener(Mutex::new(None)));
        let err = modem.init().await.unwrap_err();
        assert!(matches!(err, LineError::MediumOpen { .. }));
        assert_eq!(modem.phase(), Phase::Idle);
    }

    #[test(tokio::test)]
    async fn ring_answers_once() -> color_eyre::Result<()> {
        let (mut modem, mut remote) = opened_modem().await;
        remote.write_all(b"OK\r\n  RING \r\nRING\r\n").await?;

        assert_eq!(modem.wait_for_call().await?, CallEvent);
        assert_eq!(modem.phase(), Phase::Ringing);
        assert_eq!(read_available(&mut remote).await, ANSWER);
        Ok(())
    }

    #[test(tokio::test)]
    async fn connect_after_ring() -> color_eyre::Result<()> {
        let (mut modem, mut remote) = opened_modem().await;
        assert_eq!(modem.phase(), Phase::Opened);
        remote.write_all(b"RING\r\n").await?;
        modem.wait_for_call().await?;
        assert_eq!(modem.phase(), Phase::Ringing);

        remote.write_all(b"\r\nCONNECT 33600\r\n").await?;
        let event = modem.wait_for_connect().await?;
        assert_eq!(event, ConnectEvent { rate: Some(33600), message: String::from("CONNECT 33600") });
        assert_eq!(modem.phase(), Phase::Connected);
        assert_eq!(read_available(&mut remote).await, ANSWER);
        Ok(())
    }

    #[test(tokio::test)]
    async fn no_carrier_returns_to_opened() -> color_eyre::Result<()> {
        let (mut modem, mut remote) = opened_modem().await;
        remote.write_all(b"RING\r\nNO CARRIER\r\nCONNECT 2400\r\n").await?;
        modem.wait_for_call().await?;

        let err = modem.wait_for_connect().await.unwrap_err();
        assert!(matches!(err, LineError::NoCarrier));
        assert_eq!(modem.phase(), Phase::Opened);
        assert_eq!(read_available(&mut remote).await, ANSWER);

        // The stale CONNECT is not a call.
        remote.write_all(b"RING\r\n").await?;
        modem.wait_for_call().await?;
        assert_eq!(modem.phase(), Phase::Ringing);
        Ok(())
    }

    #[test(tokio::test)]
    async fn read_errors_end_the_waits() -> color_eyre::Result<()> {
        let (mut modem, mut remote) = opened_modem().await;
        remote.write_all(b"RING\r\n").await?;
        modem.wait_for_call().await?;
        drop(remote);

        let err = modem.wait_for_connect().await.unwrap_err();
        assert!(matches!(err, LineError::MediumRead(_)));
        assert_eq!(modem.phase(), Phase::Opened);

        let err = modem.wait_for_call().await.unwrap_err();
        assert!(matches!(err, LineError::MediumRead(_)));
        Ok(())
    }

    #[test(tokio::test)]
    async fn waits_out_of_order_are_rejected() {
        let (mut modem, _remote) = opened_modem().await;
        let err = modem.wait_for_connect().await.unwrap_err();
        assert!(matches!(err, LineError::InvalidPhase { phase: Phase::Opened, .. }));
        assert!(modem.get_read_writer().is_err());
    }

    #[test(tokio::test)]
    async fn session_ends_on_carrier_loss() -> color_eyre::Result<()> {
        let (mut modem, mut remote) = opened_modem().await;
        remote.write_all(b"RING\r\n").await?;
        modem.wait_for_call().await?;
        remote.write_all(b"CONNECT 9600\r\nhi").await?;
        modem.wait_for_connect().await?;
        assert_eq!(read_available(&mut remote).await, ANSWER);

        let mut session = modem.get_read_writer()?;
        let mut greeting = [0u8; 2];
        session.reader.read_exact(&mut greeting).await?;
        assert_eq!(&greeting, b"hi");

        session.writer.write_all(b"welcome").await?;
        let mut echoed = [0u8; 7];
        remote.read_exact(&mut echoed).await?;
        assert_eq!(&echoed, b"welcome");

        for &byte in b"\r\nNO CARRIER\r\n" {
            remote.write_all(&[byte]).await?;
        }
        session.hangup.wait().await;
        let mut hang_up = [0u8; 7];
        remote.read_exact(&mut hang_up).await?;
        assert_eq!(&hang_up, HANG_UP);

        modem.release_session().await?;
        assert_eq!(modem.phase(), Phase::Opened);

        remote.write_all(b"RING\r\n").await?;
        modem.wait_for_call().await?;
        assert_eq!(read_available(&mut remote).await, ANSWER);
        Ok(())
    }

    #[test(tokio::test)]
    async fn release_while_carrier_is_up_hangs_up() -> color_eyre::Result<()> {
        let (mut modem, mut remote) = opened_modem().await;
        remote.write_all(b"RING\r\nCONNECT 33600\r\n").await?;
        modem.wait_for_call().await?;
        modem.wait_for_connect().await?;
        assert_eq!(read_available(&mut remote).await, ANSWER);

        let session = modem.get_read_writer()?;
        let hangup = session.hangup.clone();
        drop(session);
        modem.release_session().await?;
        assert!(!hangup.has_fired());
        assert_eq!(modem.phase(), Phase::Opened);
        assert_eq!(read_available(&mut remote).await, [ESCAPE, HANG_UP].concat());

        remote.write_all(b"OK\r\nRING\r\n").await?;
        modem.wait_for_call().await?;
        assert_eq!(modem.phase(), Phase::Ringing);
        Ok(())
    }

    #[test(tokio::test(start_paused = true))]
    async fn escape_is_guarded_by_silence() -> color_eyre::Result<()> {
        let (mut remote, medium) = tokio::io::duplex(1024);
        let id = LineId::new(String::from("/dev/ttyTEST"))?;
        let mut modem = Modem::with_opener(id, SerialSettings::default(), PipeOpener(Mutex::new(Some(medium))));
        modem.init().await?;
        remote.write_all(b"RING\r\nCONNECT\r\n").await?;
        modem.wait_for_call().await?;
        modem.wait_for_connect().await?;
        let _session = modem.get_read_writer()?;

        let started = tokio::time::Instant::now();
        modem.release_session().await?;
        assert!(started.elapsed() >= SerialSettings::default().escape_guard * 2);

        let mut sent = vec![0u8; ANSWER.len() + ESCAPE.len() + HANG_UP.len()];
        remote.read_exact(&mut sent).await?;
        assert_eq!(sent, [ANSWER, ESCAPE, HANG_UP].concat());
        Ok(())
    }

    #[test(tokio::test)]
    async fn close_hangs_up_and_second_close_fails() -> color_eyre::Result<()> {
        let (mut modem, mut remote) = opened_modem().await;
        modem.close().await?;
        assert_eq!(modem.phase(), Phase::Closed);

        let mut sent = Vec::new();
        remote.read_to_end(&mut sent).await?;
        assert_eq!(sent, HANG_UP);

        assert!(matches!(modem.close().await, Err(LineError::Closed)));
        assert_eq!(modem.phase(), Phase::Closed);
        Ok(())
    }

    #[test(tokio::test)]
    async fn close_during_session() -> color_eyre::Result<()> {
        let (mut modem, mut remote) = opened_modem().await;
        remote.write_all(b"RING\r\nCONNECT\r\n").await?;
        modem.wait_for_call().await?;
        modem.wait_for_connect().await?;
        let _session = modem.get_read_writer()?;

        modem.close().await?;
        let mut sent = Vec::new();
        remote.read_to_end(&mut sent).await?;
        assert_eq!(sent, [ANSWER, ESCAPE, HANG_UP].concat());
        Ok(())
    }

    #[test(tokio::test)]
    async fn close_before_init() {
        let id = LineId::new(String::from("/dev/ttyNEVER")).unwrap();
        let mut modem = Modem::with_opener(id, SerialSettings::default(), PipeOpener(Mutex::new(None)));
        assert!(matches!(modem.close().await, Err(LineError::Closed)));
    }
}
