//! Moves session bytes between the caller's stream and the modem while
//! watching for the modem's asynchronous carrier-loss notice.

use std::collections::VecDeque;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::line::{Hangup, Session};
use crate::LineId;
use super::HANG_UP;

const NO_CARRIER: &[u8] = b"NO CARRIER";
const WINDOW_LEN: usize = 100;
const RELAY_CHUNK: usize = 256;
const RELAY_BUFFER: usize = 4096;
/// Most bytes held for a caller that is not reading; older ones are dropped.
const BACKLOG_LIMIT: usize = 16 * 1024;

/// The trailing bytes received during a session.
#[derive(Debug)]
pub(crate) struct CarrierWatch {
    window: VecDeque<u8>,
}

impl CarrierWatch {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_LEN),
        }
    }

    /// Feeds `data` through the window one byte at a time and returns how
    /// many bytes were taken when the notice completed, if it did.
    pub fn scan(&mut self, data: &[u8]) -> Option<usize> {
        for (index, &byte) in data.iter().enumerate() {
            if self.push(byte) {
                return Some(index + 1);
            }
        }
        None
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.window.len() == WINDOW_LEN {
            self.window.pop_front();
        }
        self.window.push_back(byte);

        // Checked after every byte, so a match can only end at the newest one.
        self.window.len() >= NO_CARRIER.len()
            && self.window.iter().skip(self.window.len() - NO_CARRIER.len()).eq(NO_CARRIER.iter())
    }
}

/// The two tasks serving one session.
pub(crate) struct Relay<M> {
    stop: CancellationToken,
    hangup: Hangup,
    inbound: JoinHandle<ReadHalf<M>>,
    outbound: JoinHandle<WriteHalf<M>>,
}

impl<M> Relay<M>
where
    M: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Takes over `medium` and returns the caller's side of the session.
    /// `pending` holds bytes already read from the medium, which go first.
    pub fn start(line: LineId, medium: M, pending: BytesMut) -> (Self, Session) {
        let (local, remote) = tokio::io::duplex(RELAY_BUFFER);
        let (reader, writer) = tokio::io::split(local);
        let (from_caller, to_caller) = tokio::io::split(remote);
        let (medium_rx, medium_tx) = tokio::io::split(medium);

        let stop = CancellationToken::new();
        let hangup = Hangup::new();
        let (lost_tx, lost_rx) = oneshot::channel();

        let inbound = tokio::spawn(
            inbound(medium_rx, pending, to_caller, hangup.clone(), lost_tx, stop.clone())
                .instrument(tracing::debug_span!("inbound", line = %line)),
        );
        let outbound = tokio::spawn(
            outbound(from_caller, medium_tx, lost_rx, stop.clone())
                .instrument(tracing::debug_span!("outbound", line = %line)),
        );

        let session = Session {
            line,
            reader,
            writer,
            hangup,
        };
        let relay = Self {
            stop,
            hangup: session.hangup.clone(),
            inbound,
            outbound,
        };
        (relay, session)
    }

    /// Stops both tasks and puts the medium back together. The flag is set
    /// when the carrier was still up.
    pub async fn stop(self) -> Result<(M, bool), JoinError> {
        self.stop.cancel();
        let rx = self.inbound.await?;
        let tx = self.outbound.await?;
        Ok((rx.unsplit(tx), !self.hangup.has_fired()))
    }
}

async fn inbound<R, W>(
    mut medium: R,
    pending: BytesMut,
    mut caller: W,
    hangup: Hangup,
    lost: oneshot::Sender<()>,
    stop: CancellationToken,
) -> R
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut watch = CarrierWatch::new();
    let mut backlog = BytesMut::new();
    let mut chunk = [0u8; RELAY_CHUNK];
    let mut caller_open = true;
    let mut lost = Some(lost);

    let mut reading = match watch.scan(&pending) {
        Some(end) => {
            queue(&mut backlog, &pending[..end]);
            carrier_lost(&hangup, &mut lost);
            false
        }
        None => {
            queue(&mut backlog, &pending);
            true
        }
    };

    loop {
        if !reading && (backlog.is_empty() || !caller_open) {
            break;
        }

        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            written = caller.write(&backlog), if caller_open && !backlog.is_empty() => {
                match written {
                    Ok(0) | Err(_) => {
                        tracing::debug!(discarded = backlog.len(), "caller stopped reading");
                        caller_open = false;
                        backlog.clear();
                    }
                    Ok(bytes) => backlog.advance(bytes),
                }
            }
            read = medium.read(&mut chunk), if reading => {
                match read {
                    Ok(0) => {
                        tracing::warn!("medium closed during session");
                        hangup.fire();
                        reading = false;
                    }
                    Ok(bytes) => {
                        tracing::trace!(bytes, "received bytes from modem");
                        match watch.scan(&chunk[..bytes]) {
                            Some(end) => {
                                queue(&mut backlog, &chunk[..end]);
                                carrier_lost(&hangup, &mut lost);
                                reading = false;
                            }
                            None => queue(&mut backlog, &chunk[..bytes]),
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed reading from medium during session");
                        hangup.fire();
                        reading = false;
                    }
                }
            }
        }
    }
    medium
}

fn queue(backlog: &mut BytesMut, data: &[u8]) {
    backlog.extend_from_slice(data);
    if backlog.len() > BACKLOG_LIMIT {
        let dropped = backlog.len() - BACKLOG_LIMIT;
        tracing::debug!(dropped, "caller is not keeping up");
        backlog.advance(dropped);
    }
}

fn carrier_lost(hangup: &Hangup, lost: &mut Option<oneshot::Sender<()>>) {
    tracing::info!("carrier lost");
    hangup.fire();
    if let Some(lost) = lost.take() {
        let _ = lost.send(());
    }
}

async fn outbound<R, W>(
    mut caller: R,
    mut medium: W,
    mut lost: oneshot::Receiver<()>,
    stop: CancellationToken,
) -> W
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = [0u8; RELAY_CHUNK];
    let mut caller_open = true;

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            notice = &mut lost => {
                if notice.is_ok() {
                    if let Err(err) = send(&mut medium, HANG_UP).await {
                        tracing::warn!(error = %err, "failed to hang up after carrier loss");
                    }
                }
                break;
            }
            read = caller.read(&mut chunk), if caller_open => {
                match read {
                    Ok(0) => caller_open = false,
                    Ok(bytes) => {
                        if let Err(err) = send(&mut medium, &chunk[..bytes]).await {
                            tracing::warn!(error = %err, "failed writing to medium during session");
                            caller_open = false;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "caller stream failed");
                        caller_open = false;
                    }
                }
            }
        }
    }
    medium
}

async fn send<W: AsyncWrite + Unpin>(medium: &mut W, data: &[u8]) -> std::io::Result<()> {
    medium.write_all(data).await?;
    medium.flush().await
}
