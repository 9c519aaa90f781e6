use std::io;
use bytes::{Buf, BytesMut};
use nom::IResult;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest run of bytes without a newline kept while waiting for a result line.
const MAX_LINE_LEN: usize = 1024;

fn line(data: &[u8]) -> IResult<&[u8], &[u8]> {
    nom::sequence::terminated(nom::bytes::streaming::take_until("\n"), nom::bytes::streaming::tag("\n"))(data)
}

/// The open medium of a modem plus whatever has been read from it but not
/// consumed yet.
pub(crate) struct Port<M> {
    medium: M,
    buffer: BytesMut,
    min_read: usize,
}

impl<M> Port<M>
where
    M: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(medium: M, min_read: usize) -> Self {
        Self::from_parts(medium, BytesMut::new(), min_read)
    }

    pub fn from_parts(medium: M, buffer: BytesMut, min_read: usize) -> Self {
        Self {
            medium,
            buffer,
            min_read: min_read.max(1),
        }
    }

    pub fn into_parts(self) -> (M, BytesMut) {
        (self.medium, self.buffer)
    }

    /// Reads up to the next `\n`, which is not included in the result.
    ///
    /// Nothing is lost if the returned future is dropped before it resolves.
    pub async fn read_line(&mut self) -> io::Result<String> {
        loop {
            let parsed = match line(&self.buffer[..]) {
                Ok((remaining, line)) => Some((
                    self.buffer.len() - remaining.len(),
                    String::from_utf8_lossy(line).into_owned(),
                )),
                Err(err) if err.is_incomplete() => None,
                Err(err) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unreadable modem output: {:?}", err)));
                }
            };

            if let Some((consumed, line)) = parsed {
                self.buffer.advance(consumed);
                return Ok(line);
            }

            if self.buffer.len() > MAX_LINE_LEN {
                tracing::trace!(bytes = self.buffer.len(), "discarding overlong partial line");
                self.buffer.clear();
            }

            self.buffer.reserve(self.min_read);
            let bytes = self.medium.read_buf(&mut self.buffer).await?;
            if bytes == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            tracing::trace!(bytes, "received bytes from modem");
        }
    }

    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.medium.write_all(data).await?;
        self.medium.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.medium.shutdown().await
    }
}
