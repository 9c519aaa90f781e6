//! What a caller gets once their line is connected.

use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::line::Session;

/// Serves one connected caller.
///
/// The switchboard drops the returned future as soon as the carrier is lost,
/// so implementations need not watch [`Session::hangup`] themselves.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn handle(&self, session: Session) -> color_eyre::Result<()>;
}

/// Greets the caller, then echoes every line they type.
#[derive(Clone, Debug)]
pub struct Banner {
    text: String,
}

impl Banner {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl SessionHandler for Banner {
    #[tracing::instrument(skip_all, fields(line = %session.line))]
    async fn handle(&self, session: Session) -> color_eyre::Result<()> {
        let Session { reader, mut writer, .. } = session;
        writer.write_all(self.text.replace('\n', "\r\n").as_bytes()).await?;
        writer.write_all(b"\r\n").await?;

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim_end_matches('\r');
            tracing::debug!(line, "caller typed");
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
        }
        Ok(())
    }
}

/// Connects the caller to a TCP service, such as a telnet host.
#[derive(Clone, Debug)]
pub struct TcpBridge {
    address: String,
}

impl TcpBridge {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

#[async_trait]
impl SessionHandler for TcpBridge {
    #[tracing::instrument(skip_all, fields(line = %session.line, address = %self.address))]
    async fn handle(&self, session: Session) -> color_eyre::Result<()> {
        let Session { mut reader, mut writer, .. } = session;
        let stream = TcpStream::connect(&self.address)
            .await
            .wrap_err_with(|| format!("unable to reach {}", self.address))?;
        let (mut remote_rx, mut remote_tx) = stream.into_split();
        tracing::info!("bridging caller");

        // Whichever side stops first ends the call.
        tokio::select! {
            sent = tokio::io::copy(&mut reader, &mut remote_tx) => {
                let bytes = sent?;
                tracing::debug!(bytes, "caller closed the bridge");
            }
            received = tokio::io::copy(&mut remote_rx, &mut writer) => {
                let bytes = received?;
                tracing::debug!(bytes, "remote closed the bridge");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use tokio::io::AsyncReadExt;
    use crate::line::Hangup;
    use crate::LineId;

    fn session() -> (Session, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let session = Session {
            line: LineId::new(String::from("test0")).unwrap(),
            reader,
            writer,
            hangup: Hangup::new(),
        };
        (session, remote)
    }

    #[test(tokio::test)]
    async fn banner_then_echo() -> color_eyre::Result<()> {
        let (session, mut caller) = session();
        let handler = tokio::spawn(async move { Banner::new("hello\nthere").handle(session).await });

        caller.write_all(b"ping\r\n").await?;
        caller.shutdown().await?;

        let mut output = String::new();
        caller.read_to_string(&mut output).await?;
        assert_eq!(output, "hello\r\nthere\r\nping\r\n");
        handler.await??;
        Ok(())
    }

    #[test(tokio::test)]
    async fn bridge_relays_to_tcp() -> color_eyre::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let service = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await?;
            stream.write_all(b"pong").await?;
            Ok::<_, std::io::Error>(request)
        });

        let (session, mut caller) = session();
        let handler = tokio::spawn(async move { TcpBridge::new(address).handle(session).await });

        caller.write_all(b"ping").await?;
        let mut reply = [0u8; 4];
        caller.read_exact(&mut reply).await?;
        assert_eq!(&reply, b"pong");
        assert_eq!(&service.await??, b"ping");

        handler.await??;
        Ok(())
    }
}
