use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use crate::config::{LineSpec, SerialSettings};
use crate::line::{Line, LineFactory};
use crate::LineIdRef;
use super::Modem;

/// Opens the medium a modem talks over.
pub trait Opener: Send + Sync + 'static {
    type Medium: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn open(&self, line: &LineIdRef, settings: &SerialSettings) -> io::Result<Self::Medium>;
}

/// Opens serial ports with 8 data bits, 1 stop bit and no parity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialOpener;

impl Opener for SerialOpener {
    type Medium = tokio_serial::SerialStream;

    #[tracing::instrument(skip(self))]
    fn open(&self, line: &LineIdRef, settings: &SerialSettings) -> io::Result<Self::Medium> {
        let stream = tokio_serial::new(line.as_str(), settings.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .open_native_async()?;
        Ok(stream)
    }
}

/// Builds serial modems, filling in whatever a line spec leaves out.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModemFactory {
    defaults: SerialSettings,
}

impl ModemFactory {
    pub fn new(defaults: SerialSettings) -> Self {
        Self { defaults }
    }
}

impl LineFactory for ModemFactory {
    fn build(&self, spec: &LineSpec) -> Box<dyn Line> {
        Box::new(Modem::new(spec.id.clone(), spec.settings(self.defaults)))
    }
}
