use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace};

use crate::{
    config::SerialConfig,
    error::{Error, Result},
    serial::Transport,
};

fn try_create_serial_port(config: &SerialConfig) -> Result<SerialStream> {
    tokio_serial::new(&config.path, config.baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(config.read_timeout())
        .open_native_async()
        .map_err(|e| Error::DeviceUnavailable {
            path: config.path.clone(),
            problem: format!("{e:#?}"),
        })
}

/// A modem on an actual tty/COM port.
///
/// The OS handle is held for as long as this lives,
/// and released when it is dropped.
pub struct SerialTransport {
    path: String,
    read_timeout: Duration,
    stream: SerialStream,
}

impl SerialTransport {
    /// Open the serial port described by the config.
    /// The path should likely be along the lines of `/dev/ttyUSBx` on unix, and `COMx` on Windows.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        info!(%config.path, %config.baud, "Opening modem serial port");

        let stream = try_create_serial_port(config)?;

        Ok(Self {
            path: config.path.clone(),
            read_timeout: config.read_timeout(),
            stream,
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("To port: `{:?}`", &bytes[..bytes.len().min(32)]);

        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;

        Ok(())
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        let pending = self.stream.bytes_to_read()? as usize;

        if pending == 0 {
            debug!(%self.path, "Nothing waiting on port");
            return Ok(vec![]);
        }

        let mut buffer = vec![0; pending];

        tokio::time::timeout(self.read_timeout, self.stream.read_exact(&mut buffer))
            .await
            .map_err(|_| Error::Timeout(format!("read of {pending} byte(s) from {}", self.path)))??;

        trace!("From port: `{:?}`", &buffer[..buffer.len().min(32)]);

        Ok(buffer)
    }
}
