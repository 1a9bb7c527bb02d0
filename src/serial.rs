use async_trait::async_trait;

use crate::error::Result;

/// The serial port backed transport.
pub mod serial_port;

/// Line terminator appended to AT commands.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Ends a text mode SMS body submission (Ctrl-Z).
pub const SUBMIT_TERMINATOR: u8 = 0x1A;

/// Byte level access to the modem's line.
///
/// There are no retries at this level, failures go straight to the caller.
/// Only the [`crate::engine::AtEngine`] owns a transport, which is what keeps
/// the line single-writer/single-reader.
#[async_trait]
pub trait Transport: Send {
    /// Put these bytes on the wire.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Drain whatever has arrived so far.
    /// Never waits for more bytes to show up.
    async fn read_available(&mut self) -> Result<Vec<u8>>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes).await
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        (**self).read_available().await
    }
}
