//! The AT command engine.
//!
//! The modem's line is half-duplex and its replies have no "done" framing.
//! A command is written, then we wait a settle time, then we take whatever arrived.
//! This only works if nobody else touches the line in the meantime,
//! so every exchange goes through a [`ModemSession`], and there is only ever one of those.

use std::{fmt::Display, sync::Arc, time::Duration};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, debug_span, Instrument};

use crate::{
    config::Timings,
    error::Result,
    serial::{Transport, LINE_TERMINATOR, SUBMIT_TERMINATOR},
};

/// What ends the bytes of a command on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// `\r\n`, for regular commands.
    Line,

    /// Ctrl-Z, for an SMS body.
    CtrlZ,
}

impl Terminator {
    fn bytes(&self) -> &'static [u8] {
        match self {
            Terminator::Line => LINE_TERMINATOR,
            Terminator::CtrlZ => &[SUBMIT_TERMINATOR],
        }
    }
}

/// The commands the gateway sends to the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    /// `AT+CMGF=1`
    TextMode,

    /// `AT+CMGL="REC UNREAD"`
    ListUnread,

    /// `AT+CMGR=<slot>`
    Read(u32),

    /// `AT+CMGD=<slot>`
    Delete(u32),

    /// `AT+CMGS="<number>"`
    SetRecipient(String),

    /// The body of an SMS, after [`AtCommand::SetRecipient`].
    SubmitBody(String),

    /// Anything else, sent as-is with a line terminator.
    Raw(String),
}

impl AtCommand {
    /// The command text, without terminator.
    pub fn text(&self) -> String {
        match self {
            AtCommand::TextMode => "AT+CMGF=1".into(),
            AtCommand::ListUnread => "AT+CMGL=\"REC UNREAD\"".into(),
            AtCommand::Read(slot) => format!("AT+CMGR={slot}"),
            AtCommand::Delete(slot) => format!("AT+CMGD={slot}"),
            AtCommand::SetRecipient(number) => format!("AT+CMGS=\"{number}\""),
            AtCommand::SubmitBody(body) => body.clone(),
            AtCommand::Raw(raw) => raw.clone(),
        }
    }

    /// How the command is terminated on the wire.
    pub fn terminator(&self) -> Terminator {
        match self {
            AtCommand::SubmitBody(_) => Terminator::CtrlZ,
            _ => Terminator::Line,
        }
    }

    /// How long to wait before reading the reply.
    pub fn settle(&self, timings: &Timings) -> Duration {
        let millis = match self {
            AtCommand::ListUnread | AtCommand::Read(_) => timings.list_settle_ms,
            AtCommand::Delete(_) => timings.delete_settle_ms,
            AtCommand::SubmitBody(_) => timings.submit_settle_ms,
            AtCommand::TextMode | AtCommand::SetRecipient(_) | AtCommand::Raw(_) => {
                timings.default_settle_ms
            }
        };

        Duration::from_millis(millis)
    }

    /// The bytes to put on the wire.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = self.text().into_bytes();
        bytes.extend_from_slice(self.terminator().bytes());
        bytes
    }
}

impl Display for AtCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Message contents stay out of the logs.
            AtCommand::SubmitBody(body) => write!(f, "<body, {} chars>", body.chars().count()),
            other => write!(f, "{}", other.text()),
        }
    }
}

/// Whatever the modem said within the settle time, decoded as text.
///
/// No validation happens here, callers decide what it means.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AtResponse(String);

impl AtResponse {
    /// Create a response from bytes, ignoring any bad utf8 bytes.
    pub fn new_lossy<B: AsRef<[u8]>>(bytes: B) -> Self {
        Self(String::from_utf8_lossy(bytes.as_ref()).to_string())
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The modem confirmed: the last line it sent is `OK`.
    ///
    /// An echoed `OK` elsewhere in the reply (say, inside an SMS body) does not count.
    pub fn is_ok(&self) -> bool {
        self.0
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            == Some("OK")
    }

    /// The modem reported an error (`ERROR`, `+CMS ERROR`, `+CME ERROR`).
    pub fn is_error(&self) -> bool {
        self.0.contains("ERROR")
    }

    /// Nothing arrived at all.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl<T: AsRef<str>> From<T> for AtResponse {
    fn from(string_like: T) -> Self {
        Self(string_like.as_ref().into())
    }
}

impl Display for AtResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.chars().take(48).collect::<String>();

        write!(f, "{}", s.trim().escape_debug())
    }
}

/// Owns the modem's line.
///
/// Cheap to clone, clones share the same line.
#[derive(Clone)]
pub struct AtEngine {
    line: Arc<Mutex<Box<dyn Transport>>>,
    timings: Arc<Timings>,
}

impl std::fmt::Debug for AtEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtEngine")
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl AtEngine {
    /// Take ownership of the transport.
    pub fn new(transport: impl Transport + 'static, timings: Timings) -> Self {
        Self {
            line: Arc::new(Mutex::new(Box::new(transport) as Box<dyn Transport>)),
            timings: Arc::new(timings),
        }
    }

    /// The timings in use.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Wait for exclusive use of the line.
    ///
    /// Hold the session for every step of a multi-command sequence,
    /// so nothing else gets in between.
    pub async fn session(&self) -> ModemSession {
        ModemSession {
            line: self.line.clone().lock_owned().await,
            timings: self.timings.clone(),
        }
    }

    /// Run a single command in a session of its own.
    pub async fn execute(&self, command: &AtCommand) -> Result<AtResponse> {
        self.session().await.execute(command).await
    }
}

/// Exclusive use of the modem's line.
/// The line is released when this is dropped.
pub struct ModemSession {
    line: OwnedMutexGuard<Box<dyn Transport>>,
    timings: Arc<Timings>,
}

impl ModemSession {
    /// Write the command, wait its settle time, and read what arrived.
    ///
    /// Transport errors are returned as-is. There are no retries here.
    pub async fn execute(&mut self, command: &AtCommand) -> Result<AtResponse> {
        let settle = command.settle(&self.timings);

        self.exchange(command.to_wire(), settle)
            .instrument(debug_span!("modem", %command))
            .await
    }

    /// Write `command` followed by `\r\n`, wait `settle`, and read what arrived.
    pub async fn execute_raw(&mut self, command: &str, settle: Duration) -> Result<AtResponse> {
        let mut bytes = command.as_bytes().to_vec();
        bytes.extend_from_slice(LINE_TERMINATOR);

        self.exchange(bytes, settle)
            .instrument(debug_span!("modem", %command))
            .await
    }

    async fn exchange(&mut self, bytes: Vec<u8>, settle: Duration) -> Result<AtResponse> {
        self.line.write(&bytes).await?;

        // Nothing frames the end of a reply, so give the modem time to finish it.
        tokio::time::sleep(settle).await;

        let response = AtResponse::new_lossy(self.line.read_available().await?);
        debug!(%response, "Reply");

        Ok(response)
    }
}
