//! A mock modem, useful to test the gateway without an actual modem attached.
//!
//! It understands the handful of text mode AT commands the gateway uses,
//! keeps a slot indexed SIM inbox, and records every SMS submitted to it.

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::{
    error::Result,
    serial::{Transport, SUBMIT_TERMINATOR},
};

/// An SMS sitting in the mock's SIM inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSms {
    /// Who sent it.
    pub sender: String,

    /// Modem native timestamp.
    pub timestamp: String,

    /// The text.
    pub body: String,

    /// Whether a listing already showed it.
    pub read: bool,
}

/// An SMS someone submitted to the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSms {
    /// Destination number.
    pub recipient: String,

    /// The text.
    pub body: String,
}

#[derive(Debug)]
struct MockState {
    inbox: BTreeMap<u32, MockSms>,
    next_slot: u32,
    outbox: Vec<SentSms>,
    commands: Vec<String>,

    // Bytes the modem has answered with that nobody read yet.
    reply: BytesMut,

    // Set after `AT+CMGS`, holds the recipient until the body arrives.
    awaiting_body: Option<String>,
    text_mode: bool,

    awaiting_read: bool,
    overlapping_writes: usize,

    loopback: bool,
    truncate_listing_headers: bool,
    fail_writes: bool,
    fail_deletes: bool,
    reject_submissions: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            inbox: BTreeMap::new(),
            next_slot: 1,
            outbox: vec![],
            commands: vec![],
            reply: BytesMut::new(),
            awaiting_body: None,
            text_mode: false,
            awaiting_read: false,
            overlapping_writes: 0,
            loopback: false,
            truncate_listing_headers: false,
            fail_writes: false,
            fail_deletes: false,
            reject_submissions: false,
        }
    }
}

impl MockState {
    fn answer(&mut self, reply: &str) {
        self.reply.extend_from_slice(reply.as_bytes());
    }

    fn ok(&mut self) {
        self.answer("\r\nOK\r\n");
    }

    fn error(&mut self) {
        self.answer("\r\nERROR\r\n");
    }

    fn store(&mut self, sender: &str, timestamp: &str, body: &str) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;

        self.inbox.insert(
            slot,
            MockSms {
                sender: sender.into(),
                timestamp: timestamp.into(),
                body: body.into(),
                read: false,
            },
        );

        slot
    }

    fn list(&mut self, unread_only: bool) {
        let mut listing = String::new();

        for (slot, sms) in self.inbox.iter_mut() {
            if unread_only && sms.read {
                continue;
            }

            let status = if sms.read { "REC READ" } else { "REC UNREAD" };
            if self.truncate_listing_headers {
                listing += &format!("+CMGL: {slot},\"{status}\"\r\n{}\r\n", sms.body);
            } else {
                listing += &format!(
                    "+CMGL: {slot},\"{status}\",\"{}\",,\"{}\"\r\n{}\r\n",
                    sms.sender, sms.timestamp, sms.body
                );
            }

            // Listing marks messages as read, like a real modem does.
            sms.read = true;
        }

        self.answer(&format!("\r\n{listing}"));
        self.ok();
    }

    fn read(&mut self, slot: &str) {
        let sms = slot
            .trim()
            .parse::<u32>()
            .ok()
            .and_then(|slot| self.inbox.get_mut(&slot));

        match sms {
            Some(sms) => {
                sms.read = true;
                let reply = format!(
                    "\r\n+CMGR: \"REC READ\",\"{}\",,\"{}\"\r\n{}\r\n",
                    sms.sender, sms.timestamp, sms.body
                );
                self.answer(&reply);
                self.ok();
            }
            None => self.answer("\r\n+CMS ERROR: 321\r\n"),
        }
    }

    fn delete(&mut self, slot: &str) {
        if self.fail_deletes {
            self.error();
            return;
        }

        match slot.trim().parse::<u32>() {
            Ok(slot) if self.inbox.remove(&slot).is_some() => {
                debug!(%slot, "Mock deleted slot");
                self.ok();
            }
            _ => self.answer("\r\n+CMS ERROR: 321\r\n"),
        }
    }

    fn command(&mut self, line: &str) {
        self.commands.push(line.to_owned());

        if line == "AT" {
            self.ok();
        } else if line == "AT+CMGF=1" {
            self.text_mode = true;
            self.ok();
        } else if line == "AT+CMGF=0" {
            self.text_mode = false;
            self.ok();
        } else if line == "AT+CMGL=\"REC UNREAD\"" {
            self.list(true);
        } else if line == "AT+CMGL=\"ALL\"" {
            self.list(false);
        } else if let Some(slot) = line.strip_prefix("AT+CMGR=") {
            self.read(slot);
        } else if let Some(slot) = line.strip_prefix("AT+CMGD=") {
            self.delete(slot);
        } else if let Some(recipient) = line.strip_prefix("AT+CMGS=") {
            if self.text_mode {
                self.awaiting_body = Some(recipient.trim_matches('"').to_owned());
                self.answer("\r\n> ");
            } else {
                self.error();
            }
        } else {
            warn!(%line, "Mock got unknown command");
            self.error();
        }
    }

    fn body(&mut self, recipient: String, bytes: &[u8]) {
        let body = String::from_utf8_lossy(bytes).to_string();
        self.commands.push(format!("{body}<Ctrl-Z>"));

        if self.reject_submissions {
            self.answer("\r\n+CMS ERROR: 500\r\n");
            return;
        }

        self.outbox.push(SentSms {
            recipient: recipient.clone(),
            body: body.clone(),
        });
        let reference = self.outbox.len();

        if self.loopback {
            let timestamp = chrono::Utc::now().format("%y/%m/%d,%H:%M:%S+00").to_string();
            self.store(&recipient, &timestamp, &body);
        }

        self.answer(&format!("\r\n+CMGS: {reference}\r\n\r\nOK\r\n"));
    }

    fn incoming(&mut self, mut bytes: BytesMut) {
        while !bytes.is_empty() {
            if let Some(recipient) = self.awaiting_body.take() {
                match bytes.iter().position(|&b| b == SUBMIT_TERMINATOR) {
                    Some(position) => {
                        let body = bytes.split_to(position);
                        bytes.advance(1);
                        self.body(recipient, &body);
                    }
                    None => {
                        // Body without terminator, the modem keeps waiting.
                        self.awaiting_body = Some(recipient);
                        return;
                    }
                }
            } else {
                let end = bytes
                    .iter()
                    .position(|&b| b == b'\n')
                    .map(|p| p + 1)
                    .unwrap_or(bytes.len());
                let line = bytes.split_to(end);
                let line = String::from_utf8_lossy(&line).trim().to_owned();

                if !line.is_empty() {
                    self.command(&line);
                }
            }
        }
    }
}

/// A simulated modem.
///
/// Clones share the same modem, so a test can keep one clone
/// while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MockModem {
    state: Arc<Mutex<MockState>>,
}

impl MockModem {
    /// A modem with an empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// A modem which puts every SMS submitted to it back into its own inbox,
    /// as if the recipient sent it back.
    pub fn loopback() -> Self {
        let modem = Self::new();
        modem.state().loopback = true;
        modem
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock means a test already panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// An SMS arrives at the modem.
    /// Returns the slot it was stored in.
    pub fn receive(&self, sender: &str, timestamp: &str, body: &str) -> u32 {
        self.state().store(sender, timestamp, body)
    }

    /// The messages still on the SIM, by slot.
    pub fn inbox(&self) -> BTreeMap<u32, MockSms> {
        self.state().inbox.clone()
    }

    /// All SMS submitted so far.
    pub fn sent(&self) -> Vec<SentSms> {
        self.state().outbox.clone()
    }

    /// Every command line (and submitted body) the modem received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// How many of the received commands start with this prefix.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Writes which arrived while the previous reply was still unread.
    /// Anything above zero means two exchanges interleaved on the line.
    pub fn overlapping_writes(&self) -> usize {
        self.state().overlapping_writes
    }

    /// Leave sender and timestamp out of listing headers, as if the output got garbled.
    /// Reading a slot on its own still shows everything.
    pub fn set_truncate_listing_headers(&self, truncate: bool) {
        self.state().truncate_listing_headers = truncate;
    }

    /// Make every write fail, as if the device went away.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Make `AT+CMGD` answer `ERROR`.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.state().fail_deletes = fail;
    }

    /// Make body submissions answer with a `+CMS ERROR`.
    pub fn set_reject_submissions(&self, reject: bool) {
        self.state().reject_submissions = reject;
    }
}

#[async_trait]
impl Transport for MockModem {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state();

        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock modem unplugged").into());
        }

        if state.awaiting_read {
            warn!("Write while previous reply is unread");
            state.overlapping_writes += 1;
        }
        state.awaiting_read = true;

        trace!("Mock got `{:?}`", &bytes[..bytes.len().min(32)]);
        state.incoming(BytesMut::from(bytes));

        Ok(())
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut state = self.state();
        state.awaiting_read = false;

        Ok(state.reply.split().to_vec())
    }
}
