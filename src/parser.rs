//! Turns the reply to `AT+CMGL` into messages.
//!
//! A listing looks like this:
//!
//! ```text
//! +CMGL: 1,"REC UNREAD","+15551234567",,"25/01/01,12:00:00+00"
//! Hello there
//! OK
//! ```
//!
//! Each header line is followed by one line of body.
//!
//! A single message read back with `AT+CMGR` looks the same, minus the slot:
//!
//! ```text
//! +CMGR: "REC READ","+15551234567",,"25/01/01,12:00:00+00"
//! Hello there
//! OK
//! ```

use std::{fmt::Display, str::Lines};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Marks the header line of each message in a listing.
pub const LISTING_MARKER: &str = "+CMGL:";

/// Marks the header line of a message read back by slot.
pub const READ_MARKER: &str = "+CMGR:";

/// An SMS as read off the modem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InboundMessage {
    /// The modem's index for the message.
    /// Needed to delete it, and reused by the modem afterwards.
    pub slot: u32,

    /// Who sent it.
    pub sender: String,

    /// When the network says it was sent, in the modem's own format.
    pub timestamp: String,

    /// The text.
    pub body: String,
}

impl Display for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = self.body.chars().take(32).collect::<String>();

        write!(f, "slot {} from {}: {body}", self.slot, self.sender)
    }
}

// Split on commas, but not on those inside double quotes.
fn split_fields(line: &str) -> Vec<&str> {
    let mut fields = vec![];
    let mut quoted = false;
    let mut start = 0;

    for (index, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(&line[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    fields.push(&line[start..]);

    fields
}

fn unquote(field: &str) -> &str {
    field.trim().trim_matches('"')
}

/// Why a header was not turned into a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// Fewer comma separated fields than needed.
    TooFewFields(usize),

    /// The slot id was not a number.
    BadSlot(String),

    /// No body line followed the header.
    MissingBody,
}

impl Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Skip::TooFewFields(n) => write!(f, "header has {n} field(s), need 5"),
            Skip::BadSlot(slot) => write!(f, "slot `{slot}` is not a number"),
            Skip::MissingBody => write!(f, "no body line after header"),
        }
    }
}

fn slot_text(header: &str) -> &str {
    split_fields(header)[0]
        .split_once(':')
        .map(|(_, slot)| slot.trim())
        .unwrap_or_default()
}

fn header_slot(header: &str) -> Option<u32> {
    slot_text(header).parse().ok()
}

fn parse_header(header: &str) -> Result<(u32, String, String), Skip> {
    let fields = split_fields(header);

    if fields.len() < 5 {
        return Err(Skip::TooFewFields(fields.len()));
    }

    let slot = slot_text(header);
    let slot = slot
        .parse::<u32>()
        .map_err(|_| Skip::BadSlot(slot.to_owned()))?;

    Ok((
        slot,
        unquote(fields[2]).to_owned(),
        unquote(fields[4]).to_owned(),
    ))
}

fn is_header(line: &str) -> bool {
    line.trim_start().starts_with(LISTING_MARKER)
}

// A body may start with the marker too, so only a line that parses counts as the next header.
fn is_valid_header(line: &str) -> bool {
    is_header(line) && parse_header(line.trim()).is_ok()
}

/// A listing entry which did not become a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// The slot, if the header had a readable one.
    /// The message is still on the modem, now marked read.
    pub slot: Option<u32>,

    /// What was wrong.
    pub reason: Skip,
}

/// The messages in a listing, in the order the modem listed them.
///
/// Malformed entries are logged and skipped, they never stop the rest of the listing.
/// They are kept in [`UnreadListing::skipped`] so the caller can deal with them.
#[derive(Debug)]
pub struct UnreadListing<'a> {
    lines: std::iter::Peekable<Lines<'a>>,
    skipped: Vec<SkippedEntry>,
}

impl UnreadListing<'_> {
    /// The entries skipped so far.
    pub fn skipped(&self) -> &[SkippedEntry] {
        &self.skipped
    }

    /// The entries skipped, once done iterating.
    pub fn into_skipped(self) -> Vec<SkippedEntry> {
        self.skipped
    }
}

impl<'a> Iterator for UnreadListing<'a> {
    type Item = InboundMessage;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let header = self.lines.find(|line| is_header(line))?;

            // A header directly followed by another header has no body.
            let body = self.lines.next_if(|line| !is_valid_header(line));

            let parsed = parse_header(header.trim()).and_then(|(slot, sender, timestamp)| {
                let body = body.ok_or(Skip::MissingBody)?;

                Ok(InboundMessage {
                    slot,
                    sender,
                    timestamp,
                    body: body.trim().to_owned(),
                })
            });

            match parsed {
                Ok(message) => return Some(message),
                Err(reason) => {
                    warn!(%reason, header = header.trim(), "Skipping listing entry");

                    self.skipped.push(SkippedEntry {
                        slot: header_slot(header.trim()),
                        reason,
                    });
                }
            }
        }
    }
}

/// Parse the reply to `AT+CMGL`.
///
/// Replies without any [`LISTING_MARKER`] yield nothing.
pub fn parse_unread_listing(response: &str) -> UnreadListing<'_> {
    UnreadListing {
        lines: response.lines().peekable(),
        skipped: vec![],
    }
}

/// Parse the reply to `AT+CMGR=<slot>`.
///
/// The line after the header is the body, whatever it looks like.
/// Gives `None` if the reply holds no message, e.g. the slot is empty.
pub fn parse_read(slot: u32, response: &str) -> Option<InboundMessage> {
    let mut lines = response.lines();

    let header = lines.find(|line| line.trim_start().starts_with(READ_MARKER))?;
    let body = lines.next()?;

    let fields = split_fields(header.trim());
    if fields.len() < 4 {
        warn!(%slot, fields = fields.len(), "Read back header is too short");
        return None;
    }

    Some(InboundMessage {
        slot,
        sender: unquote(fields[1]).to_owned(),
        timestamp: unquote(fields[3]).to_owned(),
        body: body.trim().to_owned(),
    })
}

/// The slots in a listing, for logging.
pub fn slots(messages: &[InboundMessage]) -> String {
    messages.iter().map(|m| m.slot).join(", ")
}
