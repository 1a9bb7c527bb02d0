//! Moves unread messages from the modem into the store.
//!
//! A message is only deleted from the modem once the store has it.
//! Listing a message marks it as read on the modem, so it will not be listed as unread again.
//! Because of that, anything that fails half way is remembered here and retried next cycle:
//!
//! - Messages the store rejected are kept in memory, still on the modem, and stored later.
//! - Slots the modem refused to delete are deleted later.
//! - Listing entries that could not be parsed are read back one slot at a time.

use std::{collections::BTreeSet, fmt::Display, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    engine::{AtCommand, AtEngine, ModemSession},
    error::Result,
    parser::{self, parse_read, parse_unread_listing, InboundMessage},
    store::{NewMessage, Store},
};

/// What happened during one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages found in the unread listing.
    pub parsed: usize,

    /// Messages stored, including retries.
    pub stored: usize,

    /// Slots deleted from the modem, including retries.
    pub deleted: usize,

    /// Messages the store rejected.
    pub failed_stores: usize,

    /// Slots the modem did not delete.
    pub failed_deletes: usize,

    /// Listing entries that could not be parsed.
    pub skipped: usize,

    /// Messages read back by slot, after their listing entry was skipped.
    pub recovered: usize,
}

impl CycleReport {
    /// Nothing was found and nothing was retried.
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

impl Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "parsed {}, stored {}, deleted {}",
            self.parsed, self.stored, self.deleted
        )?;

        if self.skipped + self.recovered > 0 {
            write!(f, ", skipped {}, recovered {}", self.skipped, self.recovered)?;
        }

        if self.failed_stores + self.failed_deletes > 0 {
            write!(
                f,
                " (failed: {} store(s), {} delete(s))",
                self.failed_stores, self.failed_deletes
            )?;
        }

        Ok(())
    }
}

/// Polls the modem for unread messages.
pub struct Poller {
    engine: AtEngine,
    store: Arc<dyn Store>,
    interval: Duration,

    // Stored, but still on the modem.
    pending_deletes: BTreeSet<u32>,

    // Listed (so now marked read on the modem), but not stored.
    unsaved: Vec<InboundMessage>,

    // Listed, but the entry could not be parsed. Still on the modem, marked read.
    unreadable: BTreeSet<u32>,
}

impl Poller {
    /// A poller using the engine's poll interval.
    pub fn new(engine: AtEngine, store: Arc<dyn Store>) -> Self {
        let interval = engine.timings().poll_interval();

        Self {
            engine,
            store,
            interval,
            pending_deletes: BTreeSet::new(),
            unsaved: vec![],
            unreadable: BTreeSet::new(),
        }
    }

    /// Slots waiting for a delete retry.
    pub fn pending_deletes(&self) -> &BTreeSet<u32> {
        &self.pending_deletes
    }

    /// Messages waiting for a store retry.
    pub fn unsaved(&self) -> &[InboundMessage] {
        &self.unsaved
    }

    /// Slots waiting to be read back.
    pub fn unreadable(&self) -> &BTreeSet<u32> {
        &self.unreadable
    }

    /// Run one cycle.
    ///
    /// The modem session is held for the whole cycle,
    /// so sending an SMS waits until the cycle is done.
    /// Only failing to list messages is an error, everything else is
    /// counted in the report and retried next cycle.
    pub async fn poll_once(&mut self) -> Result<CycleReport> {
        let mut session = self.engine.session().await;
        let mut report = CycleReport::default();

        let response = session.execute(&AtCommand::ListUnread).await?;
        let mut listing = parse_unread_listing(response.as_str());
        let messages = listing.by_ref().collect::<Vec<_>>();
        report.parsed = messages.len();

        for skipped in listing.into_skipped() {
            report.skipped += 1;

            match skipped.slot {
                Some(slot) => {
                    self.unreadable.insert(slot);
                }
                None => error!(
                    reason = %skipped.reason,
                    "Listing entry without a slot, it stays on the modem"
                ),
            }
        }

        if !messages.is_empty() {
            info!(slots = %parser::slots(&messages), "Unread messages");
        }

        // Our messages in these slots were listed already and are marked read.
        // Showing up as unread means the slot was freed and reused by a new message.
        for message in &messages {
            if self.pending_deletes.remove(&message.slot) {
                info!(slot = message.slot, "Pending delete slot was reused, dropping retry");
            }
        }

        for message in std::mem::take(&mut self.unsaved) {
            self.persist_and_delete(&mut session, message, &mut report)
                .await;
        }

        for slot in std::mem::take(&mut self.pending_deletes) {
            self.delete(&mut session, slot, &mut report).await;
        }

        for message in messages {
            self.persist_and_delete(&mut session, message, &mut report)
                .await;
        }

        for slot in std::mem::take(&mut self.unreadable) {
            self.read_back(&mut session, slot, &mut report).await;
        }

        Ok(report)
    }

    async fn read_back(&mut self, session: &mut ModemSession, slot: u32, report: &mut CycleReport) {
        let response = match session.execute(&AtCommand::Read(slot)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%slot, ?e, "Could not read back, retrying next cycle");
                self.unreadable.insert(slot);
                return;
            }
        };

        match parse_read(slot, response.as_str()) {
            Some(message) => {
                info!(%message, "Read back skipped listing entry");
                report.recovered += 1;

                self.persist_and_delete(session, message, report).await;
            }
            None if response.is_error() => {
                info!(%slot, %response, "Slot is empty now, nothing to read back");
            }
            None => {
                warn!(%slot, %response, "Could not read back, retrying next cycle");
                self.unreadable.insert(slot);
            }
        }
    }

    async fn persist_and_delete(
        &mut self,
        session: &mut ModemSession,
        message: InboundMessage,
        report: &mut CycleReport,
    ) {
        match self.store.insert(&NewMessage::from(&message)).await {
            Ok(id) => {
                info!(%id, %message, "Saved message");
                report.stored += 1;

                self.delete(session, message.slot, report).await;
            }
            Err(e) => {
                warn!(?e, %message, "Could not store message, leaving it on the modem");
                report.failed_stores += 1;

                self.unsaved.push(message);
            }
        }
    }

    async fn delete(&mut self, session: &mut ModemSession, slot: u32, report: &mut CycleReport) {
        match session.execute(&AtCommand::Delete(slot)).await {
            Ok(response) if response.is_ok() => {
                debug!(%slot, "Deleted from modem");
                report.deleted += 1;
            }
            Ok(response) => {
                warn!(%slot, %response, "Modem did not delete, retrying next cycle");
                report.failed_deletes += 1;
                self.pending_deletes.insert(slot);
            }
            Err(e) => {
                warn!(%slot, ?e, "Could not delete, retrying next cycle");
                report.failed_deletes += 1;
                self.pending_deletes.insert(slot);
            }
        }
    }

    /// Poll forever in the background.
    ///
    /// The interval is counted from the end of one cycle to the start of the next.
    /// A failed cycle is logged, and the next one runs as usual.
    pub fn spawn(mut self) -> PollerHandle {
        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();

        let task = tokio::spawn(async move {
            info!(interval = ?self.interval, "Polling for unread messages");

            loop {
                match self.poll_once().instrument(info_span!("poll-cycle")).await {
                    Ok(report) if report.is_quiet() => debug!("Nothing new"),
                    Ok(report) => info!(%report, "Poll cycle done"),
                    Err(e) => error!(?e, "Poll cycle failed"),
                }

                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }

            if !self.pending_deletes.is_empty()
                || !self.unsaved.is_empty()
                || !self.unreadable.is_empty()
            {
                warn!(
                    pending_deletes = self.pending_deletes.len(),
                    unsaved = self.unsaved.len(),
                    unreadable = self.unreadable.len(),
                    "Stopping with unfinished work"
                );
            }
            info!("Poller stopped");
        });

        PollerHandle { cancel, task }
    }
}

/// The background poller.
#[derive(Debug)]
pub struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop polling and wait for the task to end.
    ///
    /// A cycle in progress runs to completion first,
    /// nothing is abandoned half way on the line.
    pub async fn shutdown(self) {
        self.cancel.cancel();

        if let Err(e) = self.task.await {
            error!(?e, "Poller task did not end cleanly");
        }
    }

    /// Whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
