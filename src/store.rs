//! The message log.
//!
//! Received messages are appended and never changed or removed by the gateway.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    parser::InboundMessage,
};

/// A message about to be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Who sent it.
    pub sender: String,

    /// Modem native timestamp.
    pub timestamp: String,

    /// The text.
    pub body: String,
}

impl From<&InboundMessage> for NewMessage {
    fn from(message: &InboundMessage) -> Self {
        Self {
            sender: message.sender.clone(),
            timestamp: message.timestamp.clone(),
            body: message.body.clone(),
        }
    }
}

/// A message in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Assigned on insert, increasing.
    pub id: u64,

    /// Who sent it.
    pub sender: String,

    /// Modem native timestamp.
    pub timestamp: String,

    /// The text.
    #[serde(rename = "message")]
    pub body: String,

    /// When the gateway stored it.
    pub stored_at: DateTime<Utc>,
}

/// Durable storage of received messages.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a message, returning its id.
    /// Only returns once the message is durable.
    async fn insert(&self, message: &NewMessage) -> Result<u64>;

    /// All messages, oldest first.
    async fn list_all(&self) -> Result<Vec<StoredMessage>>;
}

fn store_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Store(format!("{}: {e}", path.display()))
}

async fn read_records(path: &Path) -> Result<Vec<StoredMessage>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(store_error(path, e)),
    };

    let records = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(
            |(index, line)| match serde_json::from_str::<StoredMessage>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(line = index + 1, ?e, "Skipping unreadable record");
                    None
                }
            },
        )
        .collect();

    Ok(records)
}

// Where records end up, with a way to make them durable.
#[async_trait]
trait LogFile: AsyncWrite + Unpin + Send {
    async fn sync(&mut self) -> io::Result<()>;
}

#[async_trait]
impl LogFile for File {
    async fn sync(&mut self) -> io::Result<()> {
        self.sync_data().await
    }
}

#[derive(Debug)]
struct Appender<F> {
    file: F,
    next_id: u64,

    // The last line in the file may be partial.
    dirty: bool,
}

impl<F: LogFile> Appender<F> {
    async fn append(&mut self, message: &NewMessage) -> io::Result<u64> {
        let record = StoredMessage {
            id: self.next_id,
            sender: message.sender.clone(),
            timestamp: message.timestamp.clone(),
            body: message.body.clone(),
            stored_at: Utc::now(),
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        // Don't let this record end up on the same line as a partial one.
        if self.dirty {
            self.file.write_all(b"\n").await?;
            self.file.flush().await?;
            self.dirty = false;
        }

        // Write errors may only show on flush.
        self.dirty = true;
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        self.dirty = false;

        // The record is in the file from here on, even if the sync fails,
        // so its id is taken.
        self.next_id += 1;

        self.file.sync().await?;

        Ok(record.id)
    }
}

/// A [`Store`] keeping one JSON object per line in an append-only file.
#[derive(Debug)]
pub struct JsonLinesStore {
    path: PathBuf,
    appender: Mutex<Appender<File>>,
}

impl JsonLinesStore {
    /// Open (or create) the log at this path.
    ///
    /// Ids continue after the highest id already in the file.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let existing = read_records(&path).await?;
        let next_id = existing.iter().map(|r| r.id).max().unwrap_or(0) + 1;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| store_error(&path, e))?;

        // A write cut short leaves a partial last line.
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|e| store_error(&path, e))?;
        let dirty = contents.last().map_or(false, |&last| last != b'\n');
        if dirty {
            warn!(path = %path.display(), "Log does not end in a newline");
        }

        info!(path = %path.display(), records = existing.len(), %next_id, "Message log opened");

        Ok(Self {
            path,
            appender: Mutex::new(Appender {
                file,
                next_id,
                dirty,
            }),
        })
    }

    /// Where the log lives.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Store for JsonLinesStore {
    async fn insert(&self, message: &NewMessage) -> Result<u64> {
        let id = self
            .appender
            .lock()
            .await
            .append(message)
            .await
            .map_err(|e| store_error(&self.path, e))?;

        debug!(%id, "Stored message");

        Ok(id)
    }

    async fn list_all(&self) -> Result<Vec<StoredMessage>> {
        read_records(&self.path).await
    }
}
