use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use toolstream_types::{MessageEntry, UpdateReceipt};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode entries: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("background write failed: {0}")]
    Write(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persists tool-call snapshots grouped by chat message.
///
/// Every accepted upsert gets a sequence number larger than any handed out
/// before by the same store. Once closed, upserts are acknowledged with
/// `skipped: true` and change nothing.
#[async_trait]
pub trait MessageEntryStore: Send + Sync {
    async fn upsert(&self, entry: MessageEntry) -> Result<UpdateReceipt, StorageError>;
    async fn entries(&self, message_id: &str) -> Vec<MessageEntry>;
    /// Resolves once every upsert accepted so far is durable.
    async fn flush(&self) -> Result<(), StorageError>;
    async fn close(&self) -> Result<(), StorageError>;
}

/// Entries per message, in first-insert order.
#[derive(Default)]
struct EntryTable {
    messages: HashMap<String, Vec<MessageEntry>>,
}

impl EntryTable {
    fn apply(&mut self, entry: MessageEntry) {
        let list = self.messages.entry(entry.message_id.clone()).or_default();
        match list.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => list.push(entry),
        }
    }

    fn max_sequence(&self) -> u64 {
        self.messages
            .values()
            .flatten()
            .map(|entry| entry.sequence)
            .max()
            .unwrap_or(0)
    }
}

struct Sequencer {
    last: AtomicU64,
    closed: AtomicBool,
}

impl Sequencer {
    fn starting_at(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
            closed: AtomicBool::new(false),
        }
    }

    fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn skipped(&self) -> UpdateReceipt {
        UpdateReceipt {
            sequence_number: self.last.load(Ordering::SeqCst),
            skipped: true,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MemoryEntryStore {
    table: RwLock<EntryTable>,
    sequencer: Sequencer,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(EntryTable::default()),
            sequencer: Sequencer::starting_at(0),
        }
    }
}

impl Default for MemoryEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageEntryStore for MemoryEntryStore {
    async fn upsert(&self, mut entry: MessageEntry) -> Result<UpdateReceipt, StorageError> {
        if self.sequencer.is_closed() {
            return Ok(self.sequencer.skipped());
        }
        let mut table = self.table.write().await;
        entry.sequence = self.sequencer.next();
        let receipt = UpdateReceipt {
            sequence_number: entry.sequence,
            skipped: false,
        };
        table.apply(entry);
        Ok(receipt)
    }

    async fn entries(&self, message_id: &str) -> Vec<MessageEntry> {
        self.table
            .read()
            .await
            .messages
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.sequencer.close();
        Ok(())
    }
}

enum WriteCommand {
    Persist(String),
    Flush(oneshot::Sender<Result<(), String>>),
}

/// One `<message_id>.json` file per message under a base directory.
///
/// Upserts land in memory immediately; a background writer persists the
/// touched messages in order. `flush` waits for that writer to catch up.
pub struct JsonFileEntryStore {
    base: PathBuf,
    table: Arc<RwLock<EntryTable>>,
    sequencer: Sequencer,
    writer: Mutex<Option<mpsc::UnboundedSender<WriteCommand>>>,
}

impl JsonFileEntryStore {
    pub async fn open(base: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await.map_err(io_err(&base))?;

        let mut table = EntryTable::default();
        let mut dir = fs::read_dir(&base).await.map_err(io_err(&base))?;
        while let Some(item) = dir.next_entry().await.map_err(io_err(&base))? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).await.map_err(io_err(&path))?;
            match serde_json::from_str::<Vec<MessageEntry>>(&raw) {
                Ok(entries) => {
                    for entry in entries {
                        table.apply(entry);
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable entry file");
                }
            }
        }

        let sequencer = Sequencer::starting_at(table.max_sequence());
        let table = Arc::new(RwLock::new(table));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(base.clone(), table.clone(), rx));

        Ok(Self {
            base,
            table,
            sequencer,
            writer: Mutex::new(Some(tx)),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn message_path(&self, message_id: &str) -> PathBuf {
        message_file(&self.base, message_id)
    }

    async fn send(&self, command: WriteCommand) -> bool {
        match self.writer.lock().await.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl MessageEntryStore for JsonFileEntryStore {
    async fn upsert(&self, mut entry: MessageEntry) -> Result<UpdateReceipt, StorageError> {
        if self.sequencer.is_closed() {
            return Ok(self.sequencer.skipped());
        }
        let message_id = entry.message_id.clone();
        let receipt = {
            let mut table = self.table.write().await;
            entry.sequence = self.sequencer.next();
            let receipt = UpdateReceipt {
                sequence_number: entry.sequence,
                skipped: false,
            };
            table.apply(entry);
            receipt
        };
        if !self.send(WriteCommand::Persist(message_id)).await {
            return Err(StorageError::Write("writer stopped".to_string()));
        }
        Ok(receipt)
    }

    async fn entries(&self, message_id: &str) -> Vec<MessageEntry> {
        self.table
            .read()
            .await
            .messages
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let (done_tx, done_rx) = oneshot::channel();
        if !self.send(WriteCommand::Flush(done_tx)).await {
            return Ok(());
        }
        match done_rx.await {
            Ok(result) => result.map_err(StorageError::Write),
            Err(_) => Err(StorageError::Write("writer stopped".to_string())),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.sequencer.close();
        let result = self.flush().await;
        self.writer.lock().await.take();
        result
    }
}

async fn run_writer(
    base: PathBuf,
    table: Arc<RwLock<EntryTable>>,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
) {
    let mut last_error: Option<String> = None;
    while let Some(command) = rx.recv().await {
        let mut dirty = HashSet::new();
        let mut flushes = Vec::new();
        let mut push = |command| match command {
            WriteCommand::Persist(id) => {
                dirty.insert(id);
            }
            WriteCommand::Flush(done) => flushes.push(done),
        };
        push(command);
        while let Ok(more) = rx.try_recv() {
            push(more);
        }

        for message_id in dirty {
            let snapshot = table
                .read()
                .await
                .messages
                .get(&message_id)
                .cloned()
                .unwrap_or_default();
            if let Err(err) = write_message_file(&base, &message_id, &snapshot).await {
                tracing::warn!(message_id = %message_id, error = %err, "entry write failed");
                last_error = Some(err.to_string());
            }
        }
        for done in flushes {
            let _ = done.send(match last_error.take() {
                Some(err) => Err(err),
                None => Ok(()),
            });
        }
    }
}

async fn write_message_file(base: &Path, message_id: &str, entries: &[MessageEntry]) -> Result<(), StorageError> {
    let path = message_file(base, message_id);
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(entries)?;
    fs::write(&tmp, payload).await.map_err(io_err(&tmp))?;
    fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
    Ok(())
}

/// `<sanitized>-<hash>.json`. The sanitized part keeps the file readable; the
/// hash of the raw id keeps ids that sanitize alike in separate files.
fn message_file(base: &Path, message_id: &str) -> PathBuf {
    let safe: String = message_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    base.join(format!("{safe}-{}.json", message_id_hash(message_id)))
}

fn message_id_hash(message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}
