//! Optional sinks for training trajectory records.
//!
//! A `PersistenceAdapter` is handed to the trainer explicitly. The trainer
//! never calls it on the training thread: records go through a
//! `PersistenceQueue`, a background worker fed by an unbounded channel, so a
//! slow or failing store can neither block nor abort a run.

use crossbeam_channel::{unbounded, Sender};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Errors raised by persistence adapters. These never escape the queue.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("serialization failure: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store rejected record: {0}")]
    Rejected(String),
}

/// Destination for trajectory records.
pub trait PersistenceAdapter: Send {
    /// Stores one `payload` under `key`.
    fn store(
        &mut self,
        key: &str,
        payload: &Value,
        metadata: &Map<String, Value>,
    ) -> Result<(), PersistenceError>;

    /// Pushes buffered records to their destination.
    fn flush(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// One record as seen by an adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRecord {
    pub key: String,
    pub payload: Value,
    pub metadata: Map<String, Value>,
}

/// Keeps every record in memory. Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<StoredRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything stored so far, in arrival order.
    pub fn records(&self) -> Vec<StoredRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceAdapter for MemoryStore {
    fn store(
        &mut self,
        key: &str,
        payload: &Value,
        metadata: &Map<String, Value>,
    ) -> Result<(), PersistenceError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| PersistenceError::Rejected("memory store lock poisoned".into()))?;
        records.push(StoredRecord {
            key: key.to_owned(),
            payload: payload.clone(),
            metadata: metadata.clone(),
        });
        Ok(())
    }
}

/// Appends one JSON object per record to a file:
/// `{"key": ..., "metadata": {...}, "payload": {...}}`.
#[derive(Debug)]
pub struct JsonLinesStore {
    writer: BufWriter<File>,
}

impl JsonLinesStore {
    /// Opens `path` for appending, creating it when missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonLinesStore {
            writer: BufWriter::new(file),
        })
    }
}

impl PersistenceAdapter for JsonLinesStore {
    fn store(
        &mut self,
        key: &str,
        payload: &Value,
        metadata: &Map<String, Value>,
    ) -> Result<(), PersistenceError> {
        let line = serde_json::json!({
            "key": key,
            "metadata": metadata,
            "payload": payload,
        });
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PersistenceError> {
        self.writer.flush()?;
        Ok(())
    }
}

enum Command {
    Store {
        key: String,
        payload: Value,
        metadata: Map<String, Value>,
    },
    Flush(Sender<()>),
}

/// Background worker that forwards records to an adapter.
///
/// `submit` never blocks and never fails the caller; adapter errors are
/// logged and dropped. Dropping the queue drains pending records and joins
/// the worker.
pub struct PersistenceQueue {
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl PersistenceQueue {
    pub fn spawn<A>(adapter: A) -> Self
    where
        A: PersistenceAdapter + 'static,
    {
        Self::spawn_boxed(Box::new(adapter))
    }

    pub fn spawn_boxed(mut adapter: Box<dyn PersistenceAdapter>) -> Self {
        let (sender, receiver) = unbounded::<Command>();
        let worker = thread::Builder::new()
            .name("evonet-persistence".into())
            .spawn(move || {
                for command in receiver {
                    match command {
                        Command::Store {
                            key,
                            payload,
                            metadata,
                        } => {
                            if let Err(err) = adapter.store(&key, &payload, &metadata) {
                                tracing::warn!(%key, error = %err, "failed to persist record");
                            }
                        }
                        Command::Flush(ack) => {
                            if let Err(err) = adapter.flush() {
                                tracing::warn!(error = %err, "failed to flush persistence adapter");
                            }
                            let _ = ack.send(());
                        }
                    }
                }
                if let Err(err) = adapter.flush() {
                    tracing::warn!(error = %err, "failed to flush persistence adapter");
                }
            });
        match worker {
            Ok(worker) => PersistenceQueue {
                sender: Some(sender),
                worker: Some(worker),
            },
            Err(err) => {
                tracing::warn!(error = %err, "could not start persistence worker; records will be dropped");
                PersistenceQueue {
                    sender: None,
                    worker: None,
                }
            }
        }
    }

    /// Queues a record for storage.
    pub fn submit(&self, key: String, payload: Value, metadata: Map<String, Value>) {
        let sender = match self.sender {
            Some(ref sender) => sender,
            None => return,
        };
        tracing::trace!(%key, "queueing record");
        if sender
            .send(Command::Store {
                key,
                payload,
                metadata,
            })
            .is_err()
        {
            tracing::warn!("persistence worker is gone; record dropped");
        }
    }

    /// Blocks until every record queued so far has reached the adapter.
    pub fn flush(&self) {
        if let Some(ref sender) = self.sender {
            let (ack, done) = crossbeam_channel::bounded(1);
            if sender.send(Command::Flush(ack)).is_ok() {
                let _ = done.recv();
            }
        }
    }
}

impl Drop for PersistenceQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("persistence worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for PersistenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PersistenceQueue")
            .field("running", &self.worker.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufRead, BufReader};

    struct FailingStore;

    impl PersistenceAdapter for FailingStore {
        fn store(&mut self, _: &str, _: &Value, _: &Map<String, Value>) -> Result<(), PersistenceError> {
            Err(PersistenceError::Rejected("always".into()))
        }
    }

    fn metadata(iteration: u64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("iteration".into(), json!(iteration));
        map
    }

    #[test]
    fn queue_delivers_in_order() {
        let store = MemoryStore::new();
        let queue = PersistenceQueue::spawn(store.clone());
        for i in 0..5 {
            queue.submit(format!("run/{}", i), json!({ "i": i }), metadata(i));
        }
        queue.flush();
        let keys: Vec<_> = store.records().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["run/0", "run/1", "run/2", "run/3", "run/4"]);
    }

    #[test]
    fn drop_drains_pending_records() {
        let store = MemoryStore::new();
        {
            let queue = PersistenceQueue::spawn(store.clone());
            queue.submit("a".into(), json!(1), Map::new());
            queue.submit("b".into(), json!(2), Map::new());
        }
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn failing_adapter_does_not_poison_queue() {
        let queue = PersistenceQueue::spawn(FailingStore);
        queue.submit("x".into(), json!(null), Map::new());
        queue.flush();
        queue.submit("y".into(), json!(null), Map::new());
        queue.flush();
    }

    #[test]
    fn json_lines_store_writes_one_object_per_line() {
        let path = std::env::temp_dir().join(format!(
            "evonet-jsonl-{}-{}.jsonl",
            std::process::id(),
            line!()
        ));
        let _ = std::fs::remove_file(&path);
        {
            let mut store = JsonLinesStore::open(&path).unwrap();
            store.store("k1", &json!({"loss": 0.5}), &metadata(1)).unwrap();
            store.store("k2", &json!({"loss": 0.25}), &metadata(2)).unwrap();
            store.flush().unwrap();
        }
        let lines: Vec<Value> = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["key"], "k2");
        assert_eq!(lines[1]["payload"]["loss"], 0.25);
        assert_eq!(lines[0]["metadata"]["iteration"], 1);
    }
}
