use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::error::StorageError;

const LOG_TREE: &str = "log";
const DB_TREE: &str = "db";
const TERM_KEY: &[u8] = b"term";

/// Durable key/value namespace holding the node's current term.
///
/// The sled database is split into a `log` and a `db` tree. Only `db` is
/// written today; `db["term"]` holds the term as a JSON integer.
pub struct TermStore {
    root: sled::Db,
    #[allow(dead_code)]
    log: sled::Tree,
    db: sled::Tree,
}

impl TermStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let root = sled::open(path)?;
        let log = root.open_tree(LOG_TREE)?;
        let db = root.open_tree(DB_TREE)?;

        info!("Term store opened at {:?}", path);

        Ok(Self { root, log, db })
    }

    /// Reads the persisted term. A missing key means a fresh node at term 0;
    /// anything else that goes wrong is returned to the caller.
    pub fn load_term(&self) -> Result<u64, StorageError> {
        match self.db.get(TERM_KEY)? {
            None => {
                debug!("No persisted term, starting at 0");
                Ok(0)
            }
            Some(bytes) => serde_json::from_slice::<u64>(&bytes)
                .map_err(|_| StorageError::CorruptRecord("term".to_string())),
        }
    }

    pub async fn save_term(&self, term: u64) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&term)?;
        self.db.insert(TERM_KEY, bytes)?;
        self.root.flush_async().await?;
        Ok(())
    }
}

/// Receives the term that failed to persist and the cause.
pub type ErrorSink = Box<dyn Fn(u64, StorageError) + Send + Sync>;

/// Background writer for the term.
///
/// At most one write is in flight. Terms requested while a write is running
/// collapse into a single follow-up write of the latest value.
pub struct TermPersister {
    requests: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl TermPersister {
    pub fn spawn(store: Arc<TermStore>, initial: u64, on_error: ErrorSink) -> Self {
        let (requests, mut pending) = watch::channel(initial);

        let task = tokio::spawn(async move {
            while pending.changed().await.is_ok() {
                let term = *pending.borrow_and_update();
                match store.save_term(term).await {
                    Ok(()) => debug!("Persisted term {term}"),
                    Err(e) => {
                        error!("Failed to persist term {term}: {e}");
                        on_error(term, e);
                    }
                }
            }
        });

        Self { requests, task }
    }

    pub fn save(&self, term: u64) {
        self.requests.send_if_modified(|current| {
            if *current == term {
                false
            } else {
                *current = term;
                true
            }
        });
    }

    /// Stops accepting requests and waits for the outstanding write.
    pub async fn close(self) {
        let Self { requests, task, .. } = self;
        drop(requests);
        if let Err(e) = task.await {
            error!("Term persister task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn fresh_store_starts_at_term_zero() {
        let tmp = TempDir::new().unwrap();
        let store = TermStore::open(tmp.path()).unwrap();
        assert_eq!(store.load_term().unwrap(), 0);
    }

    #[tokio::test]
    async fn saved_term_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = TermStore::open(tmp.path()).unwrap();
            store.save_term(5).await.unwrap();
        }

        let store = TermStore::open(tmp.path()).unwrap();
        assert_eq!(store.load_term().unwrap(), 5);
    }

    #[test]
    fn corrupt_term_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = TermStore::open(tmp.path()).unwrap();
        store.db.insert(TERM_KEY, b"not-a-number".to_vec()).unwrap();

        match store.load_term() {
            Err(StorageError::CorruptRecord(key)) => assert_eq!(key, "term"),
            other => panic!("expected CorruptRecord, got {other:?}"),
        }
    }

    #[test]
    fn term_is_stored_as_json_integer_in_db_tree() {
        let tmp = TempDir::new().unwrap();
        let store = TermStore::open(tmp.path()).unwrap();
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(store.save_term(42))
            .unwrap();

        let raw = store.root.open_tree("db").unwrap().get("term").unwrap().unwrap();
        assert_eq!(&raw[..], b"42");
    }

    #[tokio::test]
    async fn persister_collapses_to_latest_term() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TermStore::open(tmp.path()).unwrap());
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);

        let persister = TermPersister::spawn(
            Arc::clone(&store),
            0,
            Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for term in 1..=10 {
            persister.save(term);
        }
        persister.close().await;

        assert_eq!(store.load_term().unwrap(), 10);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_flushes_pending_request() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TermStore::open(tmp.path()).unwrap());
        let persister = TermPersister::spawn(Arc::clone(&store), 3, Box::new(|_, _| {}));

        persister.save(7);
        persister.close().await;

        assert_eq!(store.load_term().unwrap(), 7);
    }
}
