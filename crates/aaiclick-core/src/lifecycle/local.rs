//! Local lifecycle handler: in-process refcounts with synchronous drops.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use super::{LifecycleHandler, LifecycleMessage};
use crate::data::ChConfig;

/// Executes `DROP TABLE IF EXISTS` on the data store.
///
/// A seam so the consumer loop is testable without a live ClickHouse; the
/// production implementation is [`HttpTableDropper`].
pub trait TableDropper: Send {
    /// Best-effort drop; the target may already be gone.
    fn drop_table(&mut self, table_name: &str);
}

/// Drops tables through a thread-owned synchronous HTTP client.
///
/// The client is built lazily on the first drop, inside the consumer thread
/// that owns it.
struct HttpTableDropper {
    config: ChConfig,
    client: Option<reqwest::blocking::Client>,
}

impl HttpTableDropper {
    fn new(config: ChConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }
}

impl TableDropper for HttpTableDropper {
    fn drop_table(&mut self, table_name: &str) {
        if !crate::params::is_artifact_table_name(table_name) {
            warn!(table = table_name, "refusing to drop non-artifact table");
            return;
        }

        if self.client.is_none() {
            match reqwest::blocking::Client::builder().build() {
                Ok(c) => self.client = Some(c),
                Err(e) => {
                    warn!(error = %e, "failed to build drop client");
                    return;
                }
            }
        }
        let Some(client) = self.client.as_ref() else {
            return;
        };

        let result = client
            .post(self.config.endpoint())
            .query(&[("database", self.config.database.as_str())])
            .basic_auth(
                &self.config.user,
                (!self.config.password.is_empty()).then_some(&self.config.password),
            )
            .body(format!("DROP TABLE IF EXISTS {table_name}"))
            .send();

        // Failures are swallowed: the target may already be gone.
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(table = table_name, "dropped table");
            }
            Ok(response) => {
                debug!(table = table_name, status = %response.status(), "drop failed");
            }
            Err(e) => {
                debug!(table = table_name, error = %e, "drop failed");
            }
        }
    }
}

type DropperFactory = Box<dyn FnOnce() -> Box<dyn TableDropper> + Send>;

/// The default lifecycle handler: an internal thread consuming an unbounded
/// in-memory queue. A decref that takes a table's count to zero drops the
/// table immediately, from the consumer thread.
pub struct LocalLifecycle {
    tx: Sender<LifecycleMessage>,
    rx: Mutex<Option<Receiver<LifecycleMessage>>>,
    factory: Mutex<Option<DropperFactory>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LocalLifecycle {
    /// Handler that drops through the data store at `config`.
    pub fn new(config: ChConfig) -> Self {
        Self::with_dropper_factory(Box::new(move || Box::new(HttpTableDropper::new(config))))
    }

    /// Handler with an injected dropper; used by tests.
    pub fn with_dropper_factory(factory: DropperFactory) -> Self {
        let (tx, rx) = channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            factory: Mutex::new(Some(factory)),
            handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

impl LifecycleHandler for LocalLifecycle {
    fn start(&self) {
        let Some(rx) = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let Some(factory) = self
            .factory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        let handle = std::thread::Builder::new()
            .name("aaiclick-lifecycle-local".to_owned())
            .spawn(move || run_consumer(rx, factory()))
            .expect("failed to spawn lifecycle consumer thread");

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(LifecycleMessage::Shutdown);
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }

    fn incref(&self, table_name: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .tx
            .send(LifecycleMessage::Incref(table_name.to_owned()));
    }

    fn decref(&self, table_name: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .tx
            .send(LifecycleMessage::Decref(table_name.to_owned()));
    }
}

impl Drop for LocalLifecycle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Single consumer loop: tracks counts, drops at zero, and on shutdown
/// drops whatever is still tracked (best effort).
fn run_consumer(rx: Receiver<LifecycleMessage>, mut dropper: Box<dyn TableDropper>) {
    let mut counts: HashMap<String, i64> = HashMap::new();

    while let Ok(message) = rx.recv() {
        match message {
            LifecycleMessage::Incref(table) => {
                *counts.entry(table).or_insert(0) += 1;
            }
            LifecycleMessage::Decref(table) => {
                let count = counts.entry(table.clone()).or_insert(0);
                *count -= 1;
                if *count <= 0 {
                    counts.remove(&table);
                    dropper.drop_table(&table);
                }
            }
            LifecycleMessage::Shutdown => break,
        }
    }

    for table in counts.keys() {
        dropper.drop_table(table);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Records drops instead of talking to a data store.
    struct RecordingDropper {
        dropped: Arc<Mutex<Vec<String>>>,
    }

    impl TableDropper for RecordingDropper {
        fn drop_table(&mut self, table_name: &str) {
            self.dropped
                .lock()
                .unwrap()
                .push(table_name.to_owned());
        }
    }

    fn recording_handler() -> (LocalLifecycle, Arc<Mutex<Vec<String>>>) {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dropped);
        let handler = LocalLifecycle::with_dropper_factory(Box::new(move || {
            Box::new(RecordingDropper { dropped: sink })
        }));
        (handler, dropped)
    }

    #[test]
    fn decref_to_zero_drops_immediately() {
        let (handler, dropped) = recording_handler();
        handler.start();

        handler.incref("t1");
        handler.decref("t1");
        handler.stop();

        assert_eq!(*dropped.lock().unwrap(), vec!["t1".to_owned()]);
    }

    #[test]
    fn balanced_refs_do_not_drop_early() {
        let (handler, dropped) = recording_handler();
        handler.start();

        handler.incref("t1");
        handler.incref("t1");
        handler.decref("t1");
        handler.stop();

        // One reference was still held at shutdown; the drop happens in the
        // shutdown sweep, not before.
        assert_eq!(*dropped.lock().unwrap(), vec!["t1".to_owned()]);
    }

    #[test]
    fn stop_drops_remaining_tracked_tables() {
        let (handler, dropped) = recording_handler();
        handler.start();

        handler.incref("t1");
        handler.incref("t2");
        handler.stop();

        let mut tables = dropped.lock().unwrap().clone();
        tables.sort();
        assert_eq!(tables, vec!["t1".to_owned(), "t2".to_owned()]);
    }

    #[test]
    fn operations_after_stop_are_noops() {
        let (handler, dropped) = recording_handler();
        handler.start();
        handler.stop();

        handler.incref("t9");
        handler.decref("t9");
        handler.stop();

        assert!(dropped.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_drains_queued_operations() {
        let (handler, dropped) = recording_handler();
        handler.start();

        for i in 0..100 {
            handler.incref(&format!("t{i}"));
            handler.decref(&format!("t{i}"));
        }
        handler.stop();

        assert_eq!(dropped.lock().unwrap().len(), 100);
    }
}
