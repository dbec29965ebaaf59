//! Distributed lifecycle handler: refcount writes to the state store.
//!
//! Same four-operation surface as the local handler, but the consumer loop
//! performs upserts and decrements against the `refcounts` table using its
//! own engine, independent of any orch context (it may outlive every one of
//! them). It never drops ClickHouse tables; that is the cleanup sweeper's
//! job.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use tracing::{error, warn};

use aaiclick_db::config::DbConfig;
use aaiclick_db::pool::create_pool;
use aaiclick_db::queries::refcounts;

use super::{LifecycleHandler, LifecycleMessage};

/// Lifecycle handler whose deltas land in the state store.
pub struct DistributedLifecycle {
    tx: Sender<LifecycleMessage>,
    rx: Mutex<Option<Receiver<LifecycleMessage>>>,
    config: Mutex<Option<DbConfig>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DistributedLifecycle {
    pub fn new(config: DbConfig) -> Self {
        let (tx, rx) = channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            config: Mutex::new(Some(config)),
            handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

impl LifecycleHandler for DistributedLifecycle {
    fn start(&self) {
        let Some(rx) = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let Some(config) = self
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        let handle = std::thread::Builder::new()
            .name("aaiclick-lifecycle-dist".to_owned())
            .spawn(move || run_consumer(rx, config))
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

impl Drop for DistributedLifecycle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Consumer loop on its own runtime and engine.
///
/// The sentinel arrives after every delta sent before `stop()`, so draining
/// to the sentinel applies them all before the handler returns.
fn run_consumer(rx: Receiver<LifecycleMessage>, config: DbConfig) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "lifecycle consumer could not build a runtime; dropping deltas");
            while let Ok(message) = rx.recv() {
                if message == LifecycleMessage::Shutdown {
                    break;
                }
            }
            return;
        }
    };

    let pool = match runtime.block_on(create_pool(&config)) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "lifecycle consumer could not reach the state store; dropping deltas");
            while let Ok(message) = rx.recv() {
                if message == LifecycleMessage::Shutdown {
                    break;
                }
            }
            return;
        }
    };

    while let Ok(message) = rx.recv() {
        let result = match &message {
            LifecycleMessage::Incref(table) => runtime.block_on(refcounts::incref(&pool, table)),
            LifecycleMessage::Decref(table) => runtime.block_on(refcounts::decref(&pool, table)),
            LifecycleMessage::Shutdown => break,
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to apply refcount delta");
        }
    }

    runtime.block_on(pool.close());
}
