//! Ephemeral worker threads.
//!
//! Every received message and every teardown runs on its own short-lived
//! thread. Handles are kept so that `stop()` can wait for outstanding
//! workers before clearing the registry.

use super::{lock, ConnectionId};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, warn};

pub(crate) struct Dispatcher {
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` on a fresh worker thread.
    ///
    /// If the OS refuses a new thread the task runs inline instead, so a
    /// delivery or teardown is never silently dropped.
    pub fn spawn<F>(&self, kind: &'static str, conn_id: ConnectionId, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Some(task)));
        let spawned = thread::Builder::new()
            .name(format!("{kind}-{conn_id}"))
            .spawn({
                let slot = slot.clone();
                move || {
                    let task = lock(&slot).take();
                    if let Some(task) = task {
                        task();
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                let mut workers = lock(&self.workers);
                workers.retain(|h| !h.is_finished());
                workers.push(handle);
            }
            Err(e) => {
                error!(conn_id = %conn_id, kind, error = %e, "Failed to spawn worker, running inline");
                let task = lock(&slot).take();
                if let Some(task) = task {
                    task();
                }
            }
        }
    }

    /// Number of workers that have not finished yet.
    pub fn in_flight(&self) -> usize {
        let mut workers = lock(&self.workers);
        workers.retain(|h| !h.is_finished());
        workers.len()
    }

    /// Wait for every tracked worker to finish.
    ///
    /// A worker calling this skips its own handle.
    pub fn join_all(&self) {
        let current = thread::current().id();
        loop {
            let handles = std::mem::take(&mut *lock(&self.workers));
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if handle.thread().id() == current {
                    continue;
                }
                let name = handle.thread().name().map(str::to_owned);
                if handle.join().is_err() {
                    warn!(worker = ?name, "Worker panicked");
                }
            }
        }
    }
}
