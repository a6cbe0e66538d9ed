//! Background flush, compaction and value log GC threads
//!
//! Each worker wakes on its trigger channel or a ticker, runs one job and
//! publishes results only through the version swap. Failures are logged and
//! retried with exponential backoff; a panicking job is caught so the
//! foreground keeps working.

use super::database::DbInner;
use crate::vlog::GcTarget;
use crate::Result;
use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

const FLUSH_TICK: Duration = Duration::from_millis(500);
const COMPACTION_TICK: Duration = Duration::from_secs(1);
const BASE_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Delay before the next attempt after `failures` consecutive failures
fn backoff(failures: u32) -> Duration {
    BASE_BACKOFF
        .saturating_mul(1u32 << failures.min(16))
        .min(MAX_BACKOFF)
}

/// Handles of the running worker threads
pub(super) struct Workers {
    /// Dropping this wakes every worker for shutdown
    shutdown: Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    pub fn spawn(
        inner: &Arc<DbInner>,
        flush_rx: Receiver<()>,
        compact_rx: Receiver<()>,
    ) -> Result<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let mut handles = Vec::new();

        let db = inner.clone();
        handles.push(spawn_worker(
            "flush",
            shutdown_rx.clone(),
            flush_rx,
            FLUSH_TICK,
            move || db.flush_pending().map(|_| ()),
        )?);

        if !inner.options.do_not_compact {
            let db = inner.clone();
            handles.push(spawn_worker(
                "compaction",
                shutdown_rx.clone(),
                compact_rx,
                COMPACTION_TICK,
                move || {
                    while let Some(level) = db.levels.pick_compaction_level() {
                        if db.is_closing() || !db.levels.try_compact(level)? {
                            break;
                        }
                    }
                    Ok(())
                },
            )?);
        }

        if inner.options.value_gc_interval_ms > 0 {
            let db = inner.clone();
            let ratio = inner.options.value_gc_ratio;
            handles.push(spawn_worker(
                "value-gc",
                shutdown_rx,
                never(),
                Duration::from_millis(inner.options.value_gc_interval_ms),
                move || {
                    db.vlog.garbage_collect(db.as_ref(), ratio)?;
                    Ok(())
                },
            )?);
        }

        debug!("Started {} background workers", handles.len());
        Ok(Self { shutdown, handles })
    }

    /// Signal every worker and wait for it to finish its current job
    pub fn stop(self) {
        drop(self.shutdown);
        for (name, handle) in self.handles {
            if handle.join().is_err() {
                error!("{} worker terminated abnormally", name);
            }
        }
    }
}

fn spawn_worker<F>(
    name: &'static str,
    shutdown: Receiver<()>,
    trigger: Receiver<()>,
    interval: Duration,
    mut job: F,
) -> Result<(&'static str, JoinHandle<()>)>
where
    F: FnMut() -> Result<()> + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(format!("lodedb-{}", name))
        .spawn(move || {
            let ticker = tick(interval);
            let mut failures = 0u32;
            loop {
                select! {
                    recv(shutdown) -> _ => return,
                    recv(trigger) -> _ => {},
                    recv(ticker) -> _ => {},
                }

                match catch_unwind(AssertUnwindSafe(&mut job)) {
                    Ok(Ok(())) => failures = 0,
                    Ok(Err(e)) => {
                        failures += 1;
                        let delay = backoff(failures);
                        warn!(
                            "{} worker failed ({} in a row), retrying in {:?}: {}",
                            name, failures, delay, e
                        );
                        select! {
                            recv(shutdown) -> _ => return,
                            default(delay) => {},
                        }
                    }
                    Err(_) => {
                        failures += 1;
                        error!("{} worker panicked, continuing", name);
                    }
                }
            }
        })?;
    Ok((name, handle))
}
