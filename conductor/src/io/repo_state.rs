//! Cached, deduplicated view of repository state with polling watch.
//!
//! Concurrent callers of [`RepoStateTracker::state`] share one in-flight query:
//! the first caller runs it, the rest block on a condvar until the generation
//! counter moves and then take the same result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::repo_diff::{RepoState, RepoStateDiff, diff_repo_state};
use crate::io::vcs::ChangesetStore;

/// Default cache lifetime for [`RepoStateTracker::state`].
pub const DEFAULT_TTL: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct CacheSlot {
    cached: Option<(Instant, RepoState)>,
    in_flight: bool,
    generation: u64,
    last_error: Option<String>,
}

type Shared = Arc<(Mutex<CacheSlot>, Condvar)>;

/// TTL cache over [`ChangesetStore::working_copy_status`].
#[derive(Clone)]
pub struct RepoStateTracker {
    store: Arc<dyn ChangesetStore>,
    ttl: Duration,
    inner: Shared,
}

/// Event delivered to a [`RepoStateTracker::watch`] callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoEvent {
    Changed {
        previous: RepoState,
        current: RepoState,
        diff: RepoStateDiff,
    },
    Error(String),
}

/// Stops the watcher thread when [`WatchHandle::stop`] is called or on drop.
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("repo watcher thread panicked");
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RepoStateTracker {
    pub fn new(store: Arc<dyn ChangesetStore>) -> Self {
        Self::with_ttl(store, DEFAULT_TTL)
    }

    pub fn with_ttl(store: Arc<dyn ChangesetStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inner: Arc::new((Mutex::new(CacheSlot::default()), Condvar::new())),
        }
    }

    /// Current repository state, served from cache while younger than the TTL.
    #[instrument(skip_all)]
    pub fn state(&self) -> Result<RepoState> {
        let (lock, cvar) = &*self.inner;
        let mut slot = lock_slot(lock)?;

        if let Some((at, state)) = &slot.cached
            && at.elapsed() < self.ttl
        {
            return Ok(state.clone());
        }

        if slot.in_flight {
            let waiting_on = slot.generation;
            debug!("joining in-flight repo state query");
            while slot.in_flight && slot.generation == waiting_on {
                slot = cvar
                    .wait(slot)
                    .map_err(|_| anyhow!("repo state cache lock poisoned"))?;
            }
            return match (&slot.cached, &slot.last_error) {
                (_, Some(err)) => Err(anyhow!("repo state query failed: {err}")),
                (Some((_, state)), None) => Ok(state.clone()),
                (None, None) => Err(anyhow!("repo state query produced no result")),
            };
        }

        slot.in_flight = true;
        drop(slot);

        let result = self.store.working_copy_status().map(RepoState::from);

        let mut slot = lock_slot(lock)?;
        slot.in_flight = false;
        slot.generation += 1;
        let out = match result {
            Ok(state) => {
                slot.cached = Some((Instant::now(), state.clone()));
                slot.last_error = None;
                Ok(state)
            }
            Err(err) => {
                slot.cached = None;
                slot.last_error = Some(format!("{err:#}"));
                Err(err)
            }
        };
        cvar.notify_all();
        out
    }

    /// Drop the cached state so the next call queries the backend.
    pub fn invalidate(&self) {
        let (lock, _) = &*self.inner;
        if let Ok(mut slot) = lock.lock() {
            slot.cached = None;
        }
    }

    /// Poll the repository every `interval` and report real changes.
    ///
    /// The first successful poll establishes the baseline and emits nothing.
    pub fn watch<F>(&self, interval: Duration, mut callback: F) -> WatchHandle
    where
        F: FnMut(RepoEvent) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let tracker = self.clone();
        let thread = thread::spawn(move || {
            let mut previous: Option<RepoState> = None;
            while !stop_flag.load(Ordering::SeqCst) {
                tracker.invalidate();
                match tracker.state() {
                    Ok(current) => {
                        if let Some(prev) = &previous
                            && let Some(diff) = diff_repo_state(prev, &current)
                        {
                            callback(RepoEvent::Changed {
                                previous: prev.clone(),
                                current: current.clone(),
                                diff,
                            });
                        }
                        previous = Some(current);
                    }
                    Err(err) => callback(RepoEvent::Error(format!("{err:#}"))),
                }
                sleep_unless_stopped(&stop_flag, interval);
            }
            debug!("repo watcher stopped");
        });
        WatchHandle {
            stop,
            thread: Some(thread),
        }
    }
}

fn lock_slot(lock: &Mutex<CacheSlot>) -> Result<MutexGuard<'_, CacheSlot>> {
    lock.lock()
        .map_err(|_| anyhow!("repo state cache lock poisoned"))
}

fn sleep_unless_stopped(stop: &AtomicBool, interval: Duration) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}
