use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::errors::types::{Error, Result};

/// Worker wake-up period
pub const TICK: Duration = Duration::from_millis(10);

/// Callback run when a timer expires; user data is whatever the closure captures
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identity of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Raw identifier, unique for the lifetime of the wheel
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    expiry: Instant,
    id: u64,
}

#[derive(Default)]
struct WheelState {
    /// Armed timers ordered by (expiry, id)
    queue: BTreeMap<TimerKey, TimerCallback>,
    /// id -> expiry, to locate an entry from its handle
    index: HashMap<u64, Instant>,
    next_id: u64,
    shutdown: bool,
}

struct WheelInner {
    state: Mutex<WheelState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Sorted one-shot timer queue with a 10 ms worker
#[derive(Clone)]
pub struct TimerWheel {
    inner: Arc<WheelInner>,
}

impl TimerWheel {
    /// Create the wheel and spawn its worker on the current tokio runtime
    pub fn init() -> Self {
        let wheel = Self::new_detached();
        let weak = Arc::downgrade(&wheel.inner);
        let handle = tokio::spawn(run_worker(weak));
        *wheel.inner.worker.lock() = Some(handle);
        debug!("Timer wheel started with {:?} tick", TICK);
        wheel
    }

    /// Create a wheel without a worker; expirations only happen through
    /// [`TimerWheel::fire_expired`]
    pub fn new_detached() -> Self {
        Self {
            inner: Arc::new(WheelInner {
                state: Mutex::new(WheelState {
                    next_id: 1,
                    ..Default::default()
                }),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Arm a one-shot timer firing `timeout` from now
    pub fn start<F>(&self, timeout: Duration, callback: F) -> Result<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.start_at(Instant::now() + timeout, callback)
    }

    /// Arm a one-shot timer firing at an absolute instant
    pub fn start_at<F>(&self, expiry: Instant, callback: F) -> Result<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(Error::TimerShutdown);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.queue.insert(TimerKey { expiry, id }, Box::new(callback));
        state.index.insert(id, expiry);
        trace!(timer = id, "Timer armed");
        Ok(TimerHandle(id))
    }

    /// Disarm a timer. Returns [`Error::TimerNotFound`] if it already fired or
    /// was stopped before.
    pub fn stop(&self, handle: TimerHandle) -> Result<()> {
        let mut state = self.inner.state.lock();
        let expiry = state.index.remove(&handle.0).ok_or(Error::TimerNotFound)?;
        state.queue.remove(&TimerKey { expiry, id: handle.0 });
        trace!(timer = handle.0, "Timer stopped");
        Ok(())
    }

    /// Whether the timer is still armed
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.inner.state.lock().index.contains_key(&handle.0)
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Pop every timer due at or before `now` and run its callback.
    ///
    /// The lock is released before the callbacks run. Returns the number of
    /// callbacks invoked.
    pub fn fire_expired(&self, now: Instant) -> usize {
        let due = {
            let mut state = self.inner.state.lock();
            let mut due = Vec::new();
            while let Some(entry) = state.queue.first_entry() {
                if entry.key().expiry > now {
                    break;
                }
                let (key, callback) = entry.remove_entry();
                state.index.remove(&key.id);
                due.push((key.id, callback));
            }
            due
        };

        let fired = due.len();
        for (id, callback) in due {
            trace!(timer = id, "Timer fired");
            callback();
        }
        fired
    }

    /// Cancel every pending timer and stop the worker
    pub async fn shutdown(&self) {
        let cancelled = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.index.clear();
            std::mem::take(&mut state.queue).len()
        };
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }
        debug!(cancelled, "Timer wheel shut down");
    }

    /// Whether [`TimerWheel::shutdown`] was called
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("pending", &self.pending())
            .finish()
    }
}

async fn run_worker(inner: Weak<WheelInner>) {
    let mut ticker = time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let wheel = TimerWheel { inner };
        if wheel.is_shutdown() {
            break;
        }
        wheel.fire_expired(Instant::now());
    }
}
