//! Delay-and-coalesce scheduling per named channel.
//!
//! Scheduling work on a channel cancels whatever is still waiting on that channel and
//! starts a fresh quiet period. Only the most recent call within the window runs. Once a
//! call has started running it is no longer pending and is not cancelled by later triggers.
//! Dropping the last handle to a [`Debouncer`], or calling [`Debouncer::cancel_all`],
//! guarantees nothing pending will fire.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

struct Pending {
    ticket: u64,
    handle: JoinHandle<()>,
}

struct Shared {
    pending: Mutex<HashMap<String, Pending>>,
    next_ticket: AtomicU64,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let pending = self
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, p) in pending.drain() {
            p.handle.abort();
        }
    }
}

/// Per-channel debounce scheduler. Cloning yields another handle to the same channels.
#[derive(Clone)]
pub struct Debouncer {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl Debouncer {
    /// Create a scheduler that runs its delayed work on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
            }),
            runtime,
        }
    }

    /// Run `task` after `delay` of inactivity on `channel`, replacing anything pending there.
    pub fn schedule<F>(&self, channel: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let key = channel.to_owned();

        // Hold the lock across spawn + insert so the task cannot observe the map before its
        // own entry is in it.
        let mut pending = self.shared.pending();

        let task_key = key.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut pending = shared.pending();
                match pending.get(&task_key) {
                    Some(p) if p.ticket == ticket => {
                        pending.remove(&task_key);
                    }
                    _ => return,
                }
            }
            drop(shared);

            task.await;
        });

        if let Some(previous) = pending.insert(key, Pending { ticket, handle }) {
            previous.handle.abort();
        }
    }

    /// Build a reusable trigger bound to one channel and delay.
    ///
    /// Each [`Trigger::call`] builds the work from its arguments and schedules it, so only
    /// the arguments of the last call in a quiet window are ever used.
    pub fn debounce<F>(&self, channel: impl Into<String>, delay: Duration, f: F) -> Trigger<F> {
        Trigger {
            debouncer: self.clone(),
            channel: channel.into(),
            delay,
            f: Arc::new(f),
        }
    }

    /// Cancel whatever is pending on `channel`. Returns true if something was cancelled.
    pub fn cancel(&self, channel: &str) -> bool {
        match self.shared.pending().remove(channel) {
            Some(p) => {
                p.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending call on every channel.
    pub fn cancel_all(&self) {
        let mut pending = self.shared.pending();
        for (_, p) in pending.drain() {
            p.handle.abort();
        }
    }

    pub fn is_pending(&self, channel: &str) -> bool {
        self.shared.pending().contains_key(channel)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }
}

/// A debounced function bound to one channel. See [`Debouncer::debounce`].
pub struct Trigger<F> {
    debouncer: Debouncer,
    channel: String,
    delay: Duration,
    f: Arc<F>,
}

impl<F> Clone for Trigger<F> {
    fn clone(&self) -> Self {
        Self {
            debouncer: self.debouncer.clone(),
            channel: self.channel.clone(),
            delay: self.delay,
            f: Arc::clone(&self.f),
        }
    }
}

impl<F> Trigger<F> {
    pub fn call<A, Fut>(&self, args: A)
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let work = (*self.f)(args);
        self.debouncer.schedule(&self.channel, self.delay, work);
    }

    pub fn cancel(&self) -> bool {
        self.debouncer.cancel(&self.channel)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}
