use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::trace;

use super::ObjectKey;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);
/// Longest delay a delayed add waits; longer ones fire early and are rescheduled by the reconciler
pub const LONGEST_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    /// Keys waiting to be processed; a key is never queued twice
    dirty: HashSet<ObjectKey>,
    /// Keys handed out and not yet `done`
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    delayed: mpsc::UnboundedSender<(ObjectKey, Duration)>,
    base_delay: Duration,
    max_delay: Duration,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, key: ObjectKey) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // re-queued by `done`
            return;
        }
        trace!(queue = %self.name, %key, "queued");
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }
}

/// A rate limited, de-duplicating work queue of object keys.
///
/// A key is handed to at most one worker at a time. Adding a key while it is
/// being processed marks it dirty so that it is processed again after `done`.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Must be called within a tokio runtime; spawns the delayed-add pump
    pub fn new(name: impl Into<String>, base_delay: Duration, max_delay: Duration) -> Self {
        let (delayed, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            delayed,
            base_delay,
            max_delay,
        });
        tokio::spawn(pump(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn add(&self, key: ObjectKey) {
        self.shared.add(key)
    }

    /// Adds the key once `delay` has passed. Of several pending delayed adds for
    /// one key the earliest wins.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        if self.shared.state().shutting_down {
            return;
        }
        // the pump only stops once every handle is gone
        let _ = self.shared.delayed.send((key, delay.min(LONGEST_DELAY)));
    }

    /// Adds the key after a per-key exponential backoff
    pub fn add_rate_limited(&self, key: ObjectKey) {
        let delay = {
            let mut state = self.shared.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = backoff(self.shared.base_delay, self.shared.max_delay, *failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay)
    }

    /// Resets the backoff of a key
    pub fn forget(&self, key: &ObjectKey) {
        self.shared.state().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.shared.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.shared.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key handed out by `get` as finished
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.shared.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stops accepting keys; `get` drains what is queued and then returns `None`
    pub fn shutdown(&self) {
        self.shared.state().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state().shutting_down
    }

    pub fn len(&self) -> usize {
        self.shared.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

async fn pump(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<(ObjectKey, Duration)>) {
    let mut delays: DelayQueue<ObjectKey> = DelayQueue::new();
    let mut pending: HashMap<ObjectKey, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some((key, delay)) = msg else { break };
                let deadline = Instant::now() + delay;
                match pending.get(&key) {
                    Some(existing) if delays.deadline(existing) <= deadline => {}
                    Some(existing) => delays.reset(existing, delay),
                    None => {
                        let entry = delays.insert(key.clone(), delay);
                        pending.insert(key, entry);
                    }
                }
            }
            Some(expired) = delays.next() => {
                let key = expired.into_inner();
                pending.remove(&key);
                match shared.upgrade() {
                    Some(shared) => shared.add(key),
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("hf", name)
    }

    fn queue() -> WorkQueue {
        WorkQueue::new("test", DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    #[tokio::test]
    async fn coalesces_queued_keys() {
        let q = queue();
        q.add(key("a"));
        q.add(key("a"));
        q.add(key("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, Some(key("b")));
    }

    #[tokio::test]
    async fn re_adds_key_changed_while_processing() {
        let q = queue();
        q.add(key("a"));
        let k = q.get().await.unwrap();
        q.add(key("a"));
        // not handed out twice concurrently
        assert!(q.is_empty());
        q.done(&k);
        assert_eq!(q.get().await, Some(key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_fires_at_earliest_deadline() {
        let q = queue();
        q.add_after(key("a"), Duration::from_secs(60));
        q.add_after(key("a"), Duration::from_secs(10));
        q.add_after(key("a"), Duration::from_secs(30));

        let start = Instant::now();
        assert_eq!(q.get().await, Some(key("a")));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn far_future_delays_are_capped() {
        let q = queue();
        q.add_after(key("a"), Duration::MAX);
        q.add_after(key("a"), Duration::from_secs(10));

        let start = Instant::now();
        assert_eq!(q.get().await, Some(key("a")));
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let base = DEFAULT_BASE_DELAY;
        let max = DEFAULT_MAX_DELAY;
        assert_eq!(backoff(base, max, 0), Duration::from_millis(5));
        assert_eq!(backoff(base, max, 1), Duration::from_millis(10));
        assert_eq!(backoff(base, max, 4), Duration::from_millis(80));
        assert_eq!(backoff(base, max, 30), max);
        assert_eq!(backoff(base, max, 200), max);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_until_forgotten() {
        let q = queue();
        q.add_rate_limited(key("a"));
        q.add_rate_limited(key("a"));
        assert_eq!(q.num_requeues(&key("a")), 2);
        assert_eq!(q.get().await, Some(key("a")));
        q.forget(&key("a"));
        assert_eq!(q.num_requeues(&key("a")), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_then_ends() {
        let q = queue();
        q.add(key("a"));
        q.shutdown();
        q.add(key("b"));
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_idle_workers() {
        let q = queue();
        let worker = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(worker.await.unwrap(), None);
    }
}
