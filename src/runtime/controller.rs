use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{Action, Cache, CacheWriter, ObjectKey, Terms, WorkQueue};
use crate::store::{Object, ObjectStore, WatchEvent};
use crate::{Error, Result};

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Drives reconciliation of one kind: watches feed the cache and the queue,
/// workers pop keys and call the reconcile function.
pub struct Controller<K: Object, S: ObjectStore> {
    store: S,
    namespace: String,
    queue: WorkQueue,
    cache: Cache<K>,
    writer: CacheWriter<K>,
    triggers: SelectAll<BoxStream<'static, Vec<ObjectKey>>>,
    workers: usize,
    resync_period: Duration,
    enqueue_primary: bool,
}

impl<K: Object, S: ObjectStore> Controller<K, S> {
    pub fn new(store: S, namespace: &str, queue: WorkQueue) -> Self {
        let (cache, writer) = Cache::new();
        Self {
            store,
            namespace: namespace.to_owned(),
            queue,
            cache,
            writer,
            triggers: SelectAll::new(),
            workers: 1,
            resync_period: DEFAULT_RESYNC_PERIOD,
            enqueue_primary: true,
        }
    }

    /// Adds a named index to the cache of the primary kind
    pub fn index(self, name: &str, f: impl Fn(&K) -> Vec<String> + Send + Sync + 'static) -> Self {
        self.writer.add_index(name, f);
        self
    }

    pub fn cache(&self) -> Cache<K> {
        self.cache.clone()
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Reconciles the owner whenever an object of kind `C` owned by a `K` changes
    pub fn owns<C: Object>(self) -> Self {
        let kind = K::kind(&()).into_owned();
        self.watches::<C>(move |child| {
            let namespace = child.meta().namespace.clone().unwrap_or_default();
            child
                .meta()
                .owner_references
                .iter()
                .flatten()
                .filter(|r| r.kind == kind)
                .map(|r| ObjectKey::new(namespace.clone(), r.name.clone()))
                .collect()
        })
    }

    /// Reconciles whatever `mapper` returns whenever an object of kind `W` changes
    pub fn watches<W: Object>(
        mut self,
        mapper: impl Fn(&W) -> Vec<ObjectKey> + Send + Sync + 'static,
    ) -> Self {
        let kind = W::kind(&()).into_owned();
        let stream = self
            .store
            .watch::<W>(&self.namespace)
            .filter_map(move |event| {
                let keys = match event {
                    Ok(WatchEvent::Applied(obj)) | Ok(WatchEvent::Deleted(obj)) => mapper(&obj),
                    Ok(WatchEvent::Restarted(objs)) => objs.iter().flat_map(&mapper).collect(),
                    Err(e) => {
                        warn!(%kind, "watch failed: {e}");
                        Vec::new()
                    }
                };
                futures::future::ready((!keys.is_empty()).then_some(keys))
            })
            .boxed();
        self.triggers.push(stream);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Keeps the primary cache up to date without enqueueing its changes;
    /// keys then only arrive through the queue or secondary watches
    pub fn enqueue_primary(mut self, enqueue: bool) -> Self {
        self.enqueue_primary = enqueue;
        self
    }

    /// Runs until `token` is cancelled, then shuts the queue down.
    ///
    /// Watches and the cache run throughout. Workers only run while `terms`
    /// hands out a live term and stop, aborting in-flight reconciles, when it ends.
    pub async fn run<C, F, Fut>(
        self,
        reconcile: F,
        ctx: Arc<C>,
        token: CancellationToken,
        mut terms: Terms,
    ) where
        C: Send + Sync + 'static,
        F: Fn(ObjectKey, Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Action>> + Send + 'static,
    {
        let kind = K::kind(&()).into_owned();
        let Controller {
            store,
            namespace,
            queue,
            cache,
            writer,
            mut triggers,
            workers,
            resync_period,
            enqueue_primary,
        } = self;

        let mut tasks = JoinSet::new();

        // primary watch feeds the cache
        {
            let queue = queue.clone();
            let token = token.clone();
            let kind = kind.clone();
            let mut events = store.watch::<K>(&namespace);
            tasks.spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = token.cancelled() => break,
                        event = events.next() => event,
                    };
                    match event {
                        Some(Ok(event)) => {
                            writer.apply(&event);
                            if !enqueue_primary {
                                continue;
                            }
                            match &event {
                                WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => {
                                    queue.add(ObjectKey::of(obj))
                                }
                                WatchEvent::Restarted(objs) => {
                                    objs.iter().for_each(|o| queue.add(ObjectKey::of(o)))
                                }
                            }
                        }
                        Some(Err(e)) => warn!(%kind, "watch failed: {e}"),
                        None => break,
                    }
                }
            });
        }

        // secondary watches
        {
            let queue = queue.clone();
            let token = token.clone();
            tasks.spawn(async move {
                if triggers.is_empty() {
                    return;
                }
                loop {
                    let keys = tokio::select! {
                        _ = token.cancelled() => break,
                        keys = triggers.next() => keys,
                    };
                    match keys {
                        Some(keys) => keys.into_iter().for_each(|k| queue.add(k)),
                        None => break,
                    }
                }
            });
        }

        // periodic resync of everything cached
        if enqueue_primary {
            let queue = queue.clone();
            let token = token.clone();
            let cache = cache.clone();
            tasks.spawn(async move {
                let mut ticker = interval_at(Instant::now() + resync_period, resync_period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            debug!(queue = %queue.name(), "resync");
                            cache.keys().into_iter().for_each(|k| queue.add(k));
                        }
                    }
                }
            });
        }

        let reconcile = Arc::new(reconcile);
        {
            let queue = queue.clone();
            let token = token.clone();
            let kind = kind.clone();
            tasks.spawn(async move {
                while let Some(term) = terms.next(&token).await {
                    debug!(%kind, workers, "term started");
                    let mut pool = JoinSet::new();
                    for worker in 0..workers {
                        pool.spawn(work(
                            queue.clone(),
                            term.clone(),
                            ctx.clone(),
                            reconcile.clone(),
                            kind.clone(),
                            worker,
                        ));
                    }
                    while pool.join_next().await.is_some() {}
                    debug!(%kind, "term ended");
                }
            });
        }

        info!(%kind, workers, "controller started");
        token.cancelled().await;
        queue.shutdown();
        while tasks.join_next().await.is_some() {}
        info!(%kind, "controller stopped");
    }
}

async fn work<C, F, Fut>(
    queue: WorkQueue,
    term: CancellationToken,
    ctx: Arc<C>,
    reconcile: Arc<F>,
    kind: String,
    worker: usize,
) where
    F: Fn(ObjectKey, Arc<C>) -> Fut,
    Fut: Future<Output = Result<Action>>,
{
    loop {
        let key = tokio::select! {
            _ = term.cancelled() => break,
            key = queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };
        let span = tracing::info_span!("reconcile", %kind, object = %key, worker);
        let result = tokio::select! {
            _ = term.cancelled() => {
                // picked up again by the next term
                queue.done(&key);
                queue.add(key);
                break;
            }
            result = reconcile(key.clone(), ctx.clone()).instrument(span) => result,
        };
        handle_result(&queue, &kind, key.clone(), result);
        queue.done(&key);
    }
}

fn handle_result(queue: &WorkQueue, kind: &str, key: ObjectKey, result: Result<Action>) {
    match result {
        Ok(action) => {
            queue.forget(&key);
            if let Some(after) = action.requeue_after() {
                queue.add_after(key, after);
            }
        }
        Err(e) if e.is_not_found() => {
            debug!(%kind, object = %key, "gone: {e}");
            queue.forget(&key);
        }
        Err(Error::NotReady {
            requeue_after: Some(after),
            ..
        }) => queue.add_after(key, after),
        Err(e @ Error::NotReady { .. }) => {
            debug!(%kind, object = %key, "{e}");
            queue.add_rate_limited(key);
        }
        Err(e) if e.is_permanent() => {
            info!(%kind, object = %key, "not retrying until changed: {e}");
            queue.forget(&key);
        }
        Err(e) => {
            warn!(%kind, object = %key, "reconcile failed: {e}");
            queue.add_rate_limited(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::virtualmachinesets::VirtualMachineSet;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn reconciles_existing_and_new_objects() {
        let store = MemoryStore::default();
        store
            .create("hf", &VirtualMachineSet::new("a", Default::default()))
            .await
            .unwrap();

        let queue = WorkQueue::new("vmset", Duration::from_millis(5), Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let controller = Controller::<VirtualMachineSet, _>::new(store.clone(), "hf", queue);
        let cache = controller.cache();

        let run = tokio::spawn(controller.run(
            |_key, calls: Arc<AtomicU32>| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Action::await_change())
            },
            calls.clone(),
            token.clone(),
            Terms::single(token.clone()),
        ));

        store
            .create("hf", &VirtualMachineSet::new("b", Default::default()))
            .await
            .unwrap();

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) >= 2 && cache.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(cache.len(), 2);

        token.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn cache_fills_without_a_term_and_workers_follow_the_lease() {
        let store = MemoryStore::default();
        let queue = WorkQueue::new("vmset", Duration::from_millis(5), Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let (terms, publisher) = Terms::new();
        let controller = Controller::<VirtualMachineSet, _>::new(store.clone(), "hf", queue);
        let cache = controller.cache();

        let run = tokio::spawn(controller.run(
            |_key, calls: Arc<AtomicU32>| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Action::await_change())
            },
            calls.clone(),
            token.clone(),
            terms,
        ));

        store
            .create("hf", &VirtualMachineSet::new("a", Default::default()))
            .await
            .unwrap();
        for _ in 0..100 {
            if cache.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // the key queued while standing by is reconciled once leading
        let term = token.child_token();
        publisher.publish(term.clone());
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        term.cancel();
        publisher.withdraw();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .create("hf", &VirtualMachineSet::new("b", Default::default()))
            .await
            .unwrap();
        for _ in 0..100 {
            if cache.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        token.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn errors_back_off_and_permanent_errors_are_dropped() {
        let queue = WorkQueue::new("t", Duration::from_millis(5), Duration::from_secs(1));
        let key = ObjectKey::new("hf", "a");

        handle_result(&queue, "T", key.clone(), Err(Error::StoreUnavailable("x".into())));
        assert_eq!(queue.num_requeues(&key), 1);

        handle_result(&queue, "T", key.clone(), Err(Error::InvalidSpec("bad".into())));
        assert_eq!(queue.num_requeues(&key), 0);

        handle_result(&queue, "T", key.clone(), Ok(Action::await_change()));
        assert_eq!(queue.num_requeues(&key), 0);
    }
}
