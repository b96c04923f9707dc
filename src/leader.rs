//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! Every write is a compare-and-swap on the lease's resourceVersion, so two
//! instances racing for an expired lease cannot both win. The lease lives in
//! the same [`ObjectStore`] as everything else.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::config::LeaderSettings;
use crate::controllers::{Diagnostics, State};
use crate::reconcilers::timestamps::to_chrono;
use crate::runtime::Clock;
use crate::store::ObjectStore;
use crate::{Error, Result};

/// Runs a callback for every term this instance holds the lease
pub struct LeaderElector<S: ObjectStore> {
    store: S,
    namespace: String,
    settings: LeaderSettings,
    clock: Clock,
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl<S: ObjectStore> LeaderElector<S> {
    pub fn new(store: S, state: &State, clock: Clock) -> Self {
        Self {
            store,
            namespace: state.settings.namespace.clone(),
            settings: state.settings.leader.clone(),
            clock,
            diagnostics: state.diagnostics.clone(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.settings.identity
    }

    /// Campaigns until `token` is cancelled.
    ///
    /// Each won term calls `on_term` with a child token that is cancelled when
    /// the lease is lost or on shutdown; the term ends once the callback returns.
    /// On shutdown the lease is released so another instance can take over at once.
    pub async fn run<F, Fut>(&self, token: CancellationToken, mut on_term: F)
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        while self.acquire(&token).await {
            self.set_leader(true).await;
            let term = token.child_token();
            let ((), lost) = tokio::join!(on_term(term.clone()), self.hold(&term));
            self.set_leader(false).await;

            if !lost {
                if let Err(e) = self.release().await {
                    warn!(identity = %self.identity(), "Failed to release lease: {e}");
                }
                break;
            }
            warn!(identity = %self.identity(), "Leadership lost, campaigning again");
        }
    }

    /// Blocks until the lease is ours. False if `token` was cancelled first.
    async fn acquire(&self, token: &CancellationToken) -> bool {
        info!(
            identity = %self.identity(),
            lease = %self.settings.lock_name,
            "Waiting for leadership"
        );
        loop {
            if token.is_cancelled() {
                return false;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity(), "Leadership acquired");
                    return true;
                }
                Ok(false) => trace!(identity = %self.identity(), "Lease held by another instance"),
                Err(e) => warn!(identity = %self.identity(), "Failed to acquire lease: {e}"),
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = sleep(self.settings.retry_period) => {}
            }
        }
    }

    /// Renews every retry period while `term` is live. True if leadership was lost.
    ///
    /// A renewal that has not succeeded within the renew deadline, including one
    /// still waiting on the store, ends the term.
    async fn hold(&self, term: &CancellationToken) -> bool {
        let mut deadline = Instant::now() + self.settings.renew_deadline;
        loop {
            tokio::select! {
                _ = term.cancelled() => return false,
                _ = sleep(self.settings.retry_period) => {}
            }
            match timeout_at(deadline, self.renew()).await {
                Ok(Ok(())) => deadline = Instant::now() + self.settings.renew_deadline,
                Ok(Err(e @ Error::LeaseError(_))) => {
                    warn!(identity = %self.identity(), "{e}");
                    term.cancel();
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(identity = %self.identity(), "Failed to renew lease: {e}");
                    if Instant::now() >= deadline {
                        warn!(identity = %self.identity(), "No renewal within the deadline");
                        term.cancel();
                        return true;
                    }
                }
                Err(_) => {
                    warn!(identity = %self.identity(), "Lease renewal still pending at the deadline");
                    term.cancel();
                    return true;
                }
            }
        }
    }

    async fn renew(&self) -> Result<()> {
        if self.try_acquire_or_renew().await? {
            Ok(())
        } else {
            Err(Error::LeaseError(format!(
                "lease {} was taken over",
                self.settings.lock_name
            )))
        }
    }

    /// One election round: create, renew or take over the lease.
    /// False when another live holder has it or a concurrent write won.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = self.clock.now();
        let Some(lease) = self
            .store
            .get::<Lease>(&self.namespace, &self.settings.lock_name)
            .await?
        else {
            return self.create_lease(now).await;
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.as_deref().filter(|h| !h.is_empty());

        if holder == Some(self.identity()) {
            let mut renewed = lease;
            renewed.spec.get_or_insert_with(Default::default).renew_time = Some(MicroTime(now));
            return self.write(renewed, "renewed").await;
        }

        if holder.is_some() && !self.is_expired(&spec, now) {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        let mut taken = lease;
        taken.spec = Some(self.lease_spec(now, transitions));
        let acquired = self.write(taken, "taken over").await?;
        if acquired {
            info!(identity = %self.identity(), transitions, "Took over expired lease");
        }
        Ok(acquired)
    }

    fn is_expired(&self, spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
        match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(renewed), Some(secs)) => renewed
                .0
                .checked_add_signed(chrono::Duration::seconds(secs.into()))
                .is_some_and(|deadline| deadline < now),
            _ => true,
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity().to_owned()),
            lease_duration_seconds: Some(
                i32::try_from(self.settings.lease_duration.as_secs()).unwrap_or(i32::MAX),
            ),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.settings.lock_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)),
        };
        match self.store.create(&self.namespace, &lease).await {
            Ok(_) => {
                info!(identity = %self.identity(), "Created lease {}", self.settings.lock_name);
                Ok(true)
            }
            Err(e) if e.is_already_exists() => {
                debug!(identity = %self.identity(), "Lease created concurrently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Compare-and-swap write; a conflict means somebody else wrote first
    async fn write(&self, lease: Lease, what: &str) -> Result<bool> {
        match self.store.replace(&self.namespace, &lease).await {
            Ok(_) => {
                trace!(identity = %self.identity(), "Lease {what}");
                Ok(true)
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(identity = %self.identity(), "Lease changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Clears the holder and backdates the renew time so the lease is free immediately
    pub async fn release(&self) -> Result<()> {
        let Some(mut lease) = self
            .store
            .get::<Lease>(&self.namespace, &self.settings.lock_name)
            .await?
        else {
            return Ok(());
        };
        let spec = lease.spec.get_or_insert_with(Default::default);
        if spec.holder_identity.as_deref() != Some(self.identity()) {
            debug!(identity = %self.identity(), "Not the lease holder, nothing to release");
            return Ok(());
        }
        let backdated = self
            .clock
            .now()
            .checked_sub_signed(to_chrono(self.settings.lease_duration))
            .and_then(|t| t.checked_sub_signed(chrono::Duration::seconds(1)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        spec.holder_identity = None;
        spec.renew_time = Some(MicroTime(backdated));

        if self.write(lease, "released").await? {
            info!(identity = %self.identity(), "Lease released");
        }
        Ok(())
    }

    async fn set_leader(&self, leader: bool) {
        self.diagnostics.write().await.leader = leader;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeZone;
    use futures::stream::BoxStream;
    use kube::core::Selector;

    use super::*;
    use crate::config::Settings;
    use crate::store::{MemoryStore, Object, WatchEvent};

    fn elector(store: &MemoryStore, clock: &Clock, identity: &str) -> LeaderElector<MemoryStore> {
        let mut settings = Settings::default();
        settings.leader.identity = identity.into();
        settings.leader.retry_period = Duration::from_millis(10);
        LeaderElector::new(store.clone(), &State::new(settings), clock.clone())
    }

    async fn lease(store: &MemoryStore) -> LeaseSpec {
        store
            .get::<Lease>("hobbyfarm", "controller-manager")
            .await
            .unwrap()
            .and_then(|l| l.spec)
            .unwrap()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn live_lease_excludes_others_until_it_expires() {
        let clock = Clock::manual(start());
        let store = MemoryStore::new(clock.clone());
        let a = elector(&store, &clock, "a");
        let b = elector(&store, &clock, "b");

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());

        clock.advance(chrono::Duration::seconds(30));
        assert!(a.try_acquire_or_renew().await.unwrap());
        clock.advance(chrono::Duration::seconds(60));
        assert!(!b.try_acquire_or_renew().await.unwrap());

        clock.advance(chrono::Duration::seconds(1));
        assert!(b.try_acquire_or_renew().await.unwrap());
        let spec = lease(&store).await;
        assert_eq!(spec.holder_identity.as_deref(), Some("b"));
        assert_eq!(spec.lease_transitions, Some(1));

        assert!(!a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_the_lease_immediately() {
        let clock = Clock::manual(start());
        let store = MemoryStore::new(clock.clone());
        let a = elector(&store, &clock, "a");
        let b = elector(&store, &clock, "b");

        assert!(a.try_acquire_or_renew().await.unwrap());
        b.release().await.unwrap();
        assert_eq!(lease(&store).await.holder_identity.as_deref(), Some("a"));

        a.release().await.unwrap();
        assert_eq!(lease(&store).await.holder_identity, None);
        assert!(b.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn terms_end_on_shutdown_and_release_the_lease() {
        let clock = Clock::manual(start());
        let store = MemoryStore::new(clock.clone());
        let a = elector(&store, &clock, "a");
        let diagnostics = a.diagnostics.clone();
        let token = CancellationToken::new();
        let terms = AtomicUsize::new(0);

        let campaign = a.run(token.clone(), |term| {
            terms.fetch_add(1, Ordering::SeqCst);
            let token = token.clone();
            let diagnostics = diagnostics.clone();
            async move {
                assert!(diagnostics.read().await.leader);
                token.cancel();
                term.cancelled().await;
            }
        });
        tokio::time::timeout(Duration::from_secs(5), campaign)
            .await
            .unwrap();

        assert_eq!(terms.load(Ordering::SeqCst), 1);
        assert!(!diagnostics.read().await.leader);
        assert_eq!(lease(&store).await.holder_identity, None);
    }

    #[tokio::test]
    async fn takeover_cancels_the_running_term() {
        let clock = Clock::manual(start());
        let store = MemoryStore::new(clock.clone());
        let a = elector(&store, &clock, "a");
        let b = elector(&store, &clock, "b");
        let token = CancellationToken::new();

        let campaign = a.run(token.clone(), |term| {
            let (store, clock, b, token) = (store.clone(), clock.clone(), &b, token.clone());
            async move {
                if lease_holder(&store).await.as_deref() == Some("a") && !token.is_cancelled() {
                    clock.advance(chrono::Duration::seconds(120));
                    assert!(b.try_acquire_or_renew().await.unwrap());
                    term.cancelled().await;
                    token.cancel();
                }
            }
        });
        tokio::time::timeout(Duration::from_secs(5), campaign)
            .await
            .unwrap();

        assert_eq!(lease_holder(&store).await.as_deref(), Some("b"));
    }

    /// Delegates to a [`MemoryStore`] until stalled; then reads never complete
    #[derive(Clone)]
    struct StallingStore {
        inner: MemoryStore,
        stalled: Arc<AtomicBool>,
    }

    impl StallingStore {
        fn stall(&self) {
            self.stalled.store(true, Ordering::SeqCst);
        }
    }

    impl ObjectStore for StallingStore {
        async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.get(namespace, name).await
        }

        async fn list<K: Object>(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>> {
            self.inner.list(namespace, selector).await
        }

        async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
            self.inner.create(namespace, obj).await
        }

        async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
            self.inner.replace(namespace, obj).await
        }

        async fn replace_status<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
            self.inner.replace_status(namespace, obj).await
        }

        async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
            self.inner.delete::<K>(namespace, name).await
        }

        fn watch<K: Object>(&self, namespace: &str) -> BoxStream<'static, Result<WatchEvent<K>>> {
            self.inner.watch(namespace)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_renewals_end_the_term_at_the_deadline() {
        let clock = Clock::manual(start());
        let store = StallingStore {
            inner: MemoryStore::new(clock.clone()),
            stalled: Arc::new(AtomicBool::new(false)),
        };
        let mut settings = Settings::default();
        settings.leader.identity = "a".into();
        settings.leader.retry_period = Duration::from_millis(10);
        settings.leader.renew_deadline = Duration::from_secs(1);
        let a = LeaderElector::new(store.clone(), &State::new(settings), clock.clone());
        let token = CancellationToken::new();
        let begun = Instant::now();

        let campaign = a.run(token.clone(), |term| {
            let (store, token) = (store.clone(), token.clone());
            async move {
                store.stall();
                term.cancelled().await;
                token.cancel();
            }
        });
        tokio::time::timeout(Duration::from_secs(5), campaign)
            .await
            .unwrap();

        let held = begun.elapsed();
        assert!(held >= Duration::from_secs(1), "term ended after {held:?}");
        assert!(held < Duration::from_secs(2), "term ended after {held:?}");
        assert!(!a.diagnostics.read().await.leader);
    }

    async fn lease_holder(store: &MemoryStore) -> Option<String> {
        lease(store).await.holder_identity
    }
}
