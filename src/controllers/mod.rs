use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::runtime::{Clock, Terms, WorkQueue};
use crate::store::ObjectStore;
use crate::Metrics;

pub mod dynamicbind;
pub mod scheduledevent;
pub mod session;
pub mod vmclaim;
pub mod vmset;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Whether this instance currently runs the controllers
    pub leader: bool,
    pub identity: String,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            leader: false,
            identity: String::new(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    pub settings: Arc<Settings>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(settings: Settings) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics {
                identity: settings.leader.identity.clone(),
                ..Default::default()
            })),
            registry: prometheus::Registry::default(),
            settings: Arc::new(settings),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Everything a reconcile function may touch
pub struct Context<S: ObjectStore> {
    pub store: S,
    pub settings: Arc<Settings>,
    pub clock: Clock,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Claims that could not be bound from a pool
    pub dynamic_bind_queue: WorkQueue,
}

impl<S: ObjectStore> Context<S> {
    /// Must be called within a tokio runtime
    pub fn new(store: S, state: &State, metrics: Metrics, clock: Clock) -> Arc<Self> {
        let settings = state.settings.clone();
        Arc::new(Self {
            dynamic_bind_queue: WorkQueue::new(
                "dynamicbind",
                settings.queue_base_delay,
                settings.queue_max_delay,
            ),
            store,
            settings,
            clock,
            metrics,
            diagnostics: state.diagnostics.clone(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    pub(crate) fn queue(&self, name: &str) -> WorkQueue {
        WorkQueue::new(
            name,
            self.settings.queue_base_delay,
            self.settings.queue_max_delay,
        )
    }

    pub(crate) async fn touch(&self) {
        self.diagnostics.write().await.last_event = self.clock.now();
    }
}

/// Runs every controller until `token` is cancelled. Caches are kept for the
/// whole run; reconcilers only work during the terms handed out by `terms`.
pub async fn run_all<S: ObjectStore>(ctx: Arc<Context<S>>, token: CancellationToken, terms: Terms) {
    info!(namespace = %ctx.namespace(), "starting controllers");
    tokio::join!(
        scheduledevent::run(ctx.clone(), token.clone(), terms.clone()),
        vmset::run(ctx.clone(), token.clone(), terms.clone()),
        vmclaim::run(ctx.clone(), token.clone(), terms.clone()),
        dynamicbind::run(ctx.clone(), token.clone(), terms.clone()),
        dynamicbind::run_orphan_sweep(ctx.clone(), token.clone(), terms.clone()),
        session::run(ctx.clone(), token.clone(), terms),
    );
    ctx.dynamic_bind_queue.shutdown();
    info!("controllers stopped");
}
