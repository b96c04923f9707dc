use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::controllers::Context;
use crate::reconcilers::timestamps;
use crate::reconcilers::virtual_machines::taint_virtual_machine;
use crate::resources::progress::Progress;
use crate::resources::sessions::Session;
use crate::resources::virtualmachineclaims::VirtualMachineClaim;
use crate::resources::{bool_label, FINISHED_LABEL, SESSION_LABEL, TAINTED_LABEL};
use crate::runtime::retry::{update_status_with_retry, update_with_retry};
use crate::runtime::{Action, Controller, ObjectKey, Terms};
use crate::store::{delete_if_exists, labels_selector, ObjectStore};
use crate::{telemetry, Result};

pub const USER_INDEX: &str = "user";
pub const ACCESS_CODE_INDEX: &str = "accesscode";

#[instrument(skip(ctx), fields(trace_id))]
pub async fn reconcile<S: ObjectStore>(key: ObjectKey, ctx: Arc<Context<S>>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Session>();
    ctx.touch().await;

    let Some(session) = ctx.store.get::<Session>(&key.namespace, &key.name).await? else {
        debug!("Session {key} is gone");
        return Ok(Action::await_change());
    };

    session.reconcile(&ctx).await.inspect_err(|err| {
        if !err.is_not_found() {
            ctx.metrics.reconcile_failure(&session, err);
        }
    })
}

impl Session {
    async fn reconcile<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<Action> {
        let name = self.name_any();
        let now = ctx.clock.now();
        let retention = ctx.settings.session.retention;

        let Some(expiration) = self.expiration()? else {
            return self.start(ctx, now).await;
        };

        // past the last representable instant a session is never purged
        let purge_at = timestamps::checked_after(expiration, retention);

        if self.is_finished() {
            return match purge_at {
                Some(purge_at) if purge_at <= now => {
                    self.purge(ctx).await?;
                    Ok(Action::await_change())
                }
                Some(purge_at) => Ok(Action::requeue(ctx.clock.until(purge_at))),
                None => Ok(Action::await_change()),
            };
        }

        if expiration <= now {
            if let Some(paused_until) = self.paused_until()? {
                if paused_until > now {
                    debug!("Session {name} expired while paused until {paused_until}");
                    return Ok(Action::requeue(ctx.clock.until(paused_until)));
                }
            }
            self.finish(ctx).await?;
            return Ok(purge_at.map_or_else(Action::await_change, |purge_at| {
                Action::requeue(ctx.clock.until(purge_at))
            }));
        }

        Ok(Action::requeue(ctx.clock.until(expiration)))
    }

    /// Gives a fresh session its first lease
    async fn start<S: ObjectStore>(&self, ctx: &Context<S>, now: DateTime<Utc>) -> Result<Action> {
        let new_duration = ctx.settings.session.new_duration;
        let start_time = timestamps::format(now);
        let expiration_time = timestamps::format(timestamps::saturating_after(now, new_duration));

        info!("Starting Session {}", self.name_any());
        update_status_with_retry::<Session, _, _>(
            &ctx.store,
            ctx.namespace(),
            &self.name_any(),
            |session| {
                let status = session.status.get_or_insert_with(Default::default);
                if !status.expiration_time.is_empty() {
                    return false;
                }
                if status.start_time.is_empty() {
                    status.start_time = start_time.clone();
                }
                status.expiration_time = expiration_time.clone();
                status.active = true;
                true
            },
        )
        .await?;
        Ok(Action::requeue(new_duration))
    }

    /// Claims named by the session plus any labelled with it
    async fn claim_names<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<BTreeSet<String>> {
        let name = self.name_any();
        let mut claims: BTreeSet<String> = self.spec.vm_claim_set.iter().cloned().collect();
        claims.extend(
            ctx.store
                .list::<VirtualMachineClaim>(
                    ctx.namespace(),
                    &labels_selector([(SESSION_LABEL, name.as_str())]),
                )
                .await?
                .iter()
                .map(ResourceExt::name_any),
        );
        Ok(claims)
    }

    /// Taints the session's claims and machines and marks everything finished
    async fn finish<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<()> {
        let ns = ctx.namespace();
        let name = self.name_any();
        info!("Session {name} expired, finishing it");

        for claim_name in self.claim_names(ctx).await? {
            let Some(claim) = ctx.store.get::<VirtualMachineClaim>(ns, &claim_name).await? else {
                continue;
            };
            for vm_id in claim.bound_vm_ids() {
                ignore_not_found(taint_virtual_machine(&ctx.store, ns, vm_id, false).await)?;
            }
            ignore_not_found(taint_claim(ctx, &claim_name).await)?;
        }

        let progress: Vec<Progress> = ctx
            .store
            .list(ns, &labels_selector([(SESSION_LABEL, name.as_str())]))
            .await?;
        for p in progress {
            let result = update_with_retry::<Progress, _, _>(&ctx.store, ns, &p.name_any(), |p| {
                let finished = bool_label(true);
                if p.labels().get(FINISHED_LABEL) == Some(&finished) && p.spec.finished == finished {
                    return false;
                }
                p.labels_mut().insert(FINISHED_LABEL.to_owned(), finished.clone());
                p.spec.finished = finished;
                true
            })
            .await;
            ignore_not_found(result.map(|_| ()))?;
        }

        update_status_with_retry::<Session, _, _>(&ctx.store, ns, &name, |session| {
            let status = session.status.get_or_insert_with(Default::default);
            if status.finished && !status.active {
                return false;
            }
            status.finished = true;
            status.active = false;
            true
        })
        .await?;
        Ok(())
    }

    /// Drops a long finished session together with its claims
    async fn purge<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<()> {
        let ns = ctx.namespace();
        for claim in self.claim_names(ctx).await? {
            debug!("Deleting VirtualMachineClaim {claim}");
            delete_if_exists::<VirtualMachineClaim, _>(&ctx.store, ns, &claim).await?;
        }
        info!("Deleting finished Session {}", self.name_any());
        delete_if_exists::<Session, _>(&ctx.store, ns, &self.name_any()).await?;
        Ok(())
    }
}

async fn taint_claim<S: ObjectStore>(ctx: &Context<S>, name: &str) -> Result<()> {
    let ns = ctx.namespace();
    update_status_with_retry::<VirtualMachineClaim, _, _>(&ctx.store, ns, name, |claim| {
        let status = claim.status.get_or_insert_with(Default::default);
        if status.tainted {
            return false;
        }
        status.tainted = true;
        true
    })
    .await?;
    update_with_retry::<VirtualMachineClaim, _, _>(&ctx.store, ns, name, |claim| {
        let tainted = bool_label(true);
        if claim.labels().get(TAINTED_LABEL) == Some(&tainted) {
            return false;
        }
        claim.labels_mut().insert(TAINTED_LABEL.to_owned(), tainted);
        true
    })
    .await?;
    Ok(())
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Initialize the controller
pub async fn run<S: ObjectStore>(ctx: Arc<Context<S>>, token: CancellationToken, terms: Terms) {
    Controller::<Session, S>::new(ctx.store.clone(), ctx.namespace(), ctx.queue("session"))
        .index(USER_INDEX, |session| vec![session.spec.user_id.clone()])
        .index(ACCESS_CODE_INDEX, |session| vec![session.spec.access_code.clone()])
        .workers(ctx.settings.workers)
        .resync_period(ctx.settings.resync_period)
        .run(reconcile, ctx, token, terms)
        .await
}
