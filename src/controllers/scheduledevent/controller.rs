use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::*;

use super::reconcilers::capacity::check_capacity;
use super::reconcilers::children::{check_access_code, reconcile_children, release_children};
use super::reconcilers::completion::complete;
use crate::controllers::Context;
use crate::reconcilers::owner_ref;
use crate::resources::accesscodes::AccessCode;
use crate::resources::dynamicbindconfigurations::DynamicBindConfiguration;
use crate::resources::environments::{Environment, ResourceBudget, VirtualMachineTemplate};
use crate::resources::scheduledevents::{
    ScheduledEvent, ScheduledEventStatus, CONDITION_CAPACITY, CONDITION_VALID,
};
use crate::resources::virtualmachinesets::VirtualMachineSet;
use crate::runtime::retry::update_status_with_retry;
use crate::runtime::{Action, Controller, ObjectKey, Terms};
use crate::store::ObjectStore;
use crate::{telemetry, Error, Result};

pub const ACCESS_CODE_INDEX: &str = "accesscode";

#[instrument(skip(ctx), fields(trace_id))]
pub async fn reconcile<S: ObjectStore>(key: ObjectKey, ctx: Arc<Context<S>>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ScheduledEvent>();
    ctx.touch().await;

    let Some(se) = ctx
        .store
        .get::<ScheduledEvent>(&key.namespace, &key.name)
        .await?
    else {
        // children are garbage collected through their owner references
        debug!("ScheduledEvent {key} is gone");
        return Ok(Action::await_change());
    };

    info!("Reconciling ScheduledEvent \"{}\"", se.name_any());
    match se.reconcile(&ctx).await {
        Ok(action) => Ok(action),
        Err(err) => {
            if err.is_permanent() {
                warn!("ScheduledEvent {} is invalid: {err}", se.name_any());
                se.record_invalid(&ctx, &err).await?;
            }
            if !matches!(err, Error::NotReady { .. }) {
                ctx.metrics.reconcile_failure(&se, &err);
            }
            Err(err)
        }
    }
}

impl ScheduledEvent {
    async fn reconcile<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<Action> {
        let name = self.name_any();
        let now = ctx.clock.now();
        let status = self.status.clone().unwrap_or_default();
        let (start, end) = self.window()?;

        if status.finished {
            return Ok(Action::await_change());
        }

        // ending wins over everything else, active or not
        if now >= end {
            info!("ScheduledEvent {name} has ended");
            complete(ctx, self, now).await?;
            self.update_status(ctx, |status| {
                status.provisioned = true;
                status.ready = false;
                status.finished = true;
                status.virtual_machine_sets.clear();
            })
            .await?;
            return Ok(Action::await_change());
        }

        if status.provisioned && self.spec_changed(&status) {
            let moved_to_future = now < start;
            let on_demand_flipped = status
                .provisioned_on_demand
                .is_some_and(|on_demand| on_demand != self.spec.on_demand);
            let delete_vmsets = moved_to_future || on_demand_flipped;
            info!("ScheduledEvent {name} changed while provisioned, releasing its children (VMSets too: {delete_vmsets})");

            release_children(ctx, self, delete_vmsets).await?;
            self.update_status(ctx, |status| {
                status.provisioned = false;
                status.ready = false;
                status.finished = false;
                status.spec_hash = None;
                status.provisioned_on_demand = None;
                if delete_vmsets {
                    status.virtual_machine_sets.clear();
                }
            })
            .await?;
            return Ok(Action::requeue(Duration::ZERO));
        }

        let until_end = Action::requeue(ctx.clock.until(end));

        if !self.is_active() {
            return Ok(until_end);
        }

        if now < start {
            debug!("ScheduledEvent {name} starts at {start}");
            return Ok(Action::requeue(ctx.clock.until(start)));
        }

        let oref = owner_ref(self)?;

        if !status.provisioned {
            let (environments, templates) = self.resolve_references(ctx).await?;
            check_access_code(ctx, self).await?;

            let overruns = check_capacity(ctx, self, &environments, &templates).await?;
            for overrun in &overruns {
                warn!(
                    "ScheduledEvent {name} overcommits Environment {}: {}",
                    overrun.environment, overrun.detail
                );
                ctx.metrics.capacity_overcommitted(&overrun.environment);
            }

            let vmsets = reconcile_children(ctx, self, &oref, end).await?;
            let hash = self.spec_hash();
            let capacity_message = overruns
                .iter()
                .map(|o| format!("{}: {}", o.environment, o.detail))
                .collect::<Vec<_>>()
                .join("; ");

            info!("Provisioned ScheduledEvent {name} with {} VMSets", vmsets.len());
            self.update_status(ctx, |status| {
                status.provisioned = true;
                status.ready = false;
                status.finished = false;
                status.virtual_machine_sets = vmsets.clone();
                status.spec_hash = Some(hash.clone());
                status.provisioned_on_demand = Some(self.spec.on_demand);
                status.set_condition(CONDITION_VALID, true, "Provisioned", "children created", now);
                if overruns.is_empty() {
                    status.set_condition(CONDITION_CAPACITY, true, "Fits", "", now);
                } else {
                    status.set_condition(
                        CONDITION_CAPACITY,
                        false,
                        "Overcommitted",
                        capacity_message.clone(),
                        now,
                    );
                }
            })
            .await?;

            return Ok(until_end.or_sooner(Action::requeue(ctx.settings.provisioning_requeue)));
        }

        // recreate anything deleted from under us
        let vmsets = reconcile_children(ctx, self, &oref, end).await?;
        let ready = self.vmsets_ready(ctx, &vmsets).await?;
        if ready != status.ready || vmsets != status.virtual_machine_sets {
            if ready {
                info!("ScheduledEvent {name} is ready");
            }
            self.update_status(ctx, |status| {
                status.ready = ready;
                status.virtual_machine_sets = vmsets.clone();
            })
            .await?;
        }

        if ready {
            Ok(until_end)
        } else {
            Ok(until_end.or_sooner(Action::requeue(ctx.settings.provisioning_requeue)))
        }
    }

    fn spec_changed(&self, status: &ScheduledEventStatus) -> bool {
        status
            .spec_hash
            .as_deref()
            .is_some_and(|hash| hash != self.spec_hash())
    }

    /// Every referenced Environment and the cost of every referenced template
    async fn resolve_references<S: ObjectStore>(
        &self,
        ctx: &Context<S>,
    ) -> Result<(
        BTreeMap<String, Environment>,
        BTreeMap<String, ResourceBudget>,
    )> {
        if self.spec.access_code.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "ScheduledEvent {} has no access code",
                self.name_any()
            )));
        }

        let mut environments = BTreeMap::new();
        let mut templates = BTreeMap::new();
        for (env_name, required) in &self.spec.required_virtual_machines {
            let env = ctx
                .store
                .get::<Environment>(ctx.namespace(), env_name)
                .await?
                .ok_or_else(|| Error::InvalidSpec(format!("unknown environment {env_name}")))?;
            environments.insert(env_name.clone(), env);

            for template in required.keys() {
                if templates.contains_key(template) {
                    continue;
                }
                let vmt = ctx
                    .store
                    .get::<VirtualMachineTemplate>(ctx.namespace(), template)
                    .await?
                    .ok_or_else(|| Error::InvalidSpec(format!("unknown template {template}")))?;
                templates.insert(template.clone(), vmt.spec.resources);
            }
        }
        Ok((environments, templates))
    }

    async fn vmsets_ready<S: ObjectStore>(&self, ctx: &Context<S>, names: &[String]) -> Result<bool> {
        for name in names {
            match ctx.store.get::<VirtualMachineSet>(ctx.namespace(), name).await? {
                Some(set) if set.is_ready() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn update_status<S: ObjectStore>(
        &self,
        ctx: &Context<S>,
        mutate: impl Fn(&mut ScheduledEventStatus) + Send + Sync,
    ) -> Result<ScheduledEvent> {
        update_status_with_retry::<ScheduledEvent, _, _>(
            &ctx.store,
            ctx.namespace(),
            &self.name_any(),
            |se| {
                let before = se.status.clone();
                mutate(se.status.get_or_insert_with(Default::default));
                se.status != before
            },
        )
        .await
    }

    /// Surfaces a validation failure on the object; it is not retried until edited
    async fn record_invalid<S: ObjectStore>(&self, ctx: &Context<S>, err: &Error) -> Result<()> {
        let now = ctx.clock.now();
        let message = err.to_string();
        self.update_status(ctx, |status| {
            status.set_condition(CONDITION_VALID, false, err.metric_label(), message.clone(), now);
        })
        .await?;
        Ok(())
    }
}

/// Initialize the controller
pub async fn run<S: ObjectStore>(ctx: Arc<Context<S>>, token: CancellationToken, terms: Terms) {
    let controller = Controller::<ScheduledEvent, S>::new(
        ctx.store.clone(),
        ctx.namespace(),
        ctx.queue("scheduledevent"),
    )
    .index(ACCESS_CODE_INDEX, |se| vec![se.spec.access_code.clone()])
    .owns::<VirtualMachineSet>()
    .owns::<DynamicBindConfiguration>()
    .workers(ctx.settings.workers)
    .resync_period(ctx.settings.resync_period);

    // a released code lets a blocked event with the same code provision
    let events = controller.cache();
    let controller = controller.watches::<AccessCode>(move |code| {
        events
            .by_index(ACCESS_CODE_INDEX, &code.name_any())
            .iter()
            .map(|se| ObjectKey::of(se.as_ref()))
            .collect()
    });

    controller.run(reconcile, ctx, token, terms).await
}
