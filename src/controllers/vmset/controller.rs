use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::controllers::Context;
use crate::reconcilers::virtual_machines::create_virtual_machine;
use crate::reconcilers::{owner_ref, random_suffix};
use crate::resources::environments::VirtualMachineTemplate;
use crate::resources::virtualmachines::VirtualMachine;
use crate::resources::virtualmachinesets::{VirtualMachineSet, VirtualMachineSetStatus};
use crate::resources::{
    restricted_bind_labels, ENVIRONMENT_LABEL, SCHEDULED_EVENT_LABEL, VMSET_LABEL,
};
use crate::runtime::retry::update_status_with_retry;
use crate::runtime::{Action, Controller, ObjectKey, Terms};
use crate::store::{delete_if_exists, labels_selector, ObjectStore};
use crate::{telemetry, Error, Result};

#[instrument(skip(ctx), fields(trace_id))]
pub async fn reconcile<S: ObjectStore>(key: ObjectKey, ctx: Arc<Context<S>>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<VirtualMachineSet>();
    ctx.touch().await;

    let Some(set) = ctx
        .store
        .get::<VirtualMachineSet>(&key.namespace, &key.name)
        .await?
    else {
        debug!("VirtualMachineSet {key} is gone");
        return Ok(Action::await_change());
    };

    set.reconcile(&ctx).await.inspect_err(|err| {
        if !err.is_not_found() {
            ctx.metrics.reconcile_failure(&set, err);
        }
    })
}

impl VirtualMachineSet {
    async fn reconcile<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<Action> {
        let ns = ctx.namespace();
        let name = self.name_any();
        let vms: Vec<VirtualMachine> = ctx
            .store
            .list(ns, &labels_selector([(VMSET_LABEL, name.as_str())]))
            .await?;

        // tainted machines nobody holds any more are replaced
        let (recycle, mut live): (Vec<_>, Vec<_>) = vms
            .into_iter()
            .partition(|vm| vm.is_tainted() && !vm.is_allocated());
        for vm in &recycle {
            info!("Deleting tainted VirtualMachine {}", vm.name_any());
            delete_if_exists::<VirtualMachine, _>(&ctx.store, ns, &vm.name_any()).await?;
        }

        // allocated tainted machines still count against nothing
        let untainted = live.iter().filter(|vm| !vm.is_tainted()).count();
        let desired = self.desired();

        if untainted < desired {
            let created = self.create_replicas(ctx, desired - untainted).await?;
            live.extend(created);
        } else if untainted > desired {
            let mut surplus: Vec<&VirtualMachine> = live
                .iter()
                .filter(|vm| !vm.is_tainted() && !vm.is_allocated())
                .collect();
            surplus.sort_by(|a, b| {
                a.creation_timestamp()
                    .cmp(&b.creation_timestamp())
                    .then_with(|| a.name_any().cmp(&b.name_any()))
            });
            let doomed: Vec<String> = surplus
                .into_iter()
                .take(untainted - desired)
                .map(ResourceExt::name_any)
                .collect();
            for vm in &doomed {
                info!("Scaling down VirtualMachineSet {name}, deleting {vm}");
                delete_if_exists::<VirtualMachine, _>(&ctx.store, ns, vm).await?;
            }
            live.retain(|vm| !doomed.contains(&vm.name_any()));
        }

        let status = VirtualMachineSetStatus {
            provisioned_count: count(live.iter().filter(|vm| vm.is_ready() && !vm.is_tainted())),
            available_count: count(live.iter().filter(|vm| vm.is_available())),
        };
        if self.status.as_ref() != Some(&status) {
            update_status_with_retry::<VirtualMachineSet, _, _>(&ctx.store, ns, &name, |set| {
                if set.status.as_ref() == Some(&status) {
                    return false;
                }
                set.status = Some(status.clone());
                true
            })
            .await?;
        }

        Ok(Action::await_change())
    }

    async fn create_replicas<S: ObjectStore>(
        &self,
        ctx: &Context<S>,
        missing: usize,
    ) -> Result<Vec<VirtualMachine>> {
        let ns = ctx.namespace();
        let name = self.name_any();
        let template = ctx
            .store
            .get::<VirtualMachineTemplate>(ns, &self.spec.vm_template)
            .await?
            .ok_or_else(|| {
                Error::InvalidSpec(format!(
                    "VirtualMachineSet {name} uses unknown template {}",
                    self.spec.vm_template
                ))
            })?;
        let oref = owner_ref(self)?;

        let mut labels = BTreeMap::from([
            (VMSET_LABEL.to_owned(), name.clone()),
            (ENVIRONMENT_LABEL.to_owned(), self.spec.environment.clone()),
        ]);
        if let Some(se) = self.labels().get(SCHEDULED_EVENT_LABEL) {
            labels.insert(SCHEDULED_EVENT_LABEL.to_owned(), se.clone());
        }
        labels.extend(restricted_bind_labels(
            self.spec.restricted_bind,
            &self.spec.restricted_bind_value,
        ));

        let base_name = if self.spec.base_name.is_empty() {
            name.as_str()
        } else {
            self.spec.base_name.as_str()
        };

        info!("Scaling up VirtualMachineSet {name} by {missing}");
        try_join_all((0..missing).map(|_| {
            let vm_name = format!("{base_name}-{}", random_suffix());
            let labels = labels.clone();
            let template = &template;
            let oref = &oref;
            async move {
                create_virtual_machine(
                    &ctx.store,
                    ns,
                    &vm_name,
                    template,
                    &self.spec.environment,
                    oref,
                    labels,
                )
                .await
            }
        }))
        .await
    }
}

fn count<'a>(vms: impl Iterator<Item = &'a VirtualMachine>) -> i32 {
    i32::try_from(vms.count()).unwrap_or(i32::MAX)
}

/// Initialize the controller
pub async fn run<S: ObjectStore>(ctx: Arc<Context<S>>, token: CancellationToken, terms: Terms) {
    Controller::<VirtualMachineSet, S>::new(ctx.store.clone(), ctx.namespace(), ctx.queue("vmset"))
        .owns::<VirtualMachine>()
        .workers(ctx.settings.workers)
        .resync_period(ctx.settings.resync_period)
        .run(reconcile, ctx, token, terms)
        .await
}
