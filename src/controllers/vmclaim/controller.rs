use std::collections::BTreeSet;
use std::sync::Arc;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::*;

use super::binding::{
    adopt_labelled, bind_static, claim_scheduled_event, record_binding, refresh_status,
};
use crate::controllers::Context;
use crate::reconcilers::virtual_machines::taint_virtual_machine;
use crate::resources::virtualmachineclaims::VirtualMachineClaim;
use crate::resources::virtualmachines::VirtualMachine;
use crate::resources::{
    label_is_true, SCHEDULED_EVENT_LABEL, SESSION_LABEL, TAINTED_LABEL, USER_LABEL,
};
use crate::runtime::retry::update_with_retry;
use crate::runtime::{Action, Controller, ObjectKey, Terms};
use crate::store::{delete_if_exists, ObjectStore};
use crate::{telemetry, Result};

pub const SCHEDULED_EVENT_INDEX: &str = "scheduledevent";
pub const SESSION_INDEX: &str = "session";
pub const USER_INDEX: &str = "user";
pub const VM_INDEX: &str = "vm";

#[instrument(skip(ctx), fields(trace_id))]
pub async fn reconcile<S: ObjectStore>(key: ObjectKey, ctx: Arc<Context<S>>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<VirtualMachineClaim>();
    ctx.touch().await;

    let Some(claim) = ctx
        .store
        .get::<VirtualMachineClaim>(&key.namespace, &key.name)
        .await?
    else {
        debug!("VirtualMachineClaim {key} is gone");
        return Ok(Action::await_change());
    };

    claim.reconcile(&ctx).await.inspect_err(|err| {
        if !err.is_not_found() {
            ctx.metrics.reconcile_failure(&claim, err);
        }
    })
}

impl VirtualMachineClaim {
    async fn reconcile<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<Action> {
        let name = self.name_any();

        if label_is_true(self.labels(), TAINTED_LABEL) {
            self.release(ctx).await?;
            return Ok(Action::await_change());
        }

        self.clear_dangling(ctx).await?;
        let claim = ctx
            .store
            .get::<VirtualMachineClaim>(ctx.namespace(), &name)
            .await?
            .ok_or_else(|| crate::Error::not_found::<VirtualMachineClaim>(&name))?;

        let unbound: Vec<(String, String)> = claim
            .unbound_entries()
            .map(|(entry, vm)| (entry.clone(), vm.template.clone()))
            .collect();

        if !unbound.is_empty() {
            let scheduled_event = claim_scheduled_event(ctx, &claim).await?;
            let mut taken: BTreeSet<String> = claim.bound_vm_ids().map(str::to_owned).collect();
            let mut missing = 0;

            for (entry, template) in &unbound {
                let mut found = adopt_labelled(ctx, &claim, template, &taken).await?;
                if found.is_none() {
                    if let Some(se) = &scheduled_event {
                        found = bind_static(ctx, &claim, se, template).await?;
                    }
                }
                match found {
                    Some(vm) => {
                        // a lost entry was bound by the dynamic path meanwhile
                        if record_binding(ctx, &claim, entry, &vm).await? {
                            taken.insert(vm);
                        }
                    }
                    None => missing += 1,
                }
            }

            if missing > 0 {
                refresh_status(ctx, &name).await?;
                if claim.spec.dynamic_capable {
                    debug!("No pooled VM for {missing} entries of VirtualMachineClaim {name}, binding dynamically");
                    ctx.dynamic_bind_queue.add(ObjectKey::of(&claim));
                } else {
                    debug!("No pooled VM for {missing} entries of VirtualMachineClaim {name}");
                }
                return Ok(Action::requeue(ctx.settings.unbound_claim_requeue));
            }
        }

        let status = refresh_status(ctx, &name).await?;
        if status.bound {
            Ok(Action::await_change())
        } else {
            Ok(Action::requeue(ctx.settings.unbound_claim_requeue))
        }
    }

    /// Forgets entries whose VM disappeared or went back to its pool
    async fn clear_dangling<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<()> {
        let mut dangling = BTreeSet::new();
        for (entry, vm) in &self.spec.virtual_machines {
            if vm.virtual_machine_id.is_empty() {
                continue;
            }
            match ctx
                .store
                .get::<VirtualMachine>(ctx.namespace(), &vm.virtual_machine_id)
                .await?
            {
                // a tainted VM stays with its claim until the claim is released
                Some(vm) if !vm.is_tainted() || vm.is_allocated() => {}
                _ => {
                    info!(
                        "VirtualMachineClaim {} lost VirtualMachine {}",
                        self.name_any(),
                        vm.virtual_machine_id
                    );
                    dangling.insert((entry.clone(), vm.virtual_machine_id.clone()));
                }
            }
        }
        if dangling.is_empty() {
            return Ok(());
        }

        update_with_retry::<VirtualMachineClaim, _, _>(
            &ctx.store,
            ctx.namespace(),
            &self.name_any(),
            |claim| {
                let mut changed = false;
                for (entry, vm_id) in &dangling {
                    if let Some(vm) = claim.spec.virtual_machines.get_mut(entry) {
                        if vm.virtual_machine_id == *vm_id {
                            vm.virtual_machine_id.clear();
                            changed = true;
                        }
                    }
                }
                changed
            },
        )
        .await?;
        Ok(())
    }

    /// Gives back every VM of an ended claim, then deletes the claim
    async fn release<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<()> {
        let ns = ctx.namespace();
        for vm_id in self.bound_vm_ids() {
            let Some(vm) = ctx.store.get::<VirtualMachine>(ns, vm_id).await? else {
                continue;
            };
            if vm.is_dynamic() {
                info!("Deleting dynamic VirtualMachine {vm_id}");
                delete_if_exists::<VirtualMachine, _>(&ctx.store, ns, vm_id).await?;
            } else {
                debug!("Releasing VirtualMachine {vm_id} to its pool");
                match taint_virtual_machine(&ctx.store, ns, vm_id, true).await {
                    Err(e) if !e.is_not_found() => return Err(e),
                    _ => {}
                }
            }
        }
        info!("Deleting tainted VirtualMachineClaim {}", self.name_any());
        delete_if_exists::<VirtualMachineClaim, _>(&ctx.store, ns, &self.name_any()).await?;
        Ok(())
    }
}

/// Initialize the controller
pub async fn run<S: ObjectStore>(ctx: Arc<Context<S>>, token: CancellationToken, terms: Terms) {
    let controller = Controller::<VirtualMachineClaim, S>::new(
        ctx.store.clone(),
        ctx.namespace(),
        ctx.queue("vmclaim"),
    )
    .index(SCHEDULED_EVENT_INDEX, |claim| {
        claim.labels().get(SCHEDULED_EVENT_LABEL).cloned().into_iter().collect()
    })
    .index(SESSION_INDEX, |claim| {
        claim.labels().get(SESSION_LABEL).cloned().into_iter().collect()
    })
    .index(USER_INDEX, |claim| {
        let user = claim
            .labels()
            .get(USER_LABEL)
            .cloned()
            .unwrap_or_else(|| claim.spec.user_id.clone());
        vec![user]
    })
    .index(VM_INDEX, |claim| claim.bound_vm_ids().map(str::to_owned).collect())
    .workers(ctx.settings.workers)
    .resync_period(ctx.settings.resync_period);

    // claims holding a VM, and unbound claims of the event a freed VM belongs to
    let claims = controller.cache();
    let controller = controller.watches::<VirtualMachine>(move |vm| {
        let mut keys: Vec<ObjectKey> = claims
            .by_index(VM_INDEX, &vm.name_any())
            .iter()
            .map(|c| ObjectKey::of(c.as_ref()))
            .collect();
        if vm.is_available() {
            if let Some(se) = vm.labels().get(SCHEDULED_EVENT_LABEL) {
                keys.extend(
                    claims
                        .by_index(SCHEDULED_EVENT_INDEX, se)
                        .iter()
                        .filter(|c| !c.is_bound())
                        .map(|c| ObjectKey::of(c.as_ref())),
                );
            }
        }
        keys
    });

    controller.run(reconcile, ctx, token, terms).await
}
