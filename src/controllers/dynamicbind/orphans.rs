use std::sync::Arc;

use kube::ResourceExt;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::controllers::Context;
use crate::reconcilers::timestamps::to_chrono;
use crate::resources::virtualmachineclaims::VirtualMachineClaim;
use crate::resources::virtualmachines::VirtualMachine;
use crate::resources::{DYNAMIC_LABEL, VM_CLAIM_LABEL};
use crate::runtime::Terms;
use crate::store::{delete_if_exists, labels_selector, ObjectStore};
use crate::Result;

/// Deletes dynamic VMs past the grace period that no claim references. Returns how many.
pub async fn sweep_orphans<S: ObjectStore>(ctx: &Context<S>) -> Result<usize> {
    let ns = ctx.namespace();
    let now = ctx.clock.now();
    let grace = to_chrono(ctx.settings.dynamic_orphan_grace);

    let vms: Vec<VirtualMachine> = ctx
        .store
        .list(ns, &labels_selector([(DYNAMIC_LABEL, "true")]))
        .await?;

    let mut deleted = 0;
    for vm in vms {
        let name = vm.name_any();
        let created = vm.creation_timestamp().map(|t| t.0).unwrap_or(now);
        if now - created < grace {
            continue;
        }

        let referenced = match vm.labels().get(VM_CLAIM_LABEL) {
            Some(claim) => ctx
                .store
                .get::<VirtualMachineClaim>(ns, claim)
                .await?
                .is_some_and(|claim| claim.bound_vm_ids().any(|id| id == name)),
            None => false,
        };
        if referenced {
            continue;
        }

        info!("Deleting orphaned dynamic VirtualMachine {name}");
        if delete_if_exists::<VirtualMachine, _>(&ctx.store, ns, &name).await? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Sweeps on a fixed period during each term until `token` is cancelled
pub async fn run_orphan_sweep<S: ObjectStore>(
    ctx: Arc<Context<S>>,
    token: CancellationToken,
    mut terms: Terms,
) {
    while let Some(term) = terms.next(&token).await {
        let mut ticker = interval(ctx.settings.dynamic_orphan_sweep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = term.cancelled() => break,
                _ = ticker.tick() => {
                    match sweep_orphans(&ctx).await {
                        Ok(0) => {}
                        Ok(n) => debug!("Deleted {n} orphaned dynamic VirtualMachines"),
                        Err(e) => warn!("Orphan sweep failed: {e}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::Settings;
    use crate::resources::virtualmachineclaims::{VirtualMachineClaimSpec, VirtualMachineClaimVm};
    use crate::runtime::Clock;
    use crate::store::{everything, MemoryStore};
    use crate::{Metrics, State};

    const NS: &str = "hobbyfarm";

    async fn dynamic_vm(store: &MemoryStore, name: &str, claim: &str) {
        let mut vm = VirtualMachine::new(name, Default::default());
        vm.labels_mut().insert(DYNAMIC_LABEL.into(), "true".into());
        vm.labels_mut().insert(VM_CLAIM_LABEL.into(), claim.into());
        store.create(NS, &vm).await.unwrap();
    }

    #[tokio::test]
    async fn only_old_unreferenced_machines_are_swept() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap());
        let store = MemoryStore::new(clock.clone());
        let ctx = Context::new(
            store.clone(),
            &State::new(Settings::default()),
            Metrics::default(),
            clock.clone(),
        );

        let claim = VirtualMachineClaim::new(
            "vmc-1",
            VirtualMachineClaimSpec {
                user_id: "u-1".into(),
                virtual_machines: BTreeMap::from([(
                    "node1".to_owned(),
                    VirtualMachineClaimVm {
                        template: "tmplX".into(),
                        virtual_machine_id: "held".into(),
                    },
                )]),
                ..Default::default()
            },
        );
        store.create(NS, &claim).await.unwrap();

        dynamic_vm(&store, "held", "vmc-1").await;
        dynamic_vm(&store, "abandoned", "vmc-1").await;
        dynamic_vm(&store, "orphan", "vmc-gone").await;
        clock.advance(chrono::Duration::minutes(2));
        dynamic_vm(&store, "fresh", "vmc-gone").await;

        assert_eq!(sweep_orphans(&ctx).await.unwrap(), 2);
        let mut left: Vec<String> = store
            .list::<VirtualMachine>(NS, &everything())
            .await
            .unwrap()
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        left.sort();
        assert_eq!(left, vec!["fresh", "held"]);
    }
}
