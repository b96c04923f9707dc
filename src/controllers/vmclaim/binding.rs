//! Binding claims to machines.
//!
//! A VM is taken by one versioned write of its metadata stamping the claim and
//! the user; `allocated` follows on the version that write produced. The claim
//! entry is recorded last and only while it is still empty. A crash after the
//! stamp leaves a VM labelled with the claim, which the claim's next pass adopts.
//! A VM that loses the race for its entry is handed back.

use std::collections::BTreeSet;

use kube::ResourceExt;
use tracing::*;

use crate::controllers::Context;
use crate::reconcilers::owner_name;
use crate::resources::accesscodes::AccessCode;
use crate::resources::scheduledevents::ScheduledEvent;
use crate::resources::virtualmachineclaims::{
    BindMode, VirtualMachineClaim, VirtualMachineClaimStatus,
};
use crate::resources::virtualmachines::VirtualMachine;
use crate::resources::{
    restricted_bind_allows, template_label, ACCESS_CODE_LABEL, RESTRICTED_BIND_VALUE_LABEL,
    SCHEDULED_EVENT_LABEL, VMSET_LABEL, VM_CLAIM_LABEL,
};
use crate::runtime::retry::{update_status_with_retry, update_with_retry};
use crate::store::{delete_if_exists, labels_selector, ObjectStore};
use crate::Result;

/// The event a claim draws from: its own label, else the owner of its access code
pub(crate) async fn claim_scheduled_event<S: ObjectStore>(
    ctx: &Context<S>,
    claim: &VirtualMachineClaim,
) -> Result<Option<String>> {
    if let Some(se) = claim.labels().get(SCHEDULED_EVENT_LABEL) {
        return Ok(Some(se.clone()));
    }
    let Some(code) = claim.labels().get(ACCESS_CODE_LABEL) else {
        return Ok(None);
    };
    Ok(ctx
        .store
        .get::<AccessCode>(ctx.namespace(), code)
        .await?
        .and_then(|code| owner_name::<_, ScheduledEvent>(&code)))
}

pub(crate) fn restricted_bind_allows_vm(claim: &VirtualMachineClaim, vm: &VirtualMachine) -> bool {
    restricted_bind_allows(
        claim.spec.restricted_bind,
        &claim.spec.restricted_bind_value,
        vm.labels().get(RESTRICTED_BIND_VALUE_LABEL).map(String::as_str),
    )
}

fn claimed_by(vm: &VirtualMachine, claim: &str) -> bool {
    vm.labels().get(VM_CLAIM_LABEL).map(String::as_str) == Some(claim)
}

/// Adopts a VM already stamped with this claim but missing from its entries
pub(crate) async fn adopt_labelled<S: ObjectStore>(
    ctx: &Context<S>,
    claim: &VirtualMachineClaim,
    template: &str,
    taken: &BTreeSet<String>,
) -> Result<Option<String>> {
    let name = claim.name_any();
    let mut vms: Vec<VirtualMachine> = ctx
        .store
        .list(ctx.namespace(), &labels_selector([(VM_CLAIM_LABEL, name.as_str())]))
        .await?;
    vms.sort_by_key(ResourceExt::name_any);

    for vm in vms {
        let vm_name = vm.name_any();
        if vm.is_tainted()
            || vm.spec.virtual_machine_template_id != template
            || taken.contains(&vm_name)
        {
            continue;
        }
        if mark_allocated(ctx, &name, &vm_name).await? {
            debug!("Adopting VirtualMachine {vm_name} for VirtualMachineClaim {name}");
            return Ok(Some(vm_name));
        }
    }
    Ok(None)
}

/// Takes the first free pooled VM of `template` from the claim's event
pub(crate) async fn bind_static<S: ObjectStore>(
    ctx: &Context<S>,
    claim: &VirtualMachineClaim,
    scheduled_event: &str,
    template: &str,
) -> Result<Option<String>> {
    let template_key = template_label(template);
    let mut candidates: Vec<VirtualMachine> = ctx
        .store
        .list(
            ctx.namespace(),
            &labels_selector([
                (SCHEDULED_EVENT_LABEL, scheduled_event),
                (template_key.as_str(), "true"),
            ]),
        )
        .await?
        .into_iter()
        .filter(|vm: &VirtualMachine| {
            vm.labels().contains_key(VMSET_LABEL)
                && !vm.is_dynamic()
                && vm.is_available()
                && vm.spec.virtual_machine_template_id == template
                && restricted_bind_allows_vm(claim, vm)
        })
        .collect();
    candidates.sort_by_key(ResourceExt::name_any);

    for candidate in candidates {
        let vm_name = candidate.name_any();
        if try_claim(ctx, claim, candidate).await? {
            return Ok(Some(vm_name));
        }
        debug!("VirtualMachine {vm_name} was taken concurrently");
    }
    Ok(None)
}

/// Stamps `userId` and the claim label onto `vm` with a compare-and-set against
/// the version that was read, then marks it allocated.
/// Returns false when another writer got there first.
pub(crate) async fn try_claim<S: ObjectStore>(
    ctx: &Context<S>,
    claim: &VirtualMachineClaim,
    mut vm: VirtualMachine,
) -> Result<bool> {
    let ns = ctx.namespace();
    let claim_name = claim.name_any();
    if vm.is_allocated() && !claimed_by(&vm, &claim_name) {
        return Ok(false);
    }

    vm.spec.user_id = claim.spec.user_id.clone();
    vm.labels_mut()
        .insert(VM_CLAIM_LABEL.to_owned(), claim_name.clone());
    let mut stamped = match ctx.store.replace(ns, &vm).await {
        Ok(stamped) => stamped,
        Err(e) if e.is_conflict() || e.is_not_found() => return Ok(false),
        Err(e) => return Err(e),
    };

    stamped.status.get_or_insert_with(Default::default).allocated = true;
    match ctx.store.replace_status(ns, &stamped).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_conflict() => mark_allocated(ctx, &claim_name, &vm.name_any()).await,
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Sets `allocated` on a VM stamped with `claim`; false once it carries another claim
async fn mark_allocated<S: ObjectStore>(ctx: &Context<S>, claim: &str, vm_name: &str) -> Result<bool> {
    let result = update_status_with_retry::<VirtualMachine, _, _>(
        &ctx.store,
        ctx.namespace(),
        vm_name,
        |vm| {
            if !claimed_by(vm, claim) || vm.is_tainted() || vm.is_allocated() {
                return false;
            }
            vm.status.get_or_insert_with(Default::default).allocated = true;
            true
        },
    )
    .await;
    match result {
        Ok(vm) => Ok(claimed_by(&vm, claim) && vm.is_allocated() && !vm.is_tainted()),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Records a VM taken for `claim` in the claim entry, unless the entry was bound
/// meanwhile. Returns false, after handing the VM back, when it lost.
pub(crate) async fn record_binding<S: ObjectStore>(
    ctx: &Context<S>,
    claim: &VirtualMachineClaim,
    entry: &str,
    vm_name: &str,
) -> Result<bool> {
    let claim_name = claim.name_any();
    let result = update_with_retry::<VirtualMachineClaim, _, _>(
        &ctx.store,
        ctx.namespace(),
        &claim_name,
        |claim| match claim.spec.virtual_machines.get_mut(entry) {
            Some(e) if e.virtual_machine_id.is_empty() => {
                e.virtual_machine_id = vm_name.to_owned();
                true
            }
            _ => false,
        },
    )
    .await;

    let recorded = match result {
        Ok(updated) => updated
            .spec
            .virtual_machines
            .get(entry)
            .is_some_and(|e| e.virtual_machine_id == vm_name),
        Err(e) if e.is_not_found() => false,
        Err(e) => return Err(e),
    };

    if recorded {
        info!("Bound VirtualMachine {vm_name} to VirtualMachineClaim {claim_name} as {entry}");
    } else {
        warn!("Entry {entry} of VirtualMachineClaim {claim_name} was bound elsewhere, handing back VirtualMachine {vm_name}");
        hand_back(ctx, &claim_name, vm_name).await?;
    }
    Ok(recorded)
}

/// Returns a VM taken for `claim` that no entry references: dynamic ones are
/// deleted, pooled ones go back to their set unallocated
async fn hand_back<S: ObjectStore>(
    ctx: &Context<S>,
    claim: &str,
    vm_name: &str,
) -> Result<()> {
    let ns = ctx.namespace();
    let Some(vm) = ctx.store.get::<VirtualMachine>(ns, vm_name).await? else {
        return Ok(());
    };
    if !claimed_by(&vm, claim) {
        return Ok(());
    }
    if vm.is_dynamic() {
        delete_if_exists::<VirtualMachine, _>(&ctx.store, ns, vm_name).await?;
        return Ok(());
    }

    // unallocated first: once free, the stamp no longer holds the VM
    let result = update_status_with_retry::<VirtualMachine, _, _>(&ctx.store, ns, vm_name, |vm| {
        if !claimed_by(vm, claim) || !vm.is_allocated() {
            return false;
        }
        vm.status.get_or_insert_with(Default::default).allocated = false;
        true
    })
    .await;
    ignore_not_found(result.map(|_| ()))?;

    let result = update_with_retry::<VirtualMachine, _, _>(&ctx.store, ns, vm_name, |vm| {
        if !claimed_by(vm, claim) || vm.is_allocated() {
            return false;
        }
        vm.labels_mut().remove(VM_CLAIM_LABEL);
        vm.spec.user_id.clear();
        true
    })
    .await;
    ignore_not_found(result.map(|_| ()))
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Recomputes `bound`, `ready` and `bindMode` from the VMs the claim references
pub(crate) async fn refresh_status<S: ObjectStore>(
    ctx: &Context<S>,
    claim_name: &str,
) -> Result<VirtualMachineClaimStatus> {
    let ns = ctx.namespace();
    let claim = ctx
        .store
        .get::<VirtualMachineClaim>(ns, claim_name)
        .await?
        .ok_or_else(|| crate::Error::not_found::<VirtualMachineClaim>(claim_name))?;

    let mut bound = true;
    let mut ready = true;
    let mut any_static = false;
    for entry in claim.spec.virtual_machines.values() {
        if entry.virtual_machine_id.is_empty() {
            bound = false;
            continue;
        }
        match ctx
            .store
            .get::<VirtualMachine>(ns, &entry.virtual_machine_id)
            .await?
        {
            Some(vm) if !vm.is_tainted() => {
                ready &= vm.is_ready();
                any_static |= !vm.is_dynamic();
            }
            _ => bound = false,
        }
    }

    let previous = claim.status.clone().unwrap_or_default();
    let bind_mode = if bound && !claim.spec.virtual_machines.is_empty() {
        Some(if any_static {
            BindMode::Static
        } else {
            BindMode::Dynamic
        })
    } else {
        None
    };
    let status = VirtualMachineClaimStatus {
        bound,
        ready: bound && ready,
        bind_mode,
        tainted: previous.tainted,
    };

    if status != previous {
        update_status_with_retry::<VirtualMachineClaim, _, _>(&ctx.store, ns, claim_name, |claim| {
            let current = claim.status.get_or_insert_with(Default::default);
            let next = VirtualMachineClaimStatus {
                tainted: current.tainted,
                ..status.clone()
            };
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
        .await?;
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::Settings;
    use crate::controllers::vmclaim;
    use crate::resources::virtualmachineclaims::{VirtualMachineClaimSpec, VirtualMachineClaimVm};
    use crate::resources::{DYNAMIC_LABEL, READY_LABEL};
    use crate::runtime::{Clock, ObjectKey};
    use crate::store::MemoryStore;
    use crate::{Metrics, State};

    const NS: &str = "hobbyfarm";

    fn context() -> (MemoryStore, Arc<Context<MemoryStore>>) {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap());
        let store = MemoryStore::new(clock.clone());
        let state = State::new(Settings::default());
        let ctx = Context::new(store.clone(), &state, Metrics::default(), clock);
        (store, ctx)
    }

    fn claim(name: &str) -> VirtualMachineClaim {
        let mut claim = VirtualMachineClaim::new(
            name,
            VirtualMachineClaimSpec {
                user_id: format!("user-{name}"),
                virtual_machines: BTreeMap::from([(
                    "node1".to_owned(),
                    VirtualMachineClaimVm {
                        template: "tmplX".into(),
                        virtual_machine_id: String::new(),
                    },
                )]),
                ..Default::default()
            },
        );
        claim
            .labels_mut()
            .insert(SCHEDULED_EVENT_LABEL.into(), "se-1".into());
        claim
    }

    async fn vm(
        store: &MemoryStore,
        name: &str,
        labels: &[(&str, &str)],
        user: &str,
        allocated: bool,
    ) -> VirtualMachine {
        let mut vm = VirtualMachine::new(name, Default::default());
        vm.spec.virtual_machine_template_id = "tmplX".into();
        vm.spec.user_id = user.into();
        for (k, v) in labels {
            vm.labels_mut().insert((*k).into(), (*v).into());
        }
        let mut vm = store.create(NS, &vm).await.unwrap();
        let status = vm.status.get_or_insert_with(Default::default);
        status.ready = true;
        status.allocated = allocated;
        store.replace_status(NS, &vm).await.unwrap()
    }

    async fn pooled_vm(store: &MemoryStore, name: &str) -> VirtualMachine {
        let template = template_label("tmplX");
        vm(
            store,
            name,
            &[
                (SCHEDULED_EVENT_LABEL, "se-1"),
                (VMSET_LABEL, "set-1"),
                (template.as_str(), "true"),
                (READY_LABEL, "true"),
            ],
            "",
            false,
        )
        .await
    }

    async fn get_vm(store: &MemoryStore, name: &str) -> Option<VirtualMachine> {
        store.get(NS, name).await.unwrap()
    }

    async fn entry(store: &MemoryStore, claim: &str) -> String {
        let claim: VirtualMachineClaim = store.get(NS, claim).await.unwrap().unwrap();
        claim.spec.virtual_machines["node1"].virtual_machine_id.clone()
    }

    #[tokio::test]
    async fn allocation_stamps_owner_in_the_same_write() {
        let (store, ctx) = context();
        pooled_vm(&store, "pool-1").await;
        let first = store.create(NS, &claim("vmc-1")).await.unwrap();
        store.create(NS, &claim("vmc-2")).await.unwrap();

        let taken = bind_static(&ctx, &first, "se-1", "tmplX").await.unwrap();
        assert_eq!(taken.as_deref(), Some("pool-1"));

        let vm = get_vm(&store, "pool-1").await.unwrap();
        assert!(vm.is_allocated());
        assert_eq!(vm.spec.user_id, "user-vmc-1");
        assert!(claimed_by(&vm, "vmc-1"));

        // the claim entry was never written; the next passes must not lose the VM
        for name in ["vmc-2", "vmc-1"] {
            vmclaim::reconcile(ObjectKey::new(NS, name), ctx.clone())
                .await
                .unwrap();
        }
        assert_eq!(entry(&store, "vmc-1").await, "pool-1");
        assert_eq!(entry(&store, "vmc-2").await, "");
    }

    #[tokio::test]
    async fn stamped_but_unallocated_vm_is_adopted() {
        let (store, ctx) = context();
        let template = template_label("tmplX");
        vm(
            &store,
            "pool-1",
            &[
                (SCHEDULED_EVENT_LABEL, "se-1"),
                (VMSET_LABEL, "set-1"),
                (template.as_str(), "true"),
                (VM_CLAIM_LABEL, "vmc-1"),
            ],
            "user-vmc-1",
            false,
        )
        .await;
        store.create(NS, &claim("vmc-1")).await.unwrap();

        vmclaim::reconcile(ObjectKey::new(NS, "vmc-1"), ctx.clone())
            .await
            .unwrap();
        assert_eq!(entry(&store, "vmc-1").await, "pool-1");
        assert!(get_vm(&store, "pool-1").await.unwrap().is_allocated());
    }

    #[tokio::test]
    async fn bound_entries_are_never_overwritten() {
        let (store, ctx) = context();
        let stale = store.create(NS, &claim("vmc-1")).await.unwrap();
        vm(
            &store,
            "dyn-1",
            &[(DYNAMIC_LABEL, "true"), (VM_CLAIM_LABEL, "vmc-1")],
            "user-vmc-1",
            true,
        )
        .await;
        assert!(record_binding(&ctx, &stale, "node1", "dyn-1").await.unwrap());

        // a pooled VM taken from the same stale view loses and goes back to its set
        pooled_vm(&store, "pool-1").await;
        let taken = bind_static(&ctx, &stale, "se-1", "tmplX").await.unwrap();
        assert_eq!(taken.as_deref(), Some("pool-1"));
        assert!(!record_binding(&ctx, &stale, "node1", "pool-1").await.unwrap());

        assert_eq!(entry(&store, "vmc-1").await, "dyn-1");
        let pool = get_vm(&store, "pool-1").await.unwrap();
        assert!(!pool.is_allocated());
        assert!(pool.is_available());
        assert!(!pool.labels().contains_key(VM_CLAIM_LABEL));
        assert_eq!(pool.spec.user_id, "");

        // a dynamic VM that loses is deleted
        vm(
            &store,
            "dyn-2",
            &[(DYNAMIC_LABEL, "true"), (VM_CLAIM_LABEL, "vmc-1")],
            "user-vmc-1",
            true,
        )
        .await;
        assert!(!record_binding(&ctx, &stale, "node1", "dyn-2").await.unwrap());
        assert!(get_vm(&store, "dyn-2").await.is_none());
        assert_eq!(entry(&store, "vmc-1").await, "dyn-1");
    }
}
