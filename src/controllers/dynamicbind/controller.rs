use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::controllers::vmclaim::binding::{
    adopt_labelled, claim_scheduled_event, record_binding, refresh_status, try_claim,
};
use crate::controllers::Context;
use crate::reconcilers::virtual_machines::create_virtual_machine;
use crate::reconcilers::{owner_ref, random_suffix};
use crate::resources::dynamicbindconfigurations::DynamicBindConfiguration;
use crate::resources::environments::VirtualMachineTemplate;
use crate::resources::virtualmachineclaims::VirtualMachineClaim;
use crate::resources::virtualmachines::VirtualMachine;
use crate::resources::{
    bool_label, label_is_true, restricted_bind_allows, restricted_bind_labels, template_label,
    DBC_LABEL, DYNAMIC_LABEL, ENVIRONMENT_LABEL, SCHEDULED_EVENT_LABEL, TAINTED_LABEL,
    VM_CLAIM_LABEL,
};
use crate::runtime::{Action, Controller, ObjectKey, Terms};
use crate::store::{labels_selector, ObjectStore};
use crate::{telemetry, Error, Result};

/// Claims only arrive here from the claim controller, through [`Context::dynamic_bind_queue`]
#[instrument(skip(ctx), fields(trace_id))]
pub async fn reconcile<S: ObjectStore>(key: ObjectKey, ctx: Arc<Context<S>>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<DynamicBindConfiguration>();
    ctx.touch().await;

    let Some(claim) = ctx
        .store
        .get::<VirtualMachineClaim>(&key.namespace, &key.name)
        .await?
    else {
        debug!("VirtualMachineClaim {key} is gone");
        return Ok(Action::await_change());
    };

    if !claim.spec.dynamic_capable || label_is_true(claim.labels(), TAINTED_LABEL) {
        return Ok(Action::await_change());
    }

    claim.bind_dynamic(&ctx).await.inspect_err(|err| {
        if !err.is_not_found() && !matches!(err, Error::NotReady { .. }) {
            ctx.metrics.reconcile_failure(&claim, err);
        }
    })
}

impl VirtualMachineClaim {
    async fn bind_dynamic<S: ObjectStore>(&self, ctx: &Context<S>) -> Result<Action> {
        let name = self.name_any();
        let candidates = self.candidate_configurations(ctx).await?;
        let mut taken: BTreeSet<String> = self.bound_vm_ids().map(str::to_owned).collect();
        let mut missing = Vec::new();

        let unbound: Vec<(String, String)> = self
            .unbound_entries()
            .map(|(entry, vm)| (entry.clone(), vm.template.clone()))
            .collect();

        for (entry, template) in &unbound {
            if let Some(vm) = adopt_labelled(ctx, self, template, &taken).await? {
                if record_binding(ctx, self, entry, &vm).await? {
                    taken.insert(vm);
                }
                continue;
            }

            let budgets = remaining_budgets(ctx, &candidates, template).await?;
            let Some(dbc) = pick_configuration(&candidates, &budgets) else {
                missing.push(template.clone());
                continue;
            };

            let vm = self.create_dynamic(ctx, dbc, template).await?;
            if record_binding(ctx, self, entry, &vm).await? {
                taken.insert(vm);
            }
        }

        refresh_status(ctx, &name).await?;

        if missing.is_empty() {
            Ok(Action::await_change())
        } else {
            Err(Error::NotReady {
                message: format!(
                    "no dynamic capacity left for {} of VirtualMachineClaim {name}",
                    missing.join(", ")
                ),
                reason: "NoDynamicCapacity".into(),
                requeue_after: None,
            })
        }
    }

    /// Configurations of the claim's event this claim may draw from
    async fn candidate_configurations<S: ObjectStore>(
        &self,
        ctx: &Context<S>,
    ) -> Result<Vec<DynamicBindConfiguration>> {
        let Some(se) = claim_scheduled_event(ctx, self).await? else {
            return Ok(Vec::new());
        };
        let mut dbcs: Vec<DynamicBindConfiguration> = ctx
            .store
            .list(ctx.namespace(), &labels_selector([(SCHEDULED_EVENT_LABEL, se.as_str())]))
            .await?;
        dbcs.retain(|dbc| {
            restricted_bind_allows(
                self.spec.restricted_bind,
                &self.spec.restricted_bind_value,
                dbc.spec
                    .restricted_bind
                    .then_some(dbc.spec.restricted_bind_value.as_str()),
            )
        });
        dbcs.sort_by_key(ResourceExt::name_any);
        Ok(dbcs)
    }

    async fn create_dynamic<S: ObjectStore>(
        &self,
        ctx: &Context<S>,
        dbc: &DynamicBindConfiguration,
        template: &str,
    ) -> Result<String> {
        let ns = ctx.namespace();
        let dbc_name = dbc.name_any();
        let vmt = ctx
            .store
            .get::<VirtualMachineTemplate>(ns, template)
            .await?
            .ok_or_else(|| Error::InvalidSpec(format!("unknown template {template}")))?;

        let base_name = if dbc.spec.base_name.is_empty() {
            dbc_name.as_str()
        } else {
            dbc.spec.base_name.as_str()
        };
        let vm_name = format!("{base_name}-{}", random_suffix());

        let mut labels = BTreeMap::from([
            (DYNAMIC_LABEL.to_owned(), bool_label(true)),
            (DBC_LABEL.to_owned(), dbc_name.clone()),
            (VM_CLAIM_LABEL.to_owned(), self.name_any()),
            (ENVIRONMENT_LABEL.to_owned(), dbc.spec.environment.clone()),
        ]);
        if let Some(se) = dbc.labels().get(SCHEDULED_EVENT_LABEL) {
            labels.insert(SCHEDULED_EVENT_LABEL.to_owned(), se.clone());
        }
        labels.extend(restricted_bind_labels(
            dbc.spec.restricted_bind,
            &dbc.spec.restricted_bind_value,
        ));

        info!("Creating dynamic VirtualMachine {vm_name} from {dbc_name} for VirtualMachineClaim {}", self.name_any());
        let created = create_virtual_machine(
            &ctx.store,
            ns,
            &vm_name,
            &vmt,
            &dbc.spec.environment,
            &owner_ref(dbc)?,
            labels,
        )
        .await?;
        ctx.metrics.dynamic_vms_created.inc();

        if !try_claim(ctx, self, created).await? {
            return Err(Error::Conflict {
                kind: "VirtualMachine".into(),
                name: vm_name,
            });
        }
        Ok(vm_name)
    }
}

/// `burstCountCapacity[template]` minus the dynamic VMs each configuration already holds
async fn remaining_budgets<S: ObjectStore>(
    ctx: &Context<S>,
    candidates: &[DynamicBindConfiguration],
    template: &str,
) -> Result<BTreeMap<String, i64>> {
    let template_key = template_label(template);
    let mut budgets = BTreeMap::new();
    for dbc in candidates {
        let capacity = i64::from(dbc.capacity_for(template));
        if capacity <= 0 {
            continue;
        }
        let name = dbc.name_any();
        let used = ctx
            .store
            .list::<VirtualMachine>(
                ctx.namespace(),
                &labels_selector([
                    (DYNAMIC_LABEL, "true"),
                    (DBC_LABEL, name.as_str()),
                    (template_key.as_str(), "true"),
                ]),
            )
            .await?
            .len();
        budgets.insert(name, capacity - i64::try_from(used).unwrap_or(i64::MAX));
    }
    Ok(budgets)
}

/// Greatest positive budget wins; ties go to the smallest name
fn pick_configuration<'a>(
    candidates: &'a [DynamicBindConfiguration],
    budgets: &BTreeMap<String, i64>,
) -> Option<&'a DynamicBindConfiguration> {
    let mut best: Option<(&DynamicBindConfiguration, i64)> = None;
    for dbc in candidates {
        let Some(&budget) = budgets.get(&dbc.name_any()) else {
            continue;
        };
        if budget <= 0 {
            continue;
        }
        match best {
            Some((_, top)) if top >= budget => {}
            _ => best = Some((dbc, budget)),
        }
    }
    best.map(|(dbc, _)| dbc)
}

/// Initialize the controller. A single worker keeps budgets from being overcommitted.
pub async fn run<S: ObjectStore>(ctx: Arc<Context<S>>, token: CancellationToken, terms: Terms) {
    Controller::<VirtualMachineClaim, S>::new(
        ctx.store.clone(),
        ctx.namespace(),
        ctx.dynamic_bind_queue.clone(),
    )
    .enqueue_primary(false)
    .workers(1)
    .run(reconcile, ctx, token, terms)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::dynamicbindconfigurations::DynamicBindConfigurationSpec;

    fn dbc(name: &str) -> DynamicBindConfiguration {
        DynamicBindConfiguration::new(name, DynamicBindConfigurationSpec::default())
    }

    #[test]
    fn greatest_budget_wins_and_ties_go_to_smallest_name() {
        let candidates = vec![dbc("a"), dbc("b"), dbc("c")];

        let budgets = BTreeMap::from([("a".to_owned(), 1), ("b".to_owned(), 3), ("c".to_owned(), 3)]);
        assert_eq!(
            pick_configuration(&candidates, &budgets).map(|d| d.name_any()),
            Some("b".to_owned())
        );

        let exhausted = BTreeMap::from([("a".to_owned(), 0), ("b".to_owned(), -1)]);
        assert!(pick_configuration(&candidates, &exhausted).is_none());
    }
}
