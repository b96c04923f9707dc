use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::controllers::Context;
use crate::resources::environments::{
    CapacityMode, Environment, ResourceBudget, VirtualMachineTemplate,
};
use crate::resources::scheduledevents::ScheduledEvent;
use crate::resources::virtualmachinesets::VirtualMachineSet;
use crate::resources::{ENVIRONMENT_LABEL, SCHEDULED_EVENT_LABEL};
use crate::store::{labels_selector, ObjectStore};
use crate::Result;

/// Demand in one environment beyond what it declares it can host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overrun {
    pub environment: String,
    pub detail: String,
}

/// Compares the demand of `se` plus every other event's VMSets against the
/// capacity of each environment it uses. `templates` maps every template the
/// event declares to its per-VM cost.
pub async fn check_capacity<S: ObjectStore>(
    ctx: &Context<S>,
    se: &ScheduledEvent,
    environments: &BTreeMap<String, Environment>,
    templates: &BTreeMap<String, ResourceBudget>,
) -> Result<Vec<Overrun>> {
    let se_name = se.name_any();
    let mut overruns = Vec::new();

    for (env_name, needed) in &se.spec.required_virtual_machines {
        let Some(env) = environments.get(env_name) else {
            continue;
        };

        // our own sets are about to be replaced by `needed`
        let used: Vec<VirtualMachineSet> = ctx
            .store
            .list::<VirtualMachineSet>(
                ctx.namespace(),
                &labels_selector([(ENVIRONMENT_LABEL, env_name.as_str())]),
            )
            .await?
            .into_iter()
            .filter(|set| set.labels().get(SCHEDULED_EVENT_LABEL) != Some(&se_name))
            .collect();

        let detail = match env.spec.capacity_mode {
            CapacityMode::Count => count_overrun(&env.spec.count_capacity, &used, needed),
            CapacityMode::Raw => {
                let mut costs = templates.clone();
                for set in &used {
                    if costs.contains_key(&set.spec.vm_template) {
                        continue;
                    }
                    // sets of deleted templates cost nothing
                    if let Some(t) = ctx
                        .store
                        .get::<VirtualMachineTemplate>(ctx.namespace(), &set.spec.vm_template)
                        .await?
                    {
                        costs.insert(set.spec.vm_template.clone(), t.spec.resources);
                    }
                }
                raw_overrun(&env.spec.capacity, &costs, &used, needed)
            }
        };

        if let Some(detail) = detail {
            overruns.push(Overrun {
                environment: env_name.clone(),
                detail,
            });
        }
    }

    Ok(overruns)
}

fn count_overrun(
    capacity: &BTreeMap<String, i32>,
    used: &[VirtualMachineSet],
    needed: &BTreeMap<String, i32>,
) -> Option<String> {
    let mut demand: BTreeMap<&str, i64> = BTreeMap::new();
    for set in used {
        *demand.entry(set.spec.vm_template.as_str()).or_default() += i64::from(set.spec.count.max(0));
    }
    for (template, count) in needed {
        *demand.entry(template.as_str()).or_default() += i64::from((*count).max(0));
    }

    let over: Vec<String> = needed
        .keys()
        .filter_map(|template| {
            let wanted = demand.get(template.as_str()).copied().unwrap_or_default();
            let cap = i64::from(capacity.get(template).copied().unwrap_or_default());
            (wanted > cap).then(|| format!("{template} needs {wanted} of {cap}"))
        })
        .collect();

    (!over.is_empty()).then(|| over.join(", "))
}

fn raw_overrun(
    capacity: &ResourceBudget,
    costs: &BTreeMap<String, ResourceBudget>,
    used: &[VirtualMachineSet],
    needed: &BTreeMap<String, i32>,
) -> Option<String> {
    let demand = used
        .iter()
        .map(|set| (set.spec.vm_template.as_str(), set.spec.count))
        .chain(needed.iter().map(|(t, c)| (t.as_str(), *c)));

    let total = demand.fold(ResourceBudget::default(), |total, (template, count)| {
        match costs.get(template) {
            Some(cost) => total + *cost * i64::from(count.max(0)),
            None => total,
        }
    });

    let over = total.exceeded(capacity);
    (!over.is_empty()).then(|| format!("{} exceeded", over.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::virtualmachinesets::VirtualMachineSetSpec;

    fn set(template: &str, count: i32) -> VirtualMachineSet {
        VirtualMachineSet::new(
            "s",
            VirtualMachineSetSpec {
                count,
                vm_template: template.into(),
                environment: "env1".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn count_mode_only_reports_templates_the_event_needs() {
        let capacity = BTreeMap::from([("tmplX".to_owned(), 5), ("tmplY".to_owned(), 1)]);
        let used = vec![set("tmplX", 3), set("tmplY", 4)];

        let fits = BTreeMap::from([("tmplX".to_owned(), 2)]);
        assert_eq!(count_overrun(&capacity, &used, &fits), None);

        let too_many = BTreeMap::from([("tmplX".to_owned(), 3)]);
        assert_eq!(
            count_overrun(&capacity, &used, &too_many).as_deref(),
            Some("tmplX needs 6 of 5")
        );

        let undeclared = BTreeMap::from([("tmplZ".to_owned(), 1)]);
        assert!(count_overrun(&capacity, &used, &undeclared).is_some());
    }

    #[test]
    fn raw_mode_sums_template_costs() {
        let capacity = ResourceBudget {
            cpu: 8,
            memory: 16_384,
            storage: 100,
        };
        let costs = BTreeMap::from([(
            "tmplX".to_owned(),
            ResourceBudget {
                cpu: 2,
                memory: 4096,
                storage: 10,
            },
        )]);
        let used = vec![set("tmplX", 2), set("deleted", 50)];

        let fits = BTreeMap::from([("tmplX".to_owned(), 2)]);
        assert_eq!(raw_overrun(&capacity, &costs, &used, &fits), None);

        let too_many = BTreeMap::from([("tmplX".to_owned(), 3)]);
        assert_eq!(
            raw_overrun(&capacity, &costs, &used, &too_many).as_deref(),
            Some("cpu, memory exceeded")
        );
    }
}
