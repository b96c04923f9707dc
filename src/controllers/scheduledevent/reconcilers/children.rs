use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::*;

use crate::controllers::Context;
use crate::reconcilers::{is_owned_by, object_meta, owner_name, random_suffix, timestamps};
use crate::resources::accesscodes::{AccessCode, AccessCodeSpec};
use crate::resources::dynamicbindconfigurations::{
    burst_capacity, DynamicBindConfiguration, DynamicBindConfigurationSpec,
};
use crate::resources::scheduledevents::ScheduledEvent;
use crate::resources::virtualmachinesets::{VirtualMachineSet, VirtualMachineSetSpec};
use crate::resources::{
    restricted_bind_labels, template_label, ACCESS_CODE_LABEL, ENVIRONMENT_LABEL,
    SCHEDULED_EVENT_LABEL,
};
use crate::runtime::retry::update_with_retry;
use crate::store::{create_or_get, delete_if_exists, labels_selector, ObjectStore};
use crate::{Error, Result};

/// Fails when the access code is held by an object some other event owns
pub async fn check_access_code<S: ObjectStore>(ctx: &Context<S>, se: &ScheduledEvent) -> Result<()> {
    match ctx
        .store
        .get::<AccessCode>(ctx.namespace(), &se.spec.access_code)
        .await?
    {
        Some(existing) => ensure_ours(se, &existing),
        None => Ok(()),
    }
}

fn ensure_ours(se: &ScheduledEvent, code: &AccessCode) -> Result<()> {
    let uid = se.uid().unwrap_or_default();
    if is_owned_by(code, &uid) {
        return Ok(());
    }
    Err(Error::AccessCodeCollision {
        code: se.spec.access_code.clone(),
        owner: owner_name::<_, ScheduledEvent>(code).unwrap_or_else(|| "<unowned>".into()),
    })
}

/// Makes the children of a started event match its spec. Returns the names of its VMSets.
pub async fn reconcile_children<S: ObjectStore>(
    ctx: &Context<S>,
    se: &ScheduledEvent,
    oref: &OwnerReference,
    end: DateTime<Utc>,
) -> Result<Vec<String>> {
    let vmsets = reconcile_vmsets(ctx, se, oref).await?;
    reconcile_dynamic_bind_configurations(ctx, se, oref).await?;
    reconcile_access_code(ctx, se, oref, &vmsets, end).await?;
    Ok(vmsets)
}

fn base_labels(se: &ScheduledEvent, environment: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (SCHEDULED_EVENT_LABEL.to_owned(), se.name_any()),
        (ENVIRONMENT_LABEL.to_owned(), environment.to_owned()),
    ]);
    labels.extend(restricted_bind_labels(
        se.spec.restricted_bind,
        &se.restricted_bind_value(),
    ));
    labels
}

async fn reconcile_vmsets<S: ObjectStore>(
    ctx: &Context<S>,
    se: &ScheduledEvent,
    oref: &OwnerReference,
) -> Result<Vec<String>> {
    let ns = ctx.namespace();
    let se_name = se.name_any();
    let restricted_bind_value = se.restricted_bind_value();
    let existing: Vec<VirtualMachineSet> = ctx
        .store
        .list(ns, &labels_selector([(SCHEDULED_EVENT_LABEL, se_name.as_str())]))
        .await?;

    let mut names = Vec::new();
    for (environment, templates) in &se.spec.required_virtual_machines {
        for (template, count) in templates {
            if *count <= 0 || se.spec.on_demand {
                continue;
            }

            let found = existing
                .iter()
                .find(|set| set.spec.environment == *environment && set.spec.vm_template == *template);

            let name = match found {
                Some(set) => {
                    let name = set.name_any();
                    let unchanged = set.spec.count == *count
                        && set.spec.restricted_bind == se.spec.restricted_bind
                        && set.spec.restricted_bind_value == restricted_bind_value;
                    if !unchanged {
                        debug!("Updating VirtualMachineSet {name} to {count} replicas");
                        update_with_retry::<VirtualMachineSet, _, _>(&ctx.store, ns, &name, |set| {
                            set.spec.count = *count;
                            set.spec.restricted_bind = se.spec.restricted_bind;
                            set.spec.restricted_bind_value = restricted_bind_value.clone();
                            true
                        })
                        .await?;
                    }
                    name
                }
                None => {
                    let base_name = format!("{}-{}", ctx.settings.scheduled_prefix, random_suffix());
                    let name = format!("se-{se_name}-vms-{base_name}");
                    let mut labels = base_labels(se, environment);
                    labels.insert(template_label(template), "true".into());

                    let mut set = VirtualMachineSet::new(
                        &name,
                        VirtualMachineSetSpec {
                            count: *count,
                            environment: environment.clone(),
                            vm_template: template.clone(),
                            base_name,
                            restricted_bind: se.spec.restricted_bind,
                            restricted_bind_value: restricted_bind_value.clone(),
                        },
                    );
                    set.metadata = object_meta(oref, &name, ns, labels);

                    info!("Creating VirtualMachineSet {name} with {count} {template} in {environment}");
                    ctx.store.create(ns, &set).await?;
                    name
                }
            };
            names.push(name);
        }
    }

    let keep: BTreeSet<&String> = names.iter().collect();
    for set in &existing {
        let name = set.name_any();
        if !keep.contains(&name) {
            info!("Deleting VirtualMachineSet {name} which is no longer declared");
            delete_if_exists::<VirtualMachineSet, _>(&ctx.store, ns, &name).await?;
        }
    }

    Ok(names)
}

async fn reconcile_dynamic_bind_configurations<S: ObjectStore>(
    ctx: &Context<S>,
    se: &ScheduledEvent,
    oref: &OwnerReference,
) -> Result<()> {
    let ns = ctx.namespace();
    let se_name = se.name_any();
    let restricted_bind_value = se.restricted_bind_value();

    let mut declared = BTreeSet::new();
    for (environment, templates) in &se.spec.required_virtual_machines {
        let name = format!("{se_name}-{environment}-dbc");
        let burst_count_capacity: BTreeMap<String, i32> = templates
            .iter()
            .map(|(template, count)| (template.clone(), burst_capacity(se.spec.on_demand, *count)))
            .collect();

        let mut dbc = DynamicBindConfiguration::new(
            &name,
            DynamicBindConfigurationSpec {
                environment: environment.clone(),
                base_name: format!("{}-{}", ctx.settings.dynamic_prefix, random_suffix()),
                burst_count_capacity: burst_count_capacity.clone(),
                restricted_bind: se.spec.restricted_bind,
                restricted_bind_value: restricted_bind_value.clone(),
            },
        );
        dbc.metadata = object_meta(oref, &name, ns, base_labels(se, environment));

        let stored = create_or_get(&ctx.store, ns, &dbc).await?;
        let unchanged = stored.spec.burst_count_capacity == burst_count_capacity
            && stored.spec.restricted_bind == se.spec.restricted_bind
            && stored.spec.restricted_bind_value == restricted_bind_value;
        if !unchanged {
            debug!("Updating DynamicBindConfiguration {name}");
            update_with_retry::<DynamicBindConfiguration, _, _>(&ctx.store, ns, &name, |dbc| {
                dbc.spec.burst_count_capacity = burst_count_capacity.clone();
                dbc.spec.restricted_bind = se.spec.restricted_bind;
                dbc.spec.restricted_bind_value = restricted_bind_value.clone();
                true
            })
            .await?;
        }
        declared.insert(name);
    }

    let existing: Vec<DynamicBindConfiguration> = ctx
        .store
        .list(ns, &labels_selector([(SCHEDULED_EVENT_LABEL, se_name.as_str())]))
        .await?;
    for dbc in existing {
        let name = dbc.name_any();
        if !declared.contains(&name) {
            info!("Deleting DynamicBindConfiguration {name} which is no longer declared");
            delete_if_exists::<DynamicBindConfiguration, _>(&ctx.store, ns, &name).await?;
        }
    }
    Ok(())
}

async fn reconcile_access_code<S: ObjectStore>(
    ctx: &Context<S>,
    se: &ScheduledEvent,
    oref: &OwnerReference,
    vmsets: &[String],
    end: DateTime<Utc>,
) -> Result<()> {
    let ns = ctx.namespace();
    let name = se.spec.access_code.clone();
    let desired = AccessCodeSpec {
        code: name.clone(),
        description: se.spec.description.clone(),
        scenarios: se.spec.scenarios.clone(),
        courses: se.spec.courses.clone(),
        virtual_machine_sets: vmsets.to_vec(),
        expiration: timestamps::format(end),
        restricted_bind: se.spec.restricted_bind,
        restricted_bind_value: se.restricted_bind_value(),
        printable: se.spec.printable,
    };

    let mut labels = BTreeMap::from([
        (SCHEDULED_EVENT_LABEL.to_owned(), se.name_any()),
        (ACCESS_CODE_LABEL.to_owned(), name.clone()),
    ]);
    labels.extend(restricted_bind_labels(
        desired.restricted_bind,
        &desired.restricted_bind_value,
    ));

    let mut code = AccessCode::new(&name, desired.clone());
    code.metadata = object_meta(oref, &name, ns, labels);

    let stored = create_or_get(&ctx.store, ns, &code).await?;
    ensure_ours(se, &stored)?;
    if stored.spec != desired {
        debug!("Updating AccessCode {name}");
        update_with_retry::<AccessCode, _, _>(&ctx.store, ns, &name, |code| {
            code.spec = desired.clone();
            true
        })
        .await?;
    }
    Ok(())
}

/// Deletes the DBCs and the AccessCode of an event, and its VMSets if asked to
pub async fn release_children<S: ObjectStore>(
    ctx: &Context<S>,
    se: &ScheduledEvent,
    delete_vmsets: bool,
) -> Result<()> {
    let ns = ctx.namespace();
    let se_name = se.name_any();
    let owned = labels_selector([(SCHEDULED_EVENT_LABEL, se_name.as_str())]);

    if delete_vmsets {
        for set in ctx.store.list::<VirtualMachineSet>(ns, &owned).await? {
            info!("Deleting VirtualMachineSet {}", set.name_any());
            delete_if_exists::<VirtualMachineSet, _>(&ctx.store, ns, &set.name_any()).await?;
        }
    }

    for dbc in ctx.store.list::<DynamicBindConfiguration>(ns, &owned).await? {
        debug!("Deleting DynamicBindConfiguration {}", dbc.name_any());
        delete_if_exists::<DynamicBindConfiguration, _>(&ctx.store, ns, &dbc.name_any()).await?;
    }

    // never touch a code that another event holds
    if let Some(code) = ctx
        .store
        .get::<AccessCode>(ns, &se.spec.access_code)
        .await?
    {
        if ensure_ours(se, &code).is_ok() {
            debug!("Deleting AccessCode {}", code.name_any());
            delete_if_exists::<AccessCode, _>(&ctx.store, ns, &code.name_any()).await?;
        }
    }
    Ok(())
}
