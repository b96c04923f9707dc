use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::debug;

use super::object_meta;
use crate::resources::environments::VirtualMachineTemplate;
use crate::resources::virtualmachines::{VirtualMachine, VirtualMachineSpec, VirtualMachineStatus};
use crate::resources::{bool_label, template_label, READY_LABEL};
use crate::runtime::retry::{update_status_with_retry, update_with_retry};
use crate::store::ObjectStore;
use crate::Result;

/// Creates an unallocated, not yet ready VM of `template` for the provisioner to pick up
pub async fn create_virtual_machine<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
    template: &VirtualMachineTemplate,
    environment: &str,
    oref: &OwnerReference,
    mut labels: BTreeMap<String, String>,
) -> Result<VirtualMachine> {
    let template_id = template.name_any();
    labels.insert(template_label(&template_id), "true".into());
    labels.insert(READY_LABEL.into(), bool_label(false));

    let mut vm = VirtualMachine::new(
        name,
        VirtualMachineSpec {
            virtual_machine_template_id: template_id,
            secret_name: format!("{name}-secret"),
            ssh_username: template.ssh_username().to_owned(),
            protocol: template.protocol().to_owned(),
            key_pair: String::new(),
            user_id: String::new(),
        },
    );
    vm.metadata = object_meta(oref, name, namespace, labels);

    debug!("Creating VirtualMachine {name}");
    let mut created = store.create(namespace, &vm).await?;
    created.status = Some(VirtualMachineStatus {
        environment_id: environment.to_owned(),
        ..Default::default()
    });
    store.replace_status(namespace, &created).await
}

/// Pulls a VM out of service; its owner recycles it once it is no longer allocated
pub async fn taint_virtual_machine<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
    release: bool,
) -> Result<()> {
    update_status_with_retry::<VirtualMachine, _, _>(store, namespace, name, |vm| {
        let status = vm.status.get_or_insert_with(Default::default);
        let before = status.clone();
        status.tainted = true;
        if release {
            status.allocated = false;
            status.ready = false;
        }
        *status != before
    })
    .await?;

    update_with_retry::<VirtualMachine, _, _>(store, namespace, name, |vm| {
        let labels = vm.labels_mut();
        let not_ready = bool_label(false);
        if labels.get(READY_LABEL) == Some(&not_ready) {
            return false;
        }
        labels.insert(READY_LABEL.into(), not_ready);
        true
    })
    .await?;
    Ok(())
}
