use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::Error;

pub mod duration_parser;
pub mod timestamps;
pub mod virtual_machines;

pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "hobbyfarm-operator";

/// Eight lowercase hex characters, used to keep generated child names unique
pub fn random_suffix() -> String {
    format!("{:08x}", rand::random::<u32>())
}

pub fn object_meta(
    oref: &OwnerReference,
    name: &str,
    namespace: &str,
    mut labels: BTreeMap<String, String>,
) -> ObjectMeta {
    labels.insert(APP_MANAGED_BY_LABEL.into(), MANAGER_NAME.into());
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: Some(labels),
        owner_references: Some(vec![oref.clone()]),
        ..Default::default()
    }
}

/// Controller owner reference to a stored object
pub fn owner_ref<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference, Error> {
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvalidSpec(format!(
            "{} {} has no uid yet",
            K::kind(&()),
            owner.name_any()
        ))
    })
}

pub fn is_owned_by<K: Resource>(obj: &K, owner_uid: &str) -> bool {
    obj.owner_references().iter().any(|r| r.uid == owner_uid)
}

/// Name of the first owner of the given kind
pub fn owner_name<K: Resource, O: Resource<DynamicType = ()>>(obj: &K) -> Option<String> {
    obj.owner_references()
        .iter()
        .find(|r| r.kind == O::kind(&()))
        .map(|r| r.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::scheduledevents::ScheduledEvent;
    use crate::resources::virtualmachinesets::VirtualMachineSet;

    #[test]
    fn random_suffix_is_eight_hex_chars() {
        let s = random_suffix();
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn object_meta_marks_managed_children() {
        let oref = OwnerReference {
            api_version: "hobbyfarm.io/v1".into(),
            kind: "ScheduledEvent".into(),
            name: "se-a".into(),
            uid: "uid-1".into(),
            controller: Some(true),
            ..Default::default()
        };
        let meta = object_meta(&oref, "child", "hf", BTreeMap::new());
        let mut vmset = VirtualMachineSet::new("child", Default::default());
        vmset.metadata = meta;

        assert!(is_owned_by(&vmset, "uid-1"));
        assert!(!is_owned_by(&vmset, "uid-2"));
        assert_eq!(
            owner_name::<_, ScheduledEvent>(&vmset).as_deref(),
            Some("se-a")
        );
        assert_eq!(
            vmset.labels().get(APP_MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGER_NAME)
        );
    }
}
