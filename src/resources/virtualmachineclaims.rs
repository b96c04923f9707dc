use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A user's request for one or more VMs, keyed by a friendly name.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "VirtualMachineClaim",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    status = "VirtualMachineClaimStatus",
    shortname = "vmc",
    printcolumn = r#"{"name":"User", "type":"string", "jsonPath":".spec.userId"}"#,
    printcolumn = r#"{"name":"Bound", "type":"boolean", "jsonPath":".status.bound"}"#,
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".status.bindMode"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClaimSpec {
    pub user_id: String,
    #[serde(default)]
    pub virtual_machines: BTreeMap<String, VirtualMachineClaimVm>,
    #[serde(default)]
    pub dynamic_capable: bool,
    #[serde(default)]
    pub restricted_bind: bool,
    #[serde(default)]
    pub restricted_bind_value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClaimVm {
    pub template: String,
    /// Empty while unbound
    #[serde(default)]
    pub virtual_machine_id: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClaimStatus {
    #[serde(default)]
    pub bound: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_mode: Option<BindMode>,
    #[serde(default)]
    pub tainted: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Static,
    Dynamic,
}

impl VirtualMachineClaim {
    pub fn is_bound(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.bound)
    }

    /// Friendly names of entries without a VM
    pub fn unbound_entries(&self) -> impl Iterator<Item = (&String, &VirtualMachineClaimVm)> {
        self.spec
            .virtual_machines
            .iter()
            .filter(|(_, vm)| vm.virtual_machine_id.is_empty())
    }

    pub fn bound_vm_ids(&self) -> impl Iterator<Item = &str> {
        self.spec
            .virtual_machines
            .values()
            .map(|vm| vm.virtual_machine_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_mode_is_lowercase_on_the_wire() {
        let status = VirtualMachineClaimStatus {
            bind_mode: Some(BindMode::Dynamic),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["bindMode"], "dynamic");
    }

    #[test]
    fn splits_bound_and_unbound_entries() {
        let vmc = VirtualMachineClaim::new(
            "vmc-1",
            VirtualMachineClaimSpec {
                user_id: "u-1".into(),
                virtual_machines: BTreeMap::from([
                    (
                        "node1".into(),
                        VirtualMachineClaimVm {
                            template: "tmplX".into(),
                            virtual_machine_id: "vm-a".into(),
                        },
                    ),
                    (
                        "node2".into(),
                        VirtualMachineClaimVm {
                            template: "tmplX".into(),
                            virtual_machine_id: String::new(),
                        },
                    ),
                ]),
                ..Default::default()
            },
        );
        assert_eq!(vmc.bound_vm_ids().collect::<Vec<_>>(), vec!["vm-a"]);
        assert_eq!(
            vmc.unbound_entries().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["node2"]
        );
        assert!(!vmc.is_bound());
    }
}
