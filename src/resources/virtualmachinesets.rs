use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A fixed-size pool of VirtualMachines of one template in one environment.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "VirtualMachineSet",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    status = "VirtualMachineSetStatus",
    shortname = "vmset",
    printcolumn = r#"{"name":"Environment", "type":"string", "jsonPath":".spec.environment"}"#,
    printcolumn = r#"{"name":"Template", "type":"string", "jsonPath":".spec.vmTemplate"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.count"}"#,
    printcolumn = r#"{"name":"Provisioned", "type":"integer", "jsonPath":".status.provisionedCount"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSetSpec {
    #[schemars(range(min = 0))]
    pub count: i32,
    pub environment: String,
    pub vm_template: String,
    /// Prefix of the names of the VMs in this set
    pub base_name: String,
    #[serde(default)]
    pub restricted_bind: bool,
    #[serde(default)]
    pub restricted_bind_value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSetStatus {
    /// VMs reporting ready
    #[serde(default)]
    pub provisioned_count: i32,
    /// VMs that are ready, untainted and unallocated
    #[serde(default)]
    pub available_count: i32,
}

impl VirtualMachineSet {
    pub fn desired(&self) -> usize {
        self.spec.count.max(0) as usize
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.provisioned_count == self.spec.count)
            || self.spec.count == 0
    }
}
