use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{label_is_true, DYNAMIC_LABEL};

/// A single lab machine. The provisioner fills in its status.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "VirtualMachine",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    status = "VirtualMachineStatus",
    shortname = "vm",
    printcolumn = r#"{"name":"Template", "type":"string", "jsonPath":".spec.virtualMachineTemplateId"}"#,
    printcolumn = r#"{"name":"User", "type":"string", "jsonPath":".spec.userId"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"IP", "type":"string", "jsonPath":".status.publicIP", "priority": 1}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    pub virtual_machine_template_id: String,
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub ssh_username: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub key_pair: String,
    /// Set once the VM is bound to a claim
    #[serde(default)]
    pub user_id: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, rename = "publicIP")]
    pub public_ip: String,
    #[serde(default, rename = "privateIP")]
    pub private_ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub environment_id: String,
    #[serde(default)]
    pub allocated: bool,
    #[serde(default)]
    pub tainted: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub phase: VmPhase,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum VmPhase {
    #[default]
    Provisioning,
    Running,
    Terminating,
    Failed,
}

impl VirtualMachine {
    pub fn is_allocated(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.allocated)
    }

    pub fn is_tainted(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.tainted)
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ready)
    }

    pub fn is_dynamic(&self) -> bool {
        label_is_true(self.labels(), DYNAMIC_LABEL)
    }

    /// Free for a new claim
    pub fn is_available(&self) -> bool {
        self.is_ready() && !self.is_tainted() && !self.is_allocated()
    }
}
