use std::collections::BTreeMap;
use std::ops::{Add, Mul};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const SSH_USERNAME_KEY: &str = "ssh_username";
pub const PROTOCOL_KEY: &str = "protocol";
pub const DEFAULT_SSH_USERNAME: &str = "ubuntu";
pub const DEFAULT_PROTOCOL: &str = "ssh";

/// An infrastructure target VMs are provisioned into.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Environment",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    shortname = "env",
    printcolumn = r#"{"name":"Provider", "type":"string", "jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.capacityMode"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub capacity_mode: CapacityMode,
    /// Total resources, used in raw mode
    #[serde(default)]
    pub capacity: ResourceBudget,
    /// template name -> max number of VMs, used in count mode
    #[serde(default)]
    pub count_capacity: BTreeMap<String, i32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CapacityMode {
    #[default]
    Raw,
    Count,
}

/// CPU cores, memory in MB, storage in GB
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBudget {
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub storage: i64,
}

impl Add for ResourceBudget {
    type Output = ResourceBudget;

    fn add(self, rhs: Self) -> Self::Output {
        ResourceBudget {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            storage: self.storage + rhs.storage,
        }
    }
}

impl Mul<i64> for ResourceBudget {
    type Output = ResourceBudget;

    fn mul(self, rhs: i64) -> Self::Output {
        ResourceBudget {
            cpu: self.cpu * rhs,
            memory: self.memory * rhs,
            storage: self.storage * rhs,
        }
    }
}

impl ResourceBudget {
    /// Names of the dimensions in which `self` exceeds `capacity`
    pub fn exceeded(&self, capacity: &ResourceBudget) -> Vec<&'static str> {
        let mut over = Vec::new();
        if self.cpu > capacity.cpu {
            over.push("cpu");
        }
        if self.memory > capacity.memory {
            over.push("memory");
        }
        if self.storage > capacity.storage {
            over.push("storage");
        }
        over
    }
}

/// The machine shape VMs are created from.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "VirtualMachineTemplate",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    shortname = "vmt",
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineTemplateSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub resources: ResourceBudget,
    /// Free-form settings such as `ssh_username` and `protocol`
    #[serde(default)]
    pub config_map: BTreeMap<String, String>,
}

impl VirtualMachineTemplate {
    pub fn ssh_username(&self) -> &str {
        self.config_value(SSH_USERNAME_KEY, DEFAULT_SSH_USERNAME)
    }

    pub fn protocol(&self) -> &str {
        self.config_value(PROTOCOL_KEY, DEFAULT_PROTOCOL)
    }

    fn config_value<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.spec
            .config_map
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_arithmetic() {
        let small = ResourceBudget {
            cpu: 2,
            memory: 4096,
            storage: 20,
        };
        let total = small * 3 + small;
        assert_eq!(
            total,
            ResourceBudget {
                cpu: 8,
                memory: 16384,
                storage: 80
            }
        );
        let capacity = ResourceBudget {
            cpu: 8,
            memory: 8192,
            storage: 100,
        };
        assert_eq!(total.exceeded(&capacity), vec!["memory"]);
    }

    #[test]
    fn template_config_defaults() {
        let mut tmpl = VirtualMachineTemplate::new("tmplX", Default::default());
        assert_eq!(tmpl.ssh_username(), "ubuntu");
        assert_eq!(tmpl.protocol(), "ssh");
        tmpl.spec
            .config_map
            .insert(PROTOCOL_KEY.into(), "rdp".into());
        assert_eq!(tmpl.protocol(), "rdp");
    }

    #[test]
    fn capacity_mode_wire_format() {
        let spec: EnvironmentSpec =
            serde_json::from_value(serde_json::json!({"capacityMode": "count"})).unwrap();
        assert_eq!(spec.capacity_mode, CapacityMode::Count);
    }
}
