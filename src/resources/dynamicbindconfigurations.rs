use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Burst budget substituted for `0` or `-1` on events that are not on-demand
pub const LEGACY_BURST_CAPACITY: i32 = 10;

/// Per event, per environment ceiling on VMs created on demand.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "DynamicBindConfiguration",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    shortname = "dbc",
    printcolumn = r#"{"name":"Environment", "type":"string", "jsonPath":".spec.environment"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DynamicBindConfigurationSpec {
    pub environment: String,
    /// Prefix of the names of dynamically created VMs
    pub base_name: String,
    /// template name -> max number of dynamic VMs
    #[serde(default)]
    pub burst_count_capacity: BTreeMap<String, i32>,
    #[serde(default)]
    pub restricted_bind: bool,
    #[serde(default)]
    pub restricted_bind_value: String,
}

/// Budget declared for one template of an event
pub fn burst_capacity(on_demand: bool, count: i32) -> i32 {
    if !on_demand && (count == 0 || count == -1) {
        LEGACY_BURST_CAPACITY
    } else {
        count
    }
}

impl DynamicBindConfiguration {
    pub fn capacity_for(&self, template: &str) -> i32 {
        self.spec
            .burst_count_capacity
            .get(template)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_substitution_only_applies_to_pooled_events() {
        assert_eq!(burst_capacity(false, 0), 10);
        assert_eq!(burst_capacity(false, -1), 10);
        assert_eq!(burst_capacity(false, 2), 2);
        assert_eq!(burst_capacity(true, 0), 0);
        assert_eq!(burst_capacity(true, 3), 3);
    }

    #[test]
    fn unknown_template_has_no_budget() {
        let dbc = DynamicBindConfiguration::new(
            "se-a-env1-dbc",
            DynamicBindConfigurationSpec {
                environment: "env1".into(),
                burst_count_capacity: BTreeMap::from([("tmplX".into(), 3)]),
                ..Default::default()
            },
        );
        assert_eq!(dbc.capacity_for("tmplX"), 3);
        assert_eq!(dbc.capacity_for("tmplY"), 0);
    }
}
