use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Learner progress through a scenario within one session.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Progress",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    plural = "progresses",
    printcolumn = r#"{"name":"Scenario", "type":"string", "jsonPath":".spec.scenario"}"#,
    printcolumn = r#"{"name":"Step", "type":"integer", "jsonPath":".spec.currentStep"}"#,
    printcolumn = r#"{"name":"Finished", "type":"string", "jsonPath":".spec.finished"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSpec {
    #[serde(default)]
    pub current_step: i32,
    #[serde(default)]
    pub max_step: i32,
    #[serde(default)]
    pub total_step: i32,
    #[serde(default)]
    pub course: String,
    #[serde(default)]
    pub scenario: String,
    pub user_id: String,
    #[serde(default)]
    pub started: String,
    #[serde(default)]
    pub last_update: String,
    #[serde(default)]
    pub finished: String,
}
