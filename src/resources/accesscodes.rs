use std::time::Duration;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::reconcilers::duration_parser::parse_duration;
use crate::Error;

/// A redeemable code granting access to the scenarios and courses of an event.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "AccessCode",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    shortname = "ac",
    printcolumn = r#"{"name":"Code", "type":"string", "jsonPath":".spec.code"}"#,
    printcolumn = r#"{"name":"Expiration", "type":"string", "jsonPath":".spec.expiration"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AccessCodeSpec {
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scenarios: Vec<String>,
    #[serde(default)]
    pub courses: Vec<String>,
    #[serde(default)]
    pub virtual_machine_sets: Vec<String>,
    /// Unix date string after which the code cannot be redeemed
    #[serde(default)]
    pub expiration: String,
    #[serde(default)]
    pub restricted_bind: bool,
    #[serde(default)]
    pub restricted_bind_value: String,
    #[serde(default)]
    pub printable: bool,
}

/// A single use code, redeemed by exactly one user.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "OneTimeAccessCode",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    shortname = "otac",
    printcolumn = r#"{"name":"User", "type":"string", "jsonPath":".spec.user"}"#,
    printcolumn = r#"{"name":"Redeemed", "type":"string", "jsonPath":".spec.redeemedTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeAccessCodeSpec {
    /// Subject that redeemed the code, empty until then
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub redeemed_timestamp: String,
    /// Optional cap on how long the code stays usable after redemption, e.g. `2d12h`
    #[serde(default)]
    pub max_duration: String,
}

impl OneTimeAccessCode {
    pub fn is_redeemed(&self) -> bool {
        !self.spec.user.is_empty()
    }

    pub fn max_duration(&self) -> Result<Option<Duration>, Error> {
        if self.spec.max_duration.trim().is_empty() {
            return Ok(None);
        }
        parse_duration(&self.spec.max_duration)
            .map(Some)
            .map_err(|e| {
                Error::InvalidSpec(format!(
                    "maxDuration of OneTimeAccessCode {}: {e}",
                    self.name_any()
                ))
            })
    }
}
