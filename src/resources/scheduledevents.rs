use std::collections::BTreeMap;
use std::hash::Hasher;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::reconcilers::timestamps;
use crate::Error;

/// A time window during which a fixed amount of lab capacity is reserved for
/// an access code.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ScheduledEvent",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    status = "ScheduledEventStatus",
    shortname = "se",
    printcolumn = r#"{"name":"AccessCode", "type":"string", "jsonPath":".spec.accessCode"}"#,
    printcolumn = r#"{"name":"Start", "type":"string", "jsonPath":".spec.startTime"}"#,
    printcolumn = r#"{"name":"End", "type":"string", "jsonPath":".spec.endTime"}"#,
    printcolumn = r#"{"name":"Provisioned", "type":"boolean", "jsonPath":".status.provisioned"}"#,
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Finished", "type":"boolean", "jsonPath":".status.finished"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEventSpec {
    /// Human readable name
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Subject that created the event
    #[serde(default)]
    pub creator: String,
    /// Start of the window, inclusive, as a Unix date string
    pub start_time: String,
    /// End of the window, exclusive, as a Unix date string
    pub end_time: String,
    /// When set no pools are created; every VM is provisioned on demand
    #[serde(default)]
    pub on_demand: bool,
    /// environment name -> template name -> number of VMs
    #[serde(default)]
    pub required_virtual_machines: BTreeMap<String, BTreeMap<String, i32>>,
    /// The code users redeem; also the name of the child AccessCode
    pub access_code: String,
    #[serde(default)]
    pub restricted_bind: bool,
    #[serde(default)]
    pub restricted_bind_value: String,
    #[serde(default)]
    pub printable: bool,
    #[serde(default)]
    pub scenarios: Vec<String>,
    #[serde(default)]
    pub courses: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEventStatus {
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub provisioned: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub virtual_machine_sets: Vec<String>,
    /// Hash of the spec the current children were built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
    /// Value of `spec.onDemand` when the children were built
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_on_demand: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ScheduledEventCondition>>,
}

fn default_active() -> bool {
    true
}

impl Default for ScheduledEventStatus {
    fn default() -> Self {
        Self {
            active: true,
            provisioned: false,
            ready: false,
            finished: false,
            virtual_machine_sets: Vec::new(),
            spec_hash: None,
            provisioned_on_demand: None,
            conditions: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEventCondition {
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,
    /// Human-readable message indicating details about last transition.
    pub message: Option<String>,
    /// Unique, one-word, CamelCase reason for the condition's last transition.
    pub reason: Option<String>,
    /// Status is the status of the condition. Can be True, False, Unknown.
    pub status: String,
    /// Type of the condition, `Valid` or `CapacityAvailable`.
    pub r#type: String,
}

pub const CONDITION_VALID: &str = "Valid";
pub const CONDITION_CAPACITY: &str = "CapacityAvailable";

impl ScheduledEventStatus {
    /// Sets or replaces a condition, keeping the transition time when the status did not change
    pub fn set_condition(
        &mut self,
        r#type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let status = if status { "True" } else { "False" }.to_owned();
        let conditions = self.conditions.get_or_insert_with(Vec::new);
        let existing = conditions.iter().position(|c| c.r#type == r#type);

        let last_transition_time = match existing.map(|i| &conditions[i]) {
            Some(c) if c.status == status => c.last_transition_time.clone(),
            _ => Some(Time(now)),
        };

        let condition = ScheduledEventCondition {
            last_transition_time,
            message: Some(message.into()),
            reason: Some(reason.to_owned()),
            status,
            r#type: r#type.to_owned(),
        };

        match existing {
            Some(i) => conditions[i] = condition,
            None => conditions.push(condition),
        }
    }

    pub fn condition(&self, r#type: &str) -> Option<&ScheduledEventCondition> {
        self.conditions
            .as_ref()
            .and_then(|c| c.iter().find(|c| c.r#type == r#type))
    }
}

impl ScheduledEvent {
    /// Parsed `[start, end)` window
    pub fn window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
        let start = timestamps::parse(&self.spec.start_time).map_err(|e| {
            Error::InvalidSpec(format!("startTime of ScheduledEvent {}: {e}", self.name_any()))
        })?;
        let end = timestamps::parse(&self.spec.end_time).map_err(|e| {
            Error::InvalidSpec(format!("endTime of ScheduledEvent {}: {e}", self.name_any()))
        })?;
        if end < start {
            return Err(Error::InvalidSpec(format!(
                "ScheduledEvent {} ends before it starts",
                self.name_any()
            )));
        }
        Ok((start, end))
    }

    pub fn is_active(&self) -> bool {
        self.status.as_ref().is_none_or(|s| s.active)
    }

    /// Restricted events default their tag to their own name
    pub fn restricted_bind_value(&self) -> String {
        if !self.spec.restricted_bind {
            return String::new();
        }
        if self.spec.restricted_bind_value.is_empty() {
            self.name_any()
        } else {
            self.spec.restricted_bind_value.clone()
        }
    }

    /// FNV-1a over the canonical JSON form of the spec
    pub fn spec_hash(&self) -> String {
        let mut hasher = fnv::FnvHasher::default();
        let canonical = serde_json::to_vec(&self.spec).unwrap_or_default();
        hasher.write(&canonical);
        format!("{:016x}", hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(start: &str, end: &str) -> ScheduledEvent {
        ScheduledEvent::new(
            "se-a",
            ScheduledEventSpec {
                name: "Event A".into(),
                start_time: start.into(),
                end_time: end.into(),
                access_code: "demo".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn window_parses_both_ends() {
        let se = event("Mon Jan  2 15:00:00 UTC 2006", "Mon Jan  2 16:00:00 UTC 2006");
        let (start, end) = se.window().unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2006, 1, 2, 15, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2006, 1, 2, 16, 0, 0).unwrap());
    }

    #[test]
    fn window_rejects_inverted_and_garbage() {
        let se = event("Mon Jan  2 16:00:00 UTC 2006", "Mon Jan  2 15:00:00 UTC 2006");
        assert!(matches!(se.window(), Err(Error::InvalidSpec(_))));
        let se = event("tomorrow", "Mon Jan  2 15:00:00 UTC 2006");
        assert!(matches!(se.window(), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn missing_status_means_active() {
        let se = event("", "");
        assert!(se.is_active());
        assert!(ScheduledEventStatus::default().active);
        let parsed: ScheduledEventStatus = serde_json::from_str("{}").unwrap();
        assert!(parsed.active);
    }

    #[test]
    fn restricted_value_defaults_to_name() {
        let mut se = event("", "");
        assert_eq!(se.restricted_bind_value(), "");
        se.spec.restricted_bind = true;
        assert_eq!(se.restricted_bind_value(), "se-a");
        se.spec.restricted_bind_value = "tenant".into();
        assert_eq!(se.restricted_bind_value(), "tenant");
    }

    #[test]
    fn spec_hash_tracks_spec_changes() {
        let mut se = event("a", "b");
        let before = se.spec_hash();
        assert_eq!(before, se.spec_hash());
        se.spec
            .required_virtual_machines
            .entry("env1".into())
            .or_default()
            .insert("tmpl".into(), 1);
        assert_ne!(before, se.spec_hash());
    }

    #[test]
    fn condition_transition_time_only_moves_on_change() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let mut status = ScheduledEventStatus::default();

        status.set_condition(CONDITION_VALID, false, "InvalidSpec", "bad", t0);
        status.set_condition(CONDITION_VALID, false, "InvalidSpec", "still bad", t1);
        let c = status.condition(CONDITION_VALID).unwrap();
        assert_eq!(c.last_transition_time, Some(Time(t0)));
        assert_eq!(c.message.as_deref(), Some("still bad"));

        status.set_condition(CONDITION_VALID, true, "Valid", "ok", t1);
        let c = status.condition(CONDITION_VALID).unwrap();
        assert_eq!(c.last_transition_time, Some(Time(t1)));
        assert_eq!(status.conditions.as_ref().unwrap().len(), 1);
    }
}
