use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::reconcilers::timestamps;
use crate::Error;

/// A learner working through a scenario or course on claimed VMs.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Session",
    group = "hobbyfarm.io",
    version = "v1",
    namespaced,
    status = "SessionStatus",
    shortname = "ss",
    printcolumn = r#"{"name":"User", "type":"string", "jsonPath":".spec.userId"}"#,
    printcolumn = r#"{"name":"Expires", "type":"string", "jsonPath":".status.expirationTime"}"#,
    printcolumn = r#"{"name":"Paused", "type":"boolean", "jsonPath":".status.paused"}"#,
    printcolumn = r#"{"name":"Finished", "type":"boolean", "jsonPath":".status.finished"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    pub user_id: String,
    #[serde(default)]
    pub course_id: String,
    #[serde(default)]
    pub scenario_id: String,
    #[serde(default, rename = "keepCourseVM")]
    pub keep_course_vm: bool,
    #[serde(default)]
    pub access_code: String,
    /// Names of the VirtualMachineClaims this session consumes
    #[serde(default)]
    pub vm_claim_set: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub expiration_time: String,
    #[serde(default)]
    pub paused: bool,
    /// End of the current pause
    #[serde(default)]
    pub paused_time: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub finished: bool,
}

impl Session {
    fn parse_field(&self, field: &str, value: &str) -> Result<Option<DateTime<Utc>>, Error> {
        timestamps::parse_opt(value).map_err(|e| {
            Error::InvalidSpec(format!("{field} of Session {}: {e}", self.name_any()))
        })
    }

    pub fn expiration(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let raw = self
            .status
            .as_ref()
            .map(|s| s.expiration_time.as_str())
            .unwrap_or_default();
        self.parse_field("expirationTime", raw)
    }

    pub fn paused_until(&self) -> Result<Option<DateTime<Utc>>, Error> {
        match &self.status {
            Some(s) if s.paused => self.parse_field("pausedTime", &s.paused_time),
            _ => Ok(None),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.finished)
    }

    /// Pushes the expiration to `now + keepalive`. Finished sessions stay finished.
    pub fn keep_alive(&mut self, now: DateTime<Utc>, keepalive: Duration) -> bool {
        if self.is_finished() {
            return false;
        }
        let status = self.status.get_or_insert_with(Default::default);
        status.expiration_time = timestamps::format(timestamps::saturating_after(now, keepalive));
        true
    }

    pub fn pause(&mut self, now: DateTime<Utc>, pause: Duration) -> bool {
        if self.is_finished() {
            return false;
        }
        let status = self.status.get_or_insert_with(Default::default);
        status.paused = true;
        status.paused_time = timestamps::format(timestamps::saturating_after(now, pause));
        true
    }

    pub fn resume(&mut self, now: DateTime<Utc>, keepalive: Duration) -> bool {
        if self.is_finished() {
            return false;
        }
        let status = self.status.get_or_insert_with(Default::default);
        status.paused = false;
        status.paused_time = String::new();
        status.expiration_time = timestamps::format(timestamps::saturating_after(now, keepalive));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn session() -> Session {
        Session::new(
            "ss-1",
            SessionSpec {
                user_id: "u-1".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn keep_alive_extends_expiration() {
        let mut ss = session();
        assert_eq!(ss.expiration().unwrap(), None);
        assert!(ss.keep_alive(now(), Duration::from_secs(300)));
        assert_eq!(
            ss.expiration().unwrap(),
            Some(now() + chrono::Duration::minutes(5))
        );
    }

    #[test]
    fn pause_then_resume() {
        let mut ss = session();
        ss.pause(now(), Duration::from_secs(7200));
        assert_eq!(
            ss.paused_until().unwrap(),
            Some(now() + chrono::Duration::hours(2))
        );

        let later = now() + chrono::Duration::minutes(30);
        ss.resume(later, Duration::from_secs(300));
        assert_eq!(ss.paused_until().unwrap(), None);
        assert_eq!(
            ss.expiration().unwrap(),
            Some(later + chrono::Duration::minutes(5))
        );
    }

    #[test]
    fn finished_sessions_are_not_extended() {
        let mut ss = session();
        ss.status = Some(SessionStatus {
            finished: true,
            ..Default::default()
        });
        assert!(!ss.keep_alive(now(), Duration::from_secs(300)));
        assert!(!ss.pause(now(), Duration::from_secs(300)));
        assert_eq!(ss.expiration().unwrap(), None);
    }

    #[test]
    fn garbage_expiration_is_invalid() {
        let mut ss = session();
        ss.status = Some(SessionStatus {
            expiration_time: "soon".into(),
            ..Default::default()
        });
        assert!(matches!(ss.expiration(), Err(Error::InvalidSpec(_))));
    }
}
