use std::collections::BTreeMap;

pub mod accesscodes;
pub mod dynamicbindconfigurations;
pub mod environments;
pub mod progress;
pub mod scheduledevents;
pub mod sessions;
pub mod virtualmachineclaims;
pub mod virtualmachines;
pub mod virtualmachinesets;

pub const SCHEDULED_EVENT_LABEL: &str = "scheduledevent";
pub const ENVIRONMENT_LABEL: &str = "environment";
pub const VMSET_LABEL: &str = "vmset";
pub const ACCESS_CODE_LABEL: &str = "accesscode";
pub const OTAC_LABEL: &str = "otac";
pub const SESSION_LABEL: &str = "session";
pub const USER_LABEL: &str = "user";
pub const DYNAMIC_LABEL: &str = "dynamic";
pub const DBC_LABEL: &str = "dbc";
pub const VM_CLAIM_LABEL: &str = "vmclaim";
pub const RESTRICTED_BIND_LABEL: &str = "restrictedbind";
pub const RESTRICTED_BIND_VALUE_LABEL: &str = "restrictedbindvalue";
pub const FINISHED_LABEL: &str = "finished";
pub const READY_LABEL: &str = "ready";
pub const TAINTED_LABEL: &str = "tainted";
pub const TEMPLATE_LABEL_PREFIX: &str = "virtualmachinetemplate";

/// Label marking an object as belonging to a VirtualMachineTemplate
pub fn template_label(template: &str) -> String {
    format!("{TEMPLATE_LABEL_PREFIX}/{template}")
}

pub fn bool_label(value: bool) -> String {
    value.to_string()
}

pub fn label_is_true(labels: &BTreeMap<String, String>, key: &str) -> bool {
    labels.get(key).is_some_and(|v| v == "true")
}

/// Labels propagating a restricted-bind constraint from a parent to its children
pub fn restricted_bind_labels(restricted_bind: bool, value: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(
        RESTRICTED_BIND_LABEL.to_owned(),
        bool_label(restricted_bind),
    )]);
    if restricted_bind {
        labels.insert(RESTRICTED_BIND_VALUE_LABEL.to_owned(), value.to_owned());
    }
    labels
}

/// A restricted claimant may only take resources tagged with the same value.
/// Unrestricted claimants take anything.
pub fn restricted_bind_allows(
    claimant_restricted: bool,
    claimant_value: &str,
    candidate_value: Option<&str>,
) -> bool {
    !claimant_restricted || candidate_value == Some(claimant_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_claimant_binds_anything() {
        assert!(restricted_bind_allows(false, "", None));
        assert!(restricted_bind_allows(false, "", Some("tenant-a")));
    }

    #[test]
    fn restricted_claimant_needs_matching_value() {
        assert!(restricted_bind_allows(true, "tenant-a", Some("tenant-a")));
        assert!(!restricted_bind_allows(true, "tenant-a", Some("tenant-b")));
        assert!(!restricted_bind_allows(true, "tenant-a", None));
    }

    #[test]
    fn restricted_labels_only_carry_value_when_restricted() {
        let open = restricted_bind_labels(false, "ignored");
        assert_eq!(open.get(RESTRICTED_BIND_LABEL).map(String::as_str), Some("false"));
        assert!(!open.contains_key(RESTRICTED_BIND_VALUE_LABEL));

        let closed = restricted_bind_labels(true, "se-1");
        assert_eq!(closed.get(RESTRICTED_BIND_VALUE_LABEL).map(String::as_str), Some("se-1"));
    }

    #[test]
    fn template_label_is_keyed_by_template_name() {
        assert_eq!(template_label("ubuntu-22"), "virtualmachinetemplate/ubuntu-22");
    }
}
