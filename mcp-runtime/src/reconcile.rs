//! Test run membership reconciliation.
//!
//! The two deployment variants expose different write contracts for run
//! membership. Datacenter's run update is a true full-replace: every PUT
//! must carry the complete item collection, so desired keys have to be
//! diffed against fetched state or existing members would be dropped.
//! Cloud accepts the desired key list directly and upserts server-side,
//! which makes the read-before-write unnecessary there.

use std::collections::HashSet;

use serde_json::{Value, json};

/// Execution status assigned to newly added run items.
pub(crate) const NOT_EXECUTED_STATUS: &str = "Not Executed";

/// Which product edition the target platform is. Fixed at configuration
/// time; selects payload shapes and the membership write strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum DeploymentVariant {
    Cloud,
    Datacenter,
}

impl DeploymentVariant {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DeploymentVariant::Cloud => "cloud",
            DeploymentVariant::Datacenter => "datacenter",
        }
    }

    /// Whether adding run members must fetch current state first. True only
    /// for datacenter, whose update API is full-replace.
    pub(crate) fn requires_read_before_write(self) -> bool {
        matches!(self, DeploymentVariant::Datacenter)
    }
}

/// Outcome of diffing desired member keys against a run's current items.
#[derive(Debug, PartialEq)]
pub(crate) enum MembershipUpdate {
    /// Every desired key is already a member; nothing to write.
    NoChange,
    /// Complete item list to resend: existing items first, in their
    /// original order, then the new items.
    FullReplace { items: Vec<Value>, added: usize },
}

/// Computes the datacenter membership update. Desired keys already present
/// are skipped, as are duplicates within the desired list itself.
pub(crate) fn merge_run_items(existing: &[Value], desired: &[String]) -> MembershipUpdate {
    let existing_keys: HashSet<&str> = existing
        .iter()
        .filter_map(|item| item.get("testCaseKey").and_then(Value::as_str))
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut new_items: Vec<Value> = Vec::new();
    for key in desired {
        if existing_keys.contains(key.as_str()) || !seen.insert(key.as_str()) {
            continue;
        }
        new_items.push(json!({
            "testCaseKey": key,
            "testResultStatus": NOT_EXECUTED_STATUS
        }));
    }

    if new_items.is_empty() {
        return MembershipUpdate::NoChange;
    }

    let added = new_items.len();
    let mut items = existing.to_vec();
    items.extend(new_items);
    MembershipUpdate::FullReplace { items, added }
}

/// Cloud membership payload: the desired key list as-is. The endpoint is
/// idempotent on repeated keys, so no client-side diff is needed.
pub(crate) fn cloud_membership_payload(desired: &[String]) -> Value {
    json!({ "items": desired })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, status: &str) -> Value {
        json!({ "testCaseKey": key, "testResultStatus": status })
    }

    #[test]
    fn only_missing_keys_are_added() {
        let existing = vec![item("PROJ-T1", "Pass"), item("PROJ-T2", "Fail")];
        let desired = vec!["PROJ-T2".to_string(), "PROJ-T3".to_string()];

        let MembershipUpdate::FullReplace { items, added } = merge_run_items(&existing, &desired)
        else {
            panic!("expected a full-replace update");
        };
        assert_eq!(added, 1);
        assert_eq!(items.len(), 3);
        // Existing items keep their order and statuses.
        assert_eq!(items[0], existing[0]);
        assert_eq!(items[1], existing[1]);
        assert_eq!(items[2]["testCaseKey"], "PROJ-T3");
        assert_eq!(items[2]["testResultStatus"], NOT_EXECUTED_STATUS);
    }

    #[test]
    fn subset_of_existing_yields_no_change() {
        let existing = vec![item("PROJ-T1", "Pass"), item("PROJ-T2", "Fail")];
        let desired = vec!["PROJ-T1".to_string(), "PROJ-T2".to_string()];
        assert_eq!(merge_run_items(&existing, &desired), MembershipUpdate::NoChange);
    }

    #[test]
    fn duplicate_desired_keys_are_added_once() {
        let desired = vec![
            "PROJ-T9".to_string(),
            "PROJ-T9".to_string(),
            "PROJ-T9".to_string(),
        ];
        let MembershipUpdate::FullReplace { items, added } = merge_run_items(&[], &desired) else {
            panic!("expected a full-replace update");
        };
        assert_eq!(added, 1);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn empty_run_accepts_all_desired_keys() {
        let desired = vec!["PROJ-T1".to_string(), "PROJ-T2".to_string()];
        let MembershipUpdate::FullReplace { items, added } = merge_run_items(&[], &desired) else {
            panic!("expected a full-replace update");
        };
        assert_eq!(added, 2);
        assert_eq!(items[0]["testCaseKey"], "PROJ-T1");
    }

    #[test]
    fn cloud_payload_sends_desired_keys_directly() {
        let desired = vec!["PROJ-T1".to_string(), "PROJ-T2".to_string()];
        assert_eq!(
            cloud_membership_payload(&desired),
            json!({ "items": ["PROJ-T1", "PROJ-T2"] })
        );
    }

    #[test]
    fn only_datacenter_requires_read_before_write() {
        assert!(DeploymentVariant::Datacenter.requires_read_before_write());
        assert!(!DeploymentVariant::Cloud.requires_read_before_write());
    }
}
