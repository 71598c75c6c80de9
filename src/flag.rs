//! Flag configuration wire types.
//!
//! Flag configurations are mostly opaque to this crate: they are deserialized, stored and handed
//! over to the evaluation engine as-is. The only part interpreted here is the set of cohorts a flag
//! references, so that cohorts can be downloaded before the flag is published.
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Group type used for cohorts targeting users (as opposed to groups).
pub const USER_GROUP_TYPE: &str = "User";

const COHORT_IDS_SELECTOR: &str = "cohort_ids";

/// A single flag configuration, as served by the flag configuration endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagConfig {
    pub key: String,
    #[serde(default)]
    pub variants: BTreeMap<String, FlagVariant>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagVariant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Targeting rule. Bucketing and matching are left to the evaluation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<serde_json::Value>,
    /// Outer list is OR-ed, inner lists are AND-ed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Vec<Condition>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub selector: Vec<String>,
    pub op: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl FlagConfig {
    /// All cohort ids referenced by the flag, regardless of group type.
    pub fn cohort_ids(&self) -> HashSet<String> {
        self.grouped_cohort_ids().into_values().flatten().collect()
    }

    /// Cohort ids referenced by the flag, keyed by group type.
    pub fn grouped_cohort_ids(&self) -> HashMap<String, HashSet<String>> {
        let mut result: HashMap<String, HashSet<String>> = HashMap::new();
        let conditions = self
            .segments
            .iter()
            .filter_map(|segment| segment.conditions.as_ref())
            .flatten()
            .flatten();
        for condition in conditions {
            if let Some(group_type) = condition.cohort_group_type() {
                result
                    .entry(group_type.to_owned())
                    .or_default()
                    .extend(condition.values.iter().cloned());
            }
        }
        result
    }
}

impl Condition {
    /// Returns the group type if this condition matches on cohort membership.
    ///
    /// User cohorts are selected with `["context", "user", "cohort_ids"]`; group cohorts with
    /// `["context", "groups", <group type>, "cohort_ids"]`.
    fn cohort_group_type(&self) -> Option<&str> {
        match self.selector.as_slice() {
            [_, user, last] if user == "user" && last == COHORT_IDS_SELECTOR => {
                Some(USER_GROUP_TYPE)
            }
            [_, groups, group_type, last]
                if groups == "groups" && last == COHORT_IDS_SELECTOR =>
            {
                Some(group_type.as_str())
            }
            _ => None,
        }
    }
}

/// Union of cohort ids referenced by all `flags`.
pub fn cohort_ids_for_flags<'a>(flags: impl IntoIterator<Item = &'a FlagConfig>) -> HashSet<String> {
    flags.into_iter().flat_map(FlagConfig::cohort_ids).collect()
}
