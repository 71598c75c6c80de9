use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A behavioral cohort: a named set of user (or group) ids computed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cohort {
    #[serde(rename = "cohortId")]
    pub id: String,
    pub group_type: String,
    /// Declared size of the cohort, as reported by the server.
    pub size: usize,
    /// Version stamp of the cohort in epoch milliseconds. A cohort is only replaced by a strictly
    /// newer version.
    pub last_modified: i64,
    pub member_ids: HashSet<String>,
}

impl Cohort {
    /// Returns `true` if `other` is a strictly newer version of the same cohort.
    pub fn is_superseded_by(&self, other: &Cohort) -> bool {
        other.last_modified > self.last_modified
    }
}

/// Outcome of a cohort download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CohortDownload {
    /// The server returned a cohort body.
    Updated(Cohort),
    /// The cohort has not changed since the version the client already holds.
    NotModified,
    /// The cohort is larger than the configured maximum size and was not downloaded.
    TooLarge,
}
