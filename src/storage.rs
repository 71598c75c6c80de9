//! Thread-safe in-memory storage for the currently active flag configurations and cohorts.
//!
//! Both storages hand out *snapshots*: an `Arc` of the whole map that is not affected by further
//! writes. Writers never mutate a published map in place; they build a new map and swap it in, so
//! a reader always observes a complete, internally consistent set.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use crate::{cohort::Cohort, flag::FlagConfig, flag::USER_GROUP_TYPE};

/// Snapshot of all flag configurations, keyed by flag key.
pub type FlagConfigSnapshot = Arc<HashMap<String, Arc<FlagConfig>>>;

/// Snapshot of all cohorts, keyed by cohort id.
pub type CohortSnapshot = Arc<HashMap<String, Arc<Cohort>>>;

/// Storage for flag configurations.
pub trait FlagConfigStorage: Send + Sync {
    fn get_flag_config(&self, key: &str) -> Option<Arc<FlagConfig>>;

    /// Get a snapshot of all flag configurations.
    fn get_flag_configs(&self) -> FlagConfigSnapshot;

    /// Publish `flags`, replacing flags with the same keys. All flags become visible at once.
    fn put_flag_configs(&self, flags: Vec<FlagConfig>);

    /// Remove all flags for which `predicate` returns `true`.
    fn remove_if(&self, predicate: &dyn Fn(&FlagConfig) -> bool);
}

/// Storage for downloaded cohorts.
pub trait CohortStorage: Send + Sync {
    fn get_cohort(&self, cohort_id: &str) -> Option<Arc<Cohort>>;

    /// Get a snapshot of all cohorts.
    fn get_cohorts(&self) -> CohortSnapshot;

    /// Returns the subset of `cohort_ids` that contain `user_id`.
    fn get_cohorts_for_user(&self, user_id: &str, cohort_ids: &HashSet<String>) -> HashSet<String> {
        self.get_cohorts_for_group(USER_GROUP_TYPE, user_id, cohort_ids)
    }

    /// Returns the subset of `cohort_ids` of the given `group_type` that contain `group_name`.
    fn get_cohorts_for_group(
        &self,
        group_type: &str,
        group_name: &str,
        cohort_ids: &HashSet<String>,
    ) -> HashSet<String> {
        let cohorts = self.get_cohorts();
        cohort_ids
            .iter()
            .filter(|id| {
                cohorts.get(*id).is_some_and(|cohort| {
                    cohort.group_type == group_type && cohort.member_ids.contains(group_name)
                })
            })
            .cloned()
            .collect()
    }

    fn put_cohort(&self, cohort: Cohort);

    fn delete_cohort(&self, cohort_id: &str);
}

/// In-memory [`FlagConfigStorage`].
#[derive(Default)]
pub struct InMemoryFlagConfigStorage {
    flags: RwLock<FlagConfigSnapshot>,
}

impl InMemoryFlagConfigStorage {
    pub fn new() -> Self {
        InMemoryFlagConfigStorage::default()
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, Arc<FlagConfig>>)) {
        let mut slot = self
            .flags
            .write()
            .expect("thread holding flag storage lock should not panic");
        let mut next = HashMap::clone(&slot);
        f(&mut next);
        *slot = Arc::new(next);
    }
}

impl FlagConfigStorage for InMemoryFlagConfigStorage {
    fn get_flag_config(&self, key: &str) -> Option<Arc<FlagConfig>> {
        self.get_flag_configs().get(key).cloned()
    }

    fn get_flag_configs(&self) -> FlagConfigSnapshot {
        // read() only fails if a writer panicked while holding the lock, which should never
        // happen.
        self.flags
            .read()
            .expect("thread holding flag storage lock should not panic")
            .clone()
    }

    fn put_flag_configs(&self, flags: Vec<FlagConfig>) {
        if flags.is_empty() {
            return;
        }
        // Constructing new values before requesting the lock to minimize lock span.
        let flags: Vec<_> = flags
            .into_iter()
            .map(|flag| (flag.key.clone(), Arc::new(flag)))
            .collect();
        self.update(|map| map.extend(flags));
    }

    fn remove_if(&self, predicate: &dyn Fn(&FlagConfig) -> bool) {
        self.update(|map| map.retain(|_, flag| !predicate(flag)));
    }
}

/// In-memory [`CohortStorage`].
#[derive(Default)]
pub struct InMemoryCohortStorage {
    cohorts: RwLock<CohortSnapshot>,
}

impl InMemoryCohortStorage {
    pub fn new() -> Self {
        InMemoryCohortStorage::default()
    }
}

impl CohortStorage for InMemoryCohortStorage {
    fn get_cohort(&self, cohort_id: &str) -> Option<Arc<Cohort>> {
        self.get_cohorts().get(cohort_id).cloned()
    }

    fn get_cohorts(&self) -> CohortSnapshot {
        self.cohorts
            .read()
            .expect("thread holding cohort storage lock should not panic")
            .clone()
    }

    fn put_cohort(&self, cohort: Cohort) {
        let cohort = Arc::new(cohort);
        let mut slot = self
            .cohorts
            .write()
            .expect("thread holding cohort storage lock should not panic");
        let mut next = HashMap::clone(&slot);
        next.insert(cohort.id.clone(), cohort);
        *slot = Arc::new(next);
    }

    fn delete_cohort(&self, cohort_id: &str) {
        let mut slot = self
            .cohorts
            .write()
            .expect("thread holding cohort storage lock should not panic");
        if slot.contains_key(cohort_id) {
            let mut next = HashMap::clone(&slot);
            next.remove(cohort_id);
            *slot = Arc::new(next);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    };

    use super::{CohortStorage, FlagConfigStorage, InMemoryCohortStorage, InMemoryFlagConfigStorage};
    use crate::{cohort::Cohort, flag::tests::flag_with_cohorts};

    pub(crate) fn cohort(id: &str, last_modified: i64, members: &[&str]) -> Cohort {
        Cohort {
            id: id.to_owned(),
            group_type: "User".to_owned(),
            size: members.len(),
            last_modified,
            member_ids: members.iter().map(|m| (*m).to_owned()).collect(),
        }
    }

    #[test]
    fn can_put_flags_from_another_thread() {
        let storage = Arc::new(InMemoryFlagConfigStorage::new());
        assert!(storage.get_flag_configs().is_empty());

        {
            let storage = storage.clone();
            let _ = std::thread::spawn(move || {
                storage.put_flag_configs(vec![flag_with_cohorts("a", &[])]);
            })
            .join();
        }

        assert!(storage.get_flag_config("a").is_some());
    }

    #[test]
    fn snapshot_is_not_affected_by_later_writes() {
        let storage = InMemoryFlagConfigStorage::new();
        storage.put_flag_configs(vec![flag_with_cohorts("a", &[]), flag_with_cohorts("b", &[])]);

        let snapshot = storage.get_flag_configs();
        storage.remove_if(&|flag| flag.key == "a");
        storage.put_flag_configs(vec![flag_with_cohorts("c", &[])]);

        let keys: HashSet<_> = snapshot.keys().cloned().collect();
        assert_eq!(keys, HashSet::from(["a".to_owned(), "b".to_owned()]));

        let current: HashSet<_> = storage.get_flag_configs().keys().cloned().collect();
        assert_eq!(current, HashSet::from(["b".to_owned(), "c".to_owned()]));
    }

    #[test]
    fn put_replaces_flags_with_same_key() {
        let storage = InMemoryFlagConfigStorage::new();
        storage.put_flag_configs(vec![flag_with_cohorts("a", &[])]);
        storage.put_flag_configs(vec![flag_with_cohorts("a", &["c1"])]);

        let flag = storage.get_flag_config("a").unwrap();
        assert_eq!(flag.cohort_ids(), HashSet::from(["c1".to_owned()]));
    }

    #[test]
    fn cohort_membership_queries() {
        let storage = InMemoryCohortStorage::new();
        storage.put_cohort(cohort("c1", 1, &["u1", "u2"]));
        storage.put_cohort(cohort("c2", 1, &["u2"]));
        storage.put_cohort(Cohort {
            group_type: "org".to_owned(),
            ..cohort("g1", 1, &["acme"])
        });

        let ids: HashSet<String> = ["c1", "c2", "g1", "missing"]
            .into_iter()
            .map(str::to_owned)
            .collect();

        assert_eq!(
            storage.get_cohorts_for_user("u2", &ids),
            HashSet::from(["c1".to_owned(), "c2".to_owned()])
        );
        assert_eq!(
            storage.get_cohorts_for_group("org", "acme", &ids),
            HashSet::from(["g1".to_owned()])
        );
        assert!(storage.get_cohorts_for_user("acme", &ids).is_empty());
    }

    #[test]
    fn delete_cohort_removes_only_that_cohort() {
        let storage = InMemoryCohortStorage::new();
        storage.put_cohort(cohort("c1", 1, &[]));
        storage.put_cohort(cohort("c2", 1, &[]));

        storage.delete_cohort("c1");
        storage.delete_cohort("missing");

        let ids: HashMap<_, _> = storage
            .get_cohorts()
            .iter()
            .map(|(k, v)| (k.clone(), v.last_modified))
            .collect();
        assert_eq!(ids, HashMap::from([("c2".to_owned(), 1)]));
    }
}
