//! Assignment and exposure tracking with deduplication.
//!
//! Evaluation results are reported to an [`AnalyticsSink`] at most once per distinct
//! `(user, device, flag → variant)` combination within the configured time-to-live.
use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    cache::Cache,
    config::AssignmentConfig,
    flag::FlagVariant,
    util::{canonicalize, stable_hash},
};

/// Result of evaluating a single flag.
pub type Variant = FlagVariant;

/// Event type of tracked assignments.
pub const ASSIGNMENT_EVENT_TYPE: &str = "[Experiment] Assignment";

/// Event type of tracked exposures.
pub const EXPOSURE_EVENT_TYPE: &str = "[Experiment] Exposure";

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// The subject flags were evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Flags evaluated for a user, keyed by flag key.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub user: User,
    pub results: HashMap<String, Variant>,
    pub timestamp: DateTime<Utc>,
}

/// Flag variants a user was actually exposed to, keyed by flag key.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub user: User,
    pub results: HashMap<String, Variant>,
    pub timestamp: DateTime<Utc>,
}

impl Assignment {
    pub fn new(user: User, results: HashMap<String, Variant>) -> Assignment {
        Assignment {
            user,
            results,
            timestamp: Utc::now(),
        }
    }

    /// Deduplication key of the assignment.
    pub fn canonicalize(&self) -> String {
        canonicalize_results(&self.user, &self.results)
    }
}

impl Exposure {
    pub fn new(user: User, results: HashMap<String, Variant>) -> Exposure {
        Exposure {
            user,
            results,
            timestamp: Utc::now(),
        }
    }

    pub fn canonicalize(&self) -> String {
        canonicalize_results(&self.user, &self.results)
    }
}

fn canonicalize_results(user: &User, results: &HashMap<String, Variant>) -> String {
    canonicalize(
        user.user_id.as_deref(),
        user.device_id.as_deref(),
        results
            .iter()
            .map(|(flag_key, variant)| (flag_key.as_str(), variant.key.as_deref())),
    )
}

/// Remembers recently seen canonical keys.
struct DedupFilter {
    cache: Cache<String, ()>,
}

impl DedupFilter {
    fn new(capacity: usize, ttl: Option<Duration>) -> DedupFilter {
        DedupFilter {
            cache: Cache::new(capacity, ttl),
        }
    }

    /// Returns `true` (and remembers `key`) if `key` has not been seen recently.
    fn should_track(&self, key: String) -> bool {
        self.cache.insert_if_absent(key, ())
    }
}

/// Decides whether an [`Assignment`] should be tracked.
pub struct AssignmentFilter {
    inner: DedupFilter,
}

impl AssignmentFilter {
    pub fn new(config: &AssignmentConfig) -> AssignmentFilter {
        AssignmentFilter {
            inner: DedupFilter::new(config.cache_capacity, config.ttl),
        }
    }

    #[cfg(test)]
    fn with_cache(cache: Cache<String, ()>) -> AssignmentFilter {
        AssignmentFilter {
            inner: DedupFilter { cache },
        }
    }

    /// Returns `true` if an equal assignment has not been tracked recently. Assignments without
    /// results are never tracked.
    pub fn should_track(&self, assignment: &Assignment) -> bool {
        !assignment.results.is_empty() && self.inner.should_track(assignment.canonicalize())
    }
}

/// Decides whether an [`Exposure`] should be tracked.
pub struct ExposureFilter {
    inner: DedupFilter,
}

impl ExposureFilter {
    pub fn new(config: &AssignmentConfig) -> ExposureFilter {
        ExposureFilter {
            inner: DedupFilter::new(config.cache_capacity, config.ttl),
        }
    }

    pub fn should_track(&self, exposure: &Exposure) -> bool {
        !exposure.results.is_empty() && self.inner.should_track(exposure.canonicalize())
    }
}

/// Event handed to the [`AnalyticsSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub event_properties: Map<String, Value>,
    /// Lets the analytics backend drop duplicates that slipped through (e.g., from other
    /// processes) within the same day.
    pub insert_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
}

/// Receives approved assignment and exposure events.
///
/// Any `Fn(AnalyticsEvent)` can be used as a sink:
///
/// ```
/// # use flagsync::assignment::{AnalyticsSink, AnalyticsEvent};
/// let sink = |event: AnalyticsEvent| println!("{}", event.insert_id);
/// # fn check(_: impl AnalyticsSink) {}
/// # check(sink);
/// ```
pub trait AnalyticsSink {
    fn track(&self, event: AnalyticsEvent);
}

impl<T: Fn(AnalyticsEvent)> AnalyticsSink for T {
    fn track(&self, event: AnalyticsEvent) {
        self(event);
    }
}

/// Turns deduplicated assignments and exposures into analytics events.
pub struct AssignmentService {
    assignment_filter: AssignmentFilter,
    exposure_filter: ExposureFilter,
    sink: Box<dyn AnalyticsSink + Send + Sync>,
}

impl AssignmentService {
    pub fn new(
        config: &AssignmentConfig,
        sink: impl AnalyticsSink + Send + Sync + 'static,
    ) -> AssignmentService {
        AssignmentService {
            assignment_filter: AssignmentFilter::new(config),
            exposure_filter: ExposureFilter::new(config),
            sink: Box::new(sink),
        }
    }

    /// Track `assignment` unless an equal one was tracked recently. Returns `true` if an event
    /// was sent.
    pub fn track(&self, assignment: &Assignment) -> bool {
        if !self.assignment_filter.should_track(assignment) {
            return false;
        }
        self.sink.track(assignment_event(assignment));
        true
    }

    /// Track `exposure`, one event per flag, unless an equal exposure was tracked recently.
    /// Returns the number of events sent.
    pub fn track_exposure(&self, exposure: &Exposure) -> usize {
        if !self.exposure_filter.should_track(exposure) {
            return 0;
        }
        let events = exposure_events(exposure);
        let count = events.len();
        for event in events {
            self.sink.track(event);
        }
        count
    }
}

fn insert_id(user: &User, hashed: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{} {} {} {}",
        user.user_id.as_deref().unwrap_or_default(),
        user.device_id.as_deref().unwrap_or_default(),
        stable_hash(hashed),
        timestamp.timestamp_millis() / DAY_MILLIS
    )
}

/// Build the analytics event for `assignment`.
pub fn assignment_event(assignment: &Assignment) -> AnalyticsEvent {
    let mut flag_keys: Vec<&String> = assignment.results.keys().collect();
    flag_keys.sort();

    let mut event_properties = Map::new();
    for flag_key in flag_keys {
        if let Some(key) = &assignment.results[flag_key].key {
            event_properties.insert(format!("{flag_key}.variant"), Value::from(key.as_str()));
        }
    }

    AnalyticsEvent {
        event_type: ASSIGNMENT_EVENT_TYPE.to_owned(),
        user_id: assignment.user.user_id.clone(),
        device_id: assignment.user.device_id.clone(),
        event_properties,
        insert_id: insert_id(
            &assignment.user,
            &assignment.canonicalize(),
            assignment.timestamp,
        ),
        time: assignment.timestamp,
    }
}

/// Build one analytics event per flag of `exposure`.
pub fn exposure_events(exposure: &Exposure) -> Vec<AnalyticsEvent> {
    let mut flag_keys: Vec<&String> = exposure.results.keys().collect();
    flag_keys.sort();

    flag_keys
        .into_iter()
        .map(|flag_key| {
            let variant = &exposure.results[flag_key];
            let mut event_properties = Map::new();
            event_properties.insert("flag_key".to_owned(), Value::from(flag_key.as_str()));
            if let Some(key) = &variant.key {
                event_properties.insert("variant".to_owned(), Value::from(key.as_str()));
            }

            let hashed = format!(
                "{flag_key} {}",
                variant.key.as_deref().unwrap_or_default()
            );
            AnalyticsEvent {
                event_type: EXPOSURE_EVENT_TYPE.to_owned(),
                user_id: exposure.user.user_id.clone(),
                device_id: exposure.user.device_id.clone(),
                event_properties,
                insert_id: insert_id(&exposure.user, &hashed, exposure.timestamp),
                time: exposure.timestamp,
            }
        })
        .collect()
}
