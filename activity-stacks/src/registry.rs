//! Authoritative table of every activity ever created

use crate::{
    activity::{Activity, ActivityIndex, ActivityKind},
    identity::RawActivityId,
    trace::{ThreadIndex, ThreadInfo, TraceEvent},
};
use log::{debug, warn};
use std::{collections::HashMap, ops::Index};

/// Table of all activities, plus a lookup of the pending ones
#[derive(Clone, Debug, PartialEq)]
pub struct ActivityRegistry {
    /// Every activity ever created, indexed by ActivityIndex
    ///
    /// Starts with one default activity per thread.
    activities: Vec<Activity>,

    /// Number of threads, which is also the number of default activities
    num_threads: usize,

    /// Activities that can still be started or stopped by raw identity
    live: HashMap<RawActivityId, ActivityIndex>,
}
//
impl ActivityRegistry {
    /// Set up a registry with the default activity of each thread
    pub fn new(threads: &[ThreadInfo]) -> Self {
        let activities = threads
            .iter()
            .enumerate()
            .map(|(idx, info)| Activity::thread_default(ThreadIndex::new(idx), info))
            .collect::<Vec<_>>();
        Self {
            num_threads: activities.len(),
            activities,
            live: HashMap::new(),
        }
    }

    /// Number of activities created so far, including thread defaults
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// Truth that there are no activities at all (the trace has no thread)
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Access an activity
    pub fn get(&self, activity: ActivityIndex) -> &Activity {
        &self.activities[activity.index()]
    }

    /// Mutable access to an activity
    pub(crate) fn get_mut(&mut self, activity: ActivityIndex) -> &mut Activity {
        &mut self.activities[activity.index()]
    }

    /// Iterate over all activities in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Activity> + '_ {
        self.activities.iter()
    }

    /// Default activity of a thread
    ///
    /// Always the same activity for a given thread.
    pub fn default_activity(&self, thread: ThreadIndex) -> ActivityIndex {
        assert!(thread.index() < self.num_threads, "invalid {thread:?}");
        ActivityIndex::new(thread.index())
    }

    /// Truth that an activity is some thread's default activity
    pub fn is_default(&self, activity: ActivityIndex) -> bool {
        activity.index() < self.num_threads
    }

    /// Pending activity registered under some raw identity
    pub fn lookup(&self, raw_id: RawActivityId) -> Option<ActivityIndex> {
        self.live.get(&raw_id).copied()
    }

    /// Record a new activity and register it under its raw identity
    ///
    /// If a live activity is already registered under `raw_id`, the new one
    /// replaces it, unless both share the same multi-trigger kind, in which
    /// case nothing is created.
    pub(crate) fn create(
        &mut self,
        event: &TraceEvent,
        thread: ThreadIndex,
        creator: ActivityIndex,
        raw_id: RawActivityId,
        kind: ActivityKind,
    ) -> Option<ActivityIndex> {
        if let Some(existing) = self.lookup(raw_id) {
            let existing_kind = self.get(existing).kind;
            if existing_kind.is_multi_trigger() && existing_kind == kind {
                return None;
            }
            if kind.tolerates_duplicate_create() {
                debug!(
                    "Replacing pending activity {} for {raw_id} (event {})",
                    existing.index(),
                    event.index.index()
                );
            } else {
                warn!(
                    "Duplicate creation of {raw_id} at event {} while activity {} is pending",
                    event.index.index(),
                    existing.index()
                );
            }
        }
        let index = ActivityIndex::new(self.activities.len());
        self.activities.push(Activity {
            index,
            kind,
            creator: Some(creator),
            raw_id: Some(raw_id),
            creation_event: Some(event.index),
            creation_stack: event.stack,
            creation_time: event.timestamp,
            start_time: None,
            end_time: None,
            thread,
            prev_on_thread: None,
        });
        self.live.insert(raw_id, index);
        Some(index)
    }

    /// Stop tracking an activity by raw identity
    ///
    /// Does nothing if the identity was since taken over by another activity.
    pub(crate) fn forget(&mut self, raw_id: RawActivityId, activity: ActivityIndex) {
        if self.live.get(&raw_id) == Some(&activity) {
            self.live.remove(&raw_id);
        }
    }

    /// Number of activities that can still be looked up by raw identity
    pub fn num_live(&self) -> usize {
        self.live.len()
    }
}
//
impl Index<ActivityIndex> for ActivityRegistry {
    type Output = Activity;

    fn index(&self, activity: ActivityIndex) -> &Activity {
        self.get(activity)
    }
}
