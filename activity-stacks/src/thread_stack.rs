//! Per-thread stacks of running activities
//!
//! Each thread has a current activity. Starting an activity pushes it on top
//! of its thread's current activity, stopping it pops it. The stack itself is
//! threaded through `Activity::prev_on_thread`, with the thread's default
//! activity at the bottom.

use crate::{
    activity::ActivityIndex,
    registry::ActivityRegistry,
    trace::ThreadIndex,
};
use std::collections::HashMap;

/// Execution stacks of all threads, plus await bookkeeping
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadStacks {
    /// Activity currently running on each thread, indexed by ThreadIndex
    current: Vec<ActivityIndex>,

    /// Waits that each activity started, in order, until one of them ends
    ///
    /// Only the first one is truly blocking its creator.
    pending_waits: HashMap<ActivityIndex, Vec<ActivityIndex>>,
}
//
impl ThreadStacks {
    /// Set up stacks where every thread runs its default activity
    pub fn new(registry: &ActivityRegistry, num_threads: usize) -> Self {
        Self {
            current: (0..num_threads)
                .map(|idx| registry.default_activity(ThreadIndex::new(idx)))
                .collect(),
            pending_waits: HashMap::new(),
        }
    }

    /// Activity currently running on a thread
    pub fn current(&self, thread: ThreadIndex) -> ActivityIndex {
        self.current[thread.index()]
    }

    /// Iterate over the activities of a thread's stack, from top to bottom
    ///
    /// The thread's default activity is always the last item.
    pub fn iter<'a>(
        &'a self,
        registry: &'a ActivityRegistry,
        thread: ThreadIndex,
    ) -> impl Iterator<Item = ActivityIndex> + 'a {
        std::iter::successors(Some(self.current(thread)), move |&activity| {
            registry[activity].prev_on_thread
        })
    }

    /// Truth that an activity is on a thread's stack above the default
    pub fn contains(
        &self,
        registry: &ActivityRegistry,
        thread: ThreadIndex,
        activity: ActivityIndex,
    ) -> bool {
        !registry.is_default(activity) && self.iter(registry, thread).any(|a| a == activity)
    }

    /// Push an activity on top of a thread's stack
    pub(crate) fn push(
        &mut self,
        registry: &mut ActivityRegistry,
        thread: ThreadIndex,
        activity: ActivityIndex,
    ) {
        debug_assert!(registry[activity].prev_on_thread.is_none());
        let previous = self.current(thread);
        let record = registry.get_mut(activity);
        record.prev_on_thread = Some(previous);
        record.thread = thread;
        self.current[thread.index()] = activity;
    }

    /// Pop the top activity of a thread's stack, unless it's the default
    pub(crate) fn pop(
        &mut self,
        registry: &mut ActivityRegistry,
        thread: ThreadIndex,
    ) -> Option<ActivityIndex> {
        let top = self.current(thread);
        let previous = registry.get_mut(top).prev_on_thread.take()?;
        self.current[thread.index()] = previous;
        Some(top)
    }

    /// Unwind a thread's stack back to its default activity
    pub(crate) fn reset(&mut self, registry: &mut ActivityRegistry, thread: ThreadIndex) {
        while self.pop(registry, thread).is_some() {}
    }

    /// Take an activity off its thread's stack, wherever it is
    ///
    /// Used when an activity legitimately starts again before it stopped.
    pub(crate) fn detach(&mut self, registry: &mut ActivityRegistry, activity: ActivityIndex) {
        let thread = registry[activity].thread;
        let Some(previous) = registry[activity].prev_on_thread else {
            return;
        };
        if self.current(thread) == activity {
            self.current[thread.index()] = previous;
        } else {
            let above = self
                .iter(registry, thread)
                .find(|&a| registry[a].prev_on_thread == Some(activity));
            if let Some(above) = above {
                registry.get_mut(above).prev_on_thread = Some(previous);
            }
        }
        registry.get_mut(activity).prev_on_thread = None;
    }

    /// Record that `creator` started waiting on `wait`
    pub(crate) fn record_wait(&mut self, creator: ActivityIndex, wait: ActivityIndex) {
        self.pending_waits.entry(creator).or_default().push(wait);
    }

    /// Waits recorded for some creator since its last unblocking
    pub fn pending_waits(&self, creator: ActivityIndex) -> &[ActivityIndex] {
        self.pending_waits
            .get(&creator)
            .map(|waits| &waits[..])
            .unwrap_or(&[])
    }

    /// Forget about the waits of some creator
    pub(crate) fn clear_waits(&mut self, creator: ActivityIndex) {
        self.pending_waits.remove(&creator);
    }
}
