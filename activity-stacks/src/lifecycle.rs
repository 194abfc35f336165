//! Activity creation, start and stop, as driven by trace events
//!
//! Trace event streams are lossy and occasionally reordered, so nothing in
//! here is fatal. Inconsistencies are logged and the state is repaired on a
//! best-effort basis.

use crate::{
    activity::{ActivityIndex, ActivityKind},
    dispatch::{self, Command, OnDuplicate},
    identity::{IdKind, RawActivityId},
    trace::{ThreadIndex, TraceEvent, TraceLog},
    ActivityComputer,
};
use log::{debug, trace, warn};

/// Receiver of activity lifecycle notifications
///
/// Every method gets access to the engine, so that it can query activity
/// state or synthesize call stacks from within the notification.
#[allow(unused_variables)]
pub trait ActivityObserver<L: TraceLog> {
    /// An activity was created
    fn on_create(
        &mut self,
        computer: &mut ActivityComputer<L>,
        activity: ActivityIndex,
        event: &TraceEvent,
    ) {
    }

    /// An activity started running
    fn on_start(
        &mut self,
        computer: &mut ActivityComputer<L>,
        activity: ActivityIndex,
        event: &TraceEvent,
    ) {
    }

    /// An activity is about to stop
    ///
    /// The activity has not been popped from its thread yet and has no end
    /// timestamp.
    fn on_stop(
        &mut self,
        computer: &mut ActivityComputer<L>,
        activity: ActivityIndex,
        event: &TraceEvent,
    ) {
    }

    /// The wait that its creator was blocked on ended
    fn on_await_unblocks(
        &mut self,
        computer: &mut ActivityComputer<L>,
        activity: ActivityIndex,
        event: &TraceEvent,
    ) {
    }
}
//
impl<L: TraceLog> ActivityObserver<L> for () {}

impl<L: TraceLog> ActivityComputer<L> {
    /// Update activity state according to the next trace event
    ///
    /// Events must be fed in timestamp order. Events which have nothing to do
    /// with activity lifecycles are ignored.
    pub fn process_event(&mut self, event: &TraceEvent, observer: &mut impl ActivityObserver<L>) {
        let Some(command) = dispatch::translate(event) else {
            return;
        };
        let Some(thread) = self.event_thread(event) else {
            debug!(
                "Dropping {command:?} from event {} which has no known thread",
                event.index.index()
            );
            return;
        };
        match command {
            Command::Create {
                raw_id,
                kind,
                on_duplicate,
                records_wait,
            } => {
                self.create(
                    event,
                    thread,
                    raw_id,
                    kind,
                    on_duplicate,
                    records_wait,
                    observer,
                );
            }
            Command::Start { raw_id, await_end } => {
                self.start(event, thread, raw_id, await_end, observer)
            }
            Command::Stop { raw_id } => {
                let activity = self.registry.lookup(raw_id);
                if activity.is_none() {
                    debug!(
                        "Stop of {raw_id} at event {} matches no pending activity",
                        event.index.index()
                    );
                }
                self.stop(event, activity, Some(thread), observer)
            }
        }
    }

    /// Create an activity on behalf of the one running on `thread`
    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        event: &TraceEvent,
        thread: ThreadIndex,
        raw_id: RawActivityId,
        kind: ActivityKind,
        on_duplicate: OnDuplicate,
        records_wait: bool,
        observer: &mut impl ActivityObserver<L>,
    ) -> Option<ActivityIndex> {
        if on_duplicate == OnDuplicate::Ignore {
            if let Some(pending) = self.registry.lookup(raw_id) {
                warn!(
                    "Ignoring duplicate creation of {raw_id} at event {}, activity {} is still pending",
                    event.index.index(),
                    pending.index()
                );
                return None;
            }
        }
        let creator = self.stacks.current(thread);
        let activity = self.registry.create(event, thread, creator, raw_id, kind)?;
        trace!(
            "Activity {} ({}) created by activity {} for {raw_id}",
            activity.index(),
            kind.name(),
            creator.index()
        );
        if records_wait {
            self.stacks.record_wait(creator, activity);
        }
        observer.on_create(self, activity, event);
        Some(activity)
    }

    /// Start the activity registered under `raw_id` on `thread`
    ///
    /// `await_end` indicates that this start marks the end of a wait, which
    /// implicitly completes the activity currently running on `thread`.
    fn start(
        &mut self,
        event: &TraceEvent,
        thread: ThreadIndex,
        raw_id: RawActivityId,
        await_end: bool,
        observer: &mut impl ActivityObserver<L>,
    ) {
        // The end of a wait terminates activities without a stop of their own
        if await_end {
            let current = self.stacks.current(thread);
            if self.registry[current].kind.requires_implicit_completion() {
                self.stop(event, Some(current), Some(thread), observer);
            }
        }

        // Find the activity being started
        let Some(activity) = self.registry.lookup(raw_id) else {
            if raw_id.kind() == IdKind::Timer {
                debug!(
                    "Timer {raw_id} fired at event {} without a recorded creation",
                    event.index.index()
                );
            } else {
                warn!(
                    "Start of {raw_id} at event {} matches no pending activity",
                    event.index.index()
                );
            }
            return;
        };
        let kind = self.registry[activity].kind;

        // Handle activities which are already running
        if self.registry[activity].prev_on_thread.is_some() {
            if kind.allows_restart() {
                debug!(
                    "Restarting activity {} ({}) at event {}",
                    activity.index(),
                    kind.name(),
                    event.index.index()
                );
                self.stacks.detach(&mut self.registry, activity);
            } else {
                warn!(
                    "Double start of activity {} ({}) at event {}",
                    activity.index(),
                    kind.name(),
                    event.index.index()
                );
                return;
            }
        }

        // Push the activity on top of the thread's stack
        self.stacks.push(&mut self.registry, thread, activity);
        let record = self.registry.get_mut(activity);
        record.start_time = Some(event.timestamp);
        record.end_time = None;
        trace!(
            "Activity {} started on thread {} at event {}",
            activity.index(),
            thread.index(),
            event.index.index()
        );

        // Check if this unblocks the first wait of the creator
        if await_end {
            if let Some(creator) = self.registry[activity].creator {
                let position = self
                    .stacks
                    .pending_waits(creator)
                    .iter()
                    .position(|&wait| wait == activity);
                match position {
                    Some(0) => {
                        observer.on_await_unblocks(self, activity, event);
                        self.stacks.clear_waits(creator);
                    }
                    Some(position) => warn!(
                        "Wait {} of activity {} ended at event {} before the {position} waits that precede it",
                        activity.index(),
                        creator.index(),
                        event.index.index()
                    ),
                    None => {}
                }
            }
        }
        observer.on_start(self, activity, event);

        // Synchronous waits are over as soon as they start
        if kind == ActivityKind::TaskWaitSynchronous {
            self.stop(event, Some(activity), Some(thread), observer);
        }
    }

    /// Stop an activity
    ///
    /// Activities that were started on top of it and did not stop yet are
    /// stopped first. `thread` defaults to the event's thread, then to the
    /// activity's thread.
    fn stop(
        &mut self,
        event: &TraceEvent,
        activity: Option<ActivityIndex>,
        thread: Option<ThreadIndex>,
        observer: &mut impl ActivityObserver<L>,
    ) {
        let Some(activity) = activity else {
            debug!(
                "Ignoring stop of an unknown activity at event {}",
                event.index.index()
            );
            return;
        };
        let thread = thread
            .or_else(|| self.event_thread(event))
            .unwrap_or(self.registry[activity].thread);

        // An activity only ends once
        if self.registry[activity].end_time.is_some() {
            warn!(
                "Double stop of activity {} ({}) at event {}",
                activity.index(),
                self.registry[activity].kind.name(),
                event.index.index()
            );
            self.forget(activity);
            return;
        }
        observer.on_stop(self, activity, event);

        // Unwind the thread's stack down to the activity
        if self.stacks.contains(&self.registry, thread, activity) {
            loop {
                let top = self.stacks.current(thread);
                if top == activity {
                    self.stacks.pop(&mut self.registry, thread);
                    break;
                }
                if self.registry[top].end_time.is_some() {
                    self.stacks.pop(&mut self.registry, thread);
                    continue;
                }
                if !self.registry[top].kind.requires_implicit_completion() {
                    warn!(
                        "Start/stop mismatch at event {}: stopping activity {} requires stopping activity {} first",
                        event.index.index(),
                        activity.index(),
                        top.index()
                    );
                }
                self.stop(event, Some(top), Some(thread), observer);
            }
        } else {
            warn!(
                "Stopping unstarted activity {} ({}) at event {}, resetting thread {}",
                activity.index(),
                self.registry[activity].kind.name(),
                event.index.index(),
                thread.index()
            );
            self.stacks.reset(&mut self.registry, thread);
        }
        self.registry.get_mut(activity).end_time = Some(event.timestamp);
        trace!(
            "Activity {} stopped on thread {} at event {}",
            activity.index(),
            thread.index(),
            event.index.index()
        );
        self.forget(activity);
    }

    /// Stop tracking a stopped activity by raw identity, unless it may start again
    fn forget(&mut self, activity: ActivityIndex) {
        let record = &self.registry[activity];
        if let Some(raw_id) = record.raw_id {
            if !record.kind.is_multi_trigger() {
                self.registry.forget(raw_id, activity);
            }
        }
    }
}
