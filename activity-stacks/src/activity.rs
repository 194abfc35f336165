//! Units of possibly-asynchronous work

use crate::{
    identity::RawActivityId,
    trace::{EventIndex, RawStackIndex, ThreadIndex, ThreadInfo, Timestamp},
};

index_type! {
    /// Dense identifier of an activity, never reused
    ///
    /// The first activities are the thread default activities, in thread
    /// order, so the default activity of thread N has index N.
    ActivityIndex
}

/// What kind of work an activity represents
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, strum::IntoStaticStr)]
pub enum ActivityKind {
    /// Default activity of a thread: nothing special is happening
    Initial,

    /// Task queued to a task scheduler
    TaskScheduled,

    /// Continuation of an await, queued as a task
    AwaitTaskScheduled,

    /// Code that runs after an asynchronous wait for a task ends
    TaskWait,

    /// Synchronous wait for a task, which completes as soon as it starts
    TaskWaitSynchronous,

    /// Managed timer callback
    FxTimer,

    /// Managed asynchronous I/O completion
    FxAsyncIo,

    /// WinRT dispatcher operation
    FxWinRtDispatch,

    /// Framework thread transfer of an unknown nature
    FxTransfer,

    /// I/O thread pool completion
    IoThreadPool,
}
//
impl ActivityKind {
    /// Truth that activities of this kind have no stop event of their own
    ///
    /// Such activities end when something else takes over their thread, so
    /// unwinding them without a stop is not a protocol violation.
    pub fn requires_implicit_completion(self) -> bool {
        matches!(
            self,
            Self::TaskWait
                | Self::TaskWaitSynchronous
                | Self::FxTimer
                | Self::FxAsyncIo
                | Self::FxWinRtDispatch
                | Self::FxTransfer
                | Self::IoThreadPool
        )
    }

    /// Truth that activities of this kind may start several times
    ///
    /// Their raw identity stays registered after they stop.
    pub fn is_multi_trigger(self) -> bool {
        matches!(self, Self::FxTimer)
    }

    /// Truth that a second creation with the same raw identity is routine
    pub fn tolerates_duplicate_create(self) -> bool {
        matches!(self, Self::IoThreadPool)
    }

    /// Truth that an already running activity of this kind may start again
    pub fn allows_restart(self) -> bool {
        self == Self::IoThreadPool || self.is_multi_trigger()
    }

    /// Name of this kind of activity
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Unit of possibly-asynchronous work
#[derive(Clone, Debug, PartialEq)]
pub struct Activity {
    /// Dense identifier
    pub(crate) index: ActivityIndex,

    /// What kind of work this is
    pub(crate) kind: ActivityKind,

    /// Activity whose execution caused this one to be created
    ///
    /// Only thread default activities have no creator.
    pub(crate) creator: Option<ActivityIndex>,

    /// Identity this activity was registered under, if any
    pub(crate) raw_id: Option<RawActivityId>,

    /// Event that created this activity
    pub(crate) creation_event: Option<EventIndex>,

    /// Raw call stack at creation time
    pub(crate) creation_stack: Option<RawStackIndex>,

    /// When this activity was created
    pub(crate) creation_time: Timestamp,

    /// When this activity (last) started
    pub(crate) start_time: Option<Timestamp>,

    /// When this activity ended
    pub(crate) end_time: Option<Timestamp>,

    /// Thread which executes (or created) this activity
    pub(crate) thread: ThreadIndex,

    /// Activity that was running on `thread` before this one started
    ///
    /// This links the per-thread execution stack. It is set while this
    /// activity is on that stack and cleared when it leaves it.
    pub(crate) prev_on_thread: Option<ActivityIndex>,
}
//
impl Activity {
    /// Default activity of a thread, backdated to the thread's lifetime
    pub(crate) fn thread_default(thread: ThreadIndex, info: &ThreadInfo) -> Self {
        Self {
            index: ActivityIndex::new(thread.index()),
            kind: ActivityKind::Initial,
            creator: None,
            raw_id: None,
            creation_event: None,
            creation_stack: None,
            creation_time: info.start,
            start_time: Some(info.start),
            end_time: Some(info.end),
            thread,
            prev_on_thread: None,
        }
    }

    /// Dense identifier
    pub fn index(&self) -> ActivityIndex {
        self.index
    }

    /// What kind of work this is
    pub fn kind(&self) -> ActivityKind {
        self.kind
    }

    /// Activity whose execution caused this one to be created
    pub fn creator(&self) -> Option<ActivityIndex> {
        self.creator
    }

    /// Identity this activity was registered under
    pub fn raw_id(&self) -> Option<RawActivityId> {
        self.raw_id
    }

    /// Event that created this activity
    pub fn creation_event(&self) -> Option<EventIndex> {
        self.creation_event
    }

    /// Raw call stack at creation time
    pub fn creation_stack(&self) -> Option<RawStackIndex> {
        self.creation_stack
    }

    /// When this activity was created
    pub fn creation_time(&self) -> Timestamp {
        self.creation_time
    }

    /// When this activity started, if it did
    pub fn start_time(&self) -> Option<Timestamp> {
        self.start_time
    }

    /// When this activity ended, if it did
    pub fn end_time(&self) -> Option<Timestamp> {
        self.end_time
    }

    /// Thread which executes this activity (or created it, if not started)
    pub fn thread(&self) -> ThreadIndex {
        self.thread
    }

    /// Activity that was running on the same thread before this one started
    pub fn prev_on_thread(&self) -> Option<ActivityIndex> {
        self.prev_on_thread
    }

    /// Truth that this is a thread default activity
    pub fn is_thread_default(&self) -> bool {
        self.creator.is_none()
    }

    /// Human-readable name
    pub fn name(&self, thread: &ThreadInfo) -> String {
        if self.is_thread_default() {
            format!("Thread ({})", thread.thread_id)
        } else {
            format!("{} (Activity {})", self.kind.name(), self.index.index())
        }
    }
}
