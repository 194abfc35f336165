//! Activity-aware call stack reconstruction from execution traces
//!
//! Raw call stacks collected by a sampling profiler stop at thread pool
//! boundaries: once some work is queued and picked up by a worker thread, the
//! worker's stack says nothing about who queued it. This crate follows the
//! lifecycle of every unit of asynchronous work (an "activity") through the
//! trace events that create, start and stop it, and uses that to splice the
//! stack that queued some work onto the stack that runs it.
//!
//! The entry point is `ActivityComputer`, which is fed trace events in
//! timestamp order through `process_event()` and can be queried for
//! synthesized call stacks at any point.

#![deny(missing_docs)]

/// Generate a dense u32-based index type
macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy,
            Clone,
            Debug,
            Default,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u32);
        //
        impl $name {
            /// Build from a position in some table
            pub fn new(index: usize) -> Self {
                Self(u32::try_from(index).expect(concat!(stringify!($name), " overflow")))
            }

            /// Position in the matching table
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

pub mod activity;
pub mod cache;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod identity;
pub mod lifecycle;
pub mod memory;
pub mod registry;
pub mod synthesize;
pub mod thread_stack;
pub mod trace;

use self::{
    cache::StackCache,
    classify::MethodRoleTable,
    registry::ActivityRegistry,
    thread_stack::ThreadStacks,
    trace::CodeAddressIndex,
};
use asylum::{CallStackInterner, FrameIndex};
use std::collections::HashMap;

// Reexport types which appear in the public interface
pub use self::{
    activity::{Activity, ActivityIndex, ActivityKind},
    classify::ClassifyError,
    config::{ComputerConfig, ConfigLoadError, UnbrokenStackRules},
    identity::{IdKind, RawActivityId},
    lifecycle::ActivityObserver,
    memory::{MemoryTrace, TraceLoadError, TraceParseError},
    synthesize::TopFrames,
    trace::{EventPayload, ThreadIndex, ThreadInfo, TraceEvent, TraceLog},
};
pub use asylum::{self, CallStackIndex};

/// Activity correlation engine
///
/// Owns the trace log, every activity ever created, the execution stack of
/// every thread and the synthesized call stacks. Must be fed the trace's
/// events in timestamp order.
pub struct ActivityComputer<L: TraceLog> {
    /// Trace that activities are reconstructed from
    log: L,

    /// Tunables
    config: ComputerConfig,

    /// Every activity ever created
    registry: ActivityRegistry,

    /// Activities running on each thread
    stacks: ThreadStacks,

    /// Roles of well-known methods, computed on first need
    roles: Option<MethodRoleTable>,

    /// Recently synthesized stacks
    cache: StackCache,

    /// Synthesized call stacks
    output: CallStackInterner,

    /// Output frame associated with each raw code address seen so far
    code_frames: HashMap<CodeAddressIndex, FrameIndex>,
}
//
impl<L: TraceLog> ActivityComputer<L> {
    /// Set up the engine for some trace, with default settings
    pub fn new(log: L) -> Self {
        Self::with_config(log, ComputerConfig::default())
    }

    /// Set up the engine for some trace
    pub fn with_config(log: L, config: ComputerConfig) -> Self {
        let registry = ActivityRegistry::new(log.threads());
        let stacks = ThreadStacks::new(&registry, log.threads().len());
        let cache = StackCache::new(config.clamped_cache_size_log2());
        Self {
            log,
            config,
            registry,
            stacks,
            roles: None,
            cache,
            output: CallStackInterner::new(),
            code_frames: HashMap::new(),
        }
    }

    /// Trace that activities are reconstructed from
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Current tunables
    pub fn config(&self) -> &ComputerConfig {
        &self.config
    }

    /// Every activity created so far
    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Per-thread activity stacks
    pub fn stacks(&self) -> &ThreadStacks {
        &self.stacks
    }

    /// Synthesized call stacks
    pub fn output(&self) -> &CallStackInterner {
        &self.output
    }

    /// Mutable access to synthesized call stacks, e.g. to add custom frames
    pub fn output_mut(&mut self) -> &mut CallStackInterner {
        &mut self.output
    }

    /// Extract the synthesized call stacks once done
    pub fn into_output(self) -> CallStackInterner {
        self.output
    }

    /// Enable or disable the synthesized stack cache
    ///
    /// Must be disabled while using `TopFrames` that are not purely a
    /// function of the thread.
    pub fn set_no_cache(&mut self, no_cache: bool) {
        if no_cache && !self.config.no_cache {
            self.cache.clear();
        }
        self.config.no_cache = no_cache;
    }

    /// Access an activity
    pub fn activity(&self, activity: ActivityIndex) -> &Activity {
        &self.registry[activity]
    }

    /// Activity currently running on a thread
    pub fn current_activity(&self, thread: ThreadIndex) -> ActivityIndex {
        self.stacks.current(thread)
    }

    /// Default activity of a thread
    pub fn default_activity(&self, thread: ThreadIndex) -> ActivityIndex {
        self.registry.default_activity(thread)
    }

    /// Pending activity registered under some raw identity
    pub fn lookup(&self, raw_id: RawActivityId) -> Option<ActivityIndex> {
        self.registry.lookup(raw_id)
    }

    /// Human-readable name of an activity
    pub fn activity_name(&self, activity: ActivityIndex) -> String {
        let activity = &self.registry[activity];
        activity.name(&self.log.threads()[activity.thread().index()])
    }

    /// Classify the well-known methods of the runtime, if not done already
    ///
    /// This is done automatically on the first stack synthesis, but can be
    /// called beforehand to report errors early.
    pub fn classify(&mut self) -> Result<&MethodRoleTable, ClassifyError> {
        let roles = self.take_roles()?;
        Ok(self.roles.insert(roles))
    }

    /// Move the well-known method roles out, classifying methods if needed
    ///
    /// Lets stack synthesis borrow the roles while mutating the rest of the
    /// engine. Must be followed by a `restore_roles()`.
    fn take_roles(&mut self) -> Result<MethodRoleTable, ClassifyError> {
        match self.roles.take() {
            Some(roles) => Ok(roles),
            None => MethodRoleTable::build(&mut self.log, &self.config.core_library_patterns),
        }
    }

    /// Put back the roles extracted by `take_roles()`
    fn restore_roles(&mut self, roles: MethodRoleTable) {
        self.roles = Some(roles);
    }

    /// Thread that emitted an event, if it is known
    pub fn event_thread(&self, event: &TraceEvent) -> Option<ThreadIndex> {
        event
            .thread
            .filter(|thread| thread.index() < self.log.threads().len())
    }
}
