//! Synthesis of activity-aware call stacks
//!
//! The synthesized stack of an activity's execution is made of the raw stack
//! frames that the activity executed, up to the point where the thread pool
//! machinery started running it, followed by a "STARTING TASK" marker frame,
//! followed by the synthesized stack of its creator at the time where the
//! activity was created. The recursion ends at thread default activities,
//! whose synthesized stack is just the raw stack on top of process and thread
//! frames.

use crate::{
    activity::ActivityIndex,
    cache::CacheKey,
    classify::{ClassifyError, MethodRoleTable, MethodRoles},
    config::UnbrokenStackRules,
    trace::{EventPayload, RawStackIndex, ThreadInfo, TraceEvent, TraceLog},
    ActivityComputer,
};
use asylum::{CallStackIndex, CallStackInterner};
use log::debug;

/// Frames at the root of every synthesized stack
///
/// Called with the thread that the root activity of the stack runs on. The
/// default puts a "Thread (<tid>)" frame on top of a "Process <name> (<pid>)"
/// frame. If the result is not purely a function of the thread, the stack
/// cache must be disabled with `ActivityComputer::set_no_cache()`.
pub type TopFrames<'a> = &'a dyn Fn(&ThreadInfo, &mut CallStackInterner) -> CallStackIndex;

/// Name prefix of the marker frames that separate activities
const STARTING_TASK: &str = "STARTING TASK on Thread ";

/// Outcome of the search for a thread pool dispatch point in a raw stack
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Transition {
    /// Frames rootward of this one (included) belong to the thread pool
    Found(RawStackIndex),

    /// Fully walked stack that never went through the thread pool
    Unbroken,

    /// Nothing could be found
    NotFound,
}

/// Synthesized stack, and whether it may be cached
enum Synthesized {
    /// Pure function of the query
    Cacheable(CallStackIndex),

    /// Result of a query with side effects, which must be repeated
    Uncacheable(CallStackIndex),
}

impl<L: TraceLog> ActivityComputer<L> {
    /// Activity-aware call stack of an event
    ///
    /// The raw stack of the event is interpreted as part of the activity that
    /// currently runs on the event's thread. If `trim_raw_frames` is set, the
    /// frames through which the runtime logged the event are removed from the
    /// leaf of the raw stack. Returns None if the event's thread is unknown.
    pub fn call_stack(
        &mut self,
        event: &TraceEvent,
        top: Option<TopFrames>,
        trim_raw_frames: bool,
    ) -> Result<Option<CallStackIndex>, ClassifyError> {
        let Some(thread) = self.event_thread(event) else {
            return Ok(None);
        };
        let roles = self.take_roles()?;
        let activity = self.stacks.current(thread);
        let raw = if trim_raw_frames {
            trim_frames(&self.log, &roles, event.stack)
        } else {
            event.stack
        };
        let stack = self.synthesize(&roles, raw, activity, top, Some(event));
        self.restore_roles(roles);
        Ok(Some(stack))
    }

    /// Activity-aware call stack at the time where an activity was created
    pub fn call_stack_for_activity(
        &mut self,
        activity: ActivityIndex,
        top: Option<TopFrames>,
    ) -> Result<CallStackIndex, ClassifyError> {
        let roles = self.take_roles()?;
        let record = &self.registry[activity];
        let stack = match record.creator {
            Some(creator) => {
                let fragment = trim_frames(&self.log, &roles, record.creation_stack);
                self.synthesize(&roles, fragment, creator, top, None)
            }
            None => self.synthesize(&roles, None, activity, top, None),
        };
        self.restore_roles(roles);
        Ok(stack)
    }

    /// Call stack made of the chain of activities that led to an activity
    ///
    /// Raw call stacks are ignored, each frame is an activity name.
    pub fn activity_only_stack(&mut self, activity: ActivityIndex) -> CallStackIndex {
        let mut chain = std::iter::successors(Some(activity), |&a| self.registry[a].creator)
            .collect::<Vec<_>>();
        chain.reverse();
        let root = &self.registry[chain[0]];
        let info = &self.log.threads()[root.thread.index()];
        let mut stack = self.output.intern_named(
            &format!("Process {} ({})", info.process_name, info.process_id),
            None,
        );
        for activity in chain {
            let name = self.activity_name(activity);
            stack = self.output.intern_named(&name, Some(stack));
        }
        stack
    }

    /// Synthesize the stack of `raw` executing as part of `activity`
    ///
    /// `event` is only provided for the top-level query, and enables the
    /// detection of activities which ended without a stop event.
    fn synthesize(
        &mut self,
        roles: &MethodRoleTable,
        raw: Option<RawStackIndex>,
        activity: ActivityIndex,
        top: Option<TopFrames>,
        event: Option<&TraceEvent>,
    ) -> CallStackIndex {
        // Walk creator links until a cached stack or a root activity is found,
        // recording the raw stack that each activity on the way executed
        let mut levels = Vec::new();
        let mut key = CacheKey {
            activity,
            raw_stack: raw,
        };
        let mut stack = loop {
            if let Some(stack) = self.cached(key) {
                break stack;
            }
            let record = &self.registry[key.activity];
            match record.creator {
                None => {
                    let stack = self.top_level(key.raw_stack, key.activity, top);
                    self.remember(key, stack);
                    break stack;
                }
                Some(creator) => {
                    levels.push(key);
                    key = CacheKey {
                        activity: creator,
                        raw_stack: trim_frames(&self.log, roles, record.creation_stack),
                    };
                }
            }
        };

        // Splice each activity's frames on top of its creation stack, from the
        // root activity to the queried one
        while let Some(key) = levels.pop() {
            let event = if levels.is_empty() { event } else { None };
            match self.splice(roles, key.raw_stack, key.activity, stack, top, event) {
                Synthesized::Cacheable(spliced) => {
                    self.remember(key, spliced);
                    stack = spliced;
                }
                Synthesized::Uncacheable(spliced) => stack = spliced,
            }
        }
        stack
    }

    /// Look up a previously synthesized stack, unless caching is disabled
    fn cached(&self, key: CacheKey) -> Option<CallStackIndex> {
        if self.config.no_cache {
            None
        } else {
            self.cache.get(key)
        }
    }

    /// Record a synthesized stack, unless caching is disabled
    fn remember(&mut self, key: CacheKey, stack: CallStackIndex) {
        if !self.config.no_cache {
            self.cache.insert(key, stack);
        }
    }

    /// Synthesize the stack of an activity that has a creator, given the
    /// synthesized stack at the time where it was created
    fn splice(
        &mut self,
        roles: &MethodRoleTable,
        raw: Option<RawStackIndex>,
        activity: ActivityIndex,
        creation: CallStackIndex,
        top: Option<TopFrames>,
        event: Option<&TraceEvent>,
    ) -> Synthesized {
        let thread = self.registry[activity].thread;
        match find_transition(&self.log, roles, &self.config.unbroken_stack, raw, event) {
            Transition::Found(transition) => {
                let thread_id = self.log.threads()[thread.index()].thread_id;
                if let Some(stack) = self.recursion_guard(raw, transition, creation, thread_id) {
                    return Synthesized::Cacheable(stack);
                }
                let marker = self
                    .output
                    .intern_named(&format!("{STARTING_TASK}{thread_id}"), Some(creation));
                Synthesized::Cacheable(self.push_raw_frames(marker, raw, Some(transition)))
            }
            Transition::Unbroken => {
                debug!(
                    "Activity {} went back to the thread pool without stopping, \
                     resetting thread {}",
                    activity.index(),
                    thread.index()
                );
                self.stacks.reset(&mut self.registry, thread);
                let default = self.registry.default_activity(thread);
                Synthesized::Uncacheable(self.top_level(raw, default, top))
            }
            Transition::NotFound => Synthesized::Cacheable(self.top_level(raw, activity, top)),
        }
    }

    /// Stack of a raw stack on top of its thread's root frames
    fn top_level(
        &mut self,
        raw: Option<RawStackIndex>,
        activity: ActivityIndex,
        top: Option<TopFrames>,
    ) -> CallStackIndex {
        let info = &self.log.threads()[self.registry[activity].thread.index()];
        let base = match top {
            Some(top) => top(info, &mut self.output),
            None => default_top_frames(info, &mut self.output),
        };
        self.push_raw_frames(base, raw, None)
    }

    /// Detect an activity that recursively awaits itself
    ///
    /// If the frames that `raw` executed before the dispatch `transition` are
    /// exactly the leaf frames of the `creation` stack, followed by a marker
    /// frame, the activity is a recursive continuation of its creator and the
    /// creation stack is reused as-is. The marker frame is renamed to record
    /// the current thread.
    fn recursion_guard(
        &mut self,
        raw: Option<RawStackIndex>,
        transition: RawStackIndex,
        creation: CallStackIndex,
        thread_id: u32,
    ) -> Option<CallStackIndex> {
        let mut creation_frames = std::iter::successors(Some(creation), |&stack| {
            self.output.caller(stack)
        });
        for stack in raw_frames(&self.log, raw).take_while(|&stack| stack != transition) {
            let code = self.log.code_address(stack);
            let frame = self.code_frames.get(&code)?;
            if self.output.frame(creation_frames.next()?) != *frame {
                return None;
            }
        }
        let marker = self.output.frame(creation_frames.next()?);
        let marker_name = self.output.frame_name(marker);
        let thread_ids = marker_name.strip_prefix(STARTING_TASK)?;
        let thread_id = thread_id.to_string();
        if !thread_ids.split(", ").any(|id| id == thread_id) {
            let new_name = format!("{marker_name}, {thread_id}");
            self.output.rename_frame(marker, &new_name);
        }
        Some(creation)
    }

    /// Push the frames of a raw stack, from its root to the frame before
    /// `end` (or its leaf if None), on top of an output stack
    fn push_raw_frames(
        &mut self,
        mut base: CallStackIndex,
        raw: Option<RawStackIndex>,
        end: Option<RawStackIndex>,
    ) -> CallStackIndex {
        let frames = raw_frames(&self.log, raw)
            .take_while(|&stack| Some(stack) != end)
            .collect::<Vec<_>>();
        for stack in frames.into_iter().rev() {
            let code = self.log.code_address(stack);
            let frame = match self.code_frames.get(&code) {
                Some(&frame) => frame,
                None => {
                    let frame = self.output.intern_frame(&self.log.frame_name(code));
                    self.code_frames.insert(code, frame);
                    frame
                }
            };
            base = self.output.intern(frame, Some(base));
        }
        base
    }
}

/// Default root frames of synthesized stacks
fn default_top_frames(info: &ThreadInfo, output: &mut CallStackInterner) -> CallStackIndex {
    let process = output.intern_named(
        &format!("Process {} ({})", info.process_name, info.process_id),
        None,
    );
    output.intern_named(&format!("Thread ({})", info.thread_id), Some(process))
}

/// Iterate over the frames of a raw stack, from leaf to root
fn raw_frames<L: TraceLog>(
    log: &L,
    raw: Option<RawStackIndex>,
) -> impl Iterator<Item = RawStackIndex> + '_ {
    std::iter::successors(raw, move |&stack| log.caller(stack))
}

/// Roles of the method of a raw stack's leaf frame
fn frame_roles<L: TraceLog>(log: &L, roles: &MethodRoleTable, stack: RawStackIndex) -> MethodRoles {
    log.method(log.code_address(stack))
        .map(|method| roles.get(method))
        .unwrap_or_default()
}

/// Remove the frames through which the runtime logged a scheduling event
///
/// Looks for the scheduling or wait end point in the raw stack, and returns
/// the stack of its first caller which is not a scheduling helper. If there
/// is no such point, which happens when symbols are missing, the raw stack is
/// returned unmodified.
fn trim_frames<L: TraceLog>(
    log: &L,
    roles: &MethodRoleTable,
    raw: Option<RawStackIndex>,
) -> Option<RawStackIndex> {
    let mut frames = raw_frames(log, raw);
    let logging_point = MethodRoles::TASK_SCHEDULE | MethodRoles::TASK_WAIT_END;
    if !frames
        .by_ref()
        .any(|stack| frame_roles(log, roles, stack).intersects(logging_point))
    {
        return raw;
    }
    frames.find(|&stack| {
        !frame_roles(log, roles, stack).contains(MethodRoles::TASK_SCHEDULE_HELPER)
    })
}

/// Find where the thread pool started running the current activity
fn find_transition<L: TraceLog>(
    log: &L,
    roles: &MethodRoleTable,
    rules: &UnbrokenStackRules,
    raw: Option<RawStackIndex>,
    event: Option<&TraceEvent>,
) -> Transition {
    let mut helpers_start = None;
    for stack in raw_frames(log, raw) {
        let frame_roles = frame_roles(log, roles, stack);
        if frame_roles.contains(MethodRoles::TASK_RUN) {
            return Transition::Found(helpers_start.unwrap_or(stack));
        } else if frame_roles.contains(MethodRoles::TASK_RUN_HELPER) {
            helpers_start.get_or_insert(stack);
        } else {
            helpers_start = None;
        }
    }
    match event {
        Some(TraceEvent {
            payload: EventPayload::ContextSwitch,
            ..
        }) if is_unbroken(log, rules, raw) => Transition::Unbroken,
        _ => Transition::NotFound,
    }
}

/// Truth that a raw stack was walked all the way to the OS thread root
/// through the runtime, without crossing any JIT-compiled code
fn is_unbroken<L: TraceLog>(
    log: &L,
    rules: &UnbrokenStackRules,
    raw: Option<RawStackIndex>,
) -> bool {
    let module_name = |stack| {
        log.code_module(log.code_address(stack))
            .map(|module| log.module_name(module))
            .unwrap_or("")
    };
    let Some(root) = raw_frames(log, raw).last() else {
        return false;
    };
    if !UnbrokenStackRules::matches(&rules.root_modules, module_name(root)) {
        return false;
    }
    let mut saw_runtime = false;
    for stack in raw_frames(log, raw) {
        let module = module_name(stack);
        if UnbrokenStackRules::matches(&rules.jit_modules, module) {
            return false;
        }
        saw_runtime |= UnbrokenStackRules::matches(&rules.runtime_modules, module);
    }
    saw_runtime
}
