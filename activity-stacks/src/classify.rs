//! Recognition of well-known runtime methods in raw call stacks
//!
//! Stack synthesis needs to know where, in a raw call stack, the runtime
//! scheduled some work and where a thread pool started running it. Neither is
//! visible in the trace events, so we recognize them by method name.

use crate::trace::{MethodIndex, ModuleIndex, TraceLog};
use bitflags::bitflags;
use log::{debug, info, warn};
use thiserror::Error;

bitflags! {
    /// Roles that a method can play in task scheduling and execution
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct MethodRoles: u8 {
        /// Entry point through which a thread pool runs a task
        const TASK_RUN = 0x01;

        /// Helper called right below a TASK_RUN entry point
        const TASK_RUN_HELPER = 0x02;

        /// Point where a task is scheduled (and logged)
        const TASK_SCHEDULE = 0x04;

        /// Scheduling helper called above a TASK_SCHEDULE point
        const TASK_SCHEDULE_HELPER = 0x08;

        /// Point where a wait for a task ends
        const TASK_WAIT_END = 0x10;
    }
}

/// How a method name is matched against a well-known name
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum NamePattern {
    /// The method name starts with this
    Prefix(&'static str),

    /// The method name contains this
    Contains(&'static str),
}
//
impl NamePattern {
    /// Truth that a method name matches this pattern
    fn matches(self, name: &str) -> bool {
        match self {
            Self::Prefix(prefix) => name.starts_with(prefix),
            Self::Contains(needle) => name.contains(needle),
        }
    }
}

/// Well-known methods of the runtime core library, with their roles
const WELL_KNOWN_METHODS: &[(NamePattern, MethodRoles)] = {
    use self::NamePattern::{Contains, Prefix};
    &[
        // Thread pool entry points
        (
            Prefix("System.Threading.Tasks.Task.ExecuteEntry"),
            MethodRoles::TASK_RUN,
        ),
        (
            Prefix("System.Threading.Tasks.Task.ExecuteWithThreadLocal"),
            MethodRoles::TASK_RUN,
        ),
        (
            Prefix("System.Runtime.CompilerServices.AsyncMethodBuilderCore+MoveNextRunner.Run"),
            MethodRoles::TASK_RUN,
        ),
        (
            Prefix("System.Threading.Tasks.AwaitTaskContinuation.RunCallback"),
            MethodRoles::TASK_RUN,
        ),
        (
            Prefix("System.Threading.TimerQueueTimer.CallCallback"),
            MethodRoles::TASK_RUN,
        ),
        (
            Prefix("System.Threading._IOCompletionCallback.PerformIOCompletionCallback"),
            MethodRoles::TASK_RUN,
        ),
        //
        // Glue right below those entry points
        (
            Prefix("System.Threading.ExecutionContext.Run"),
            MethodRoles::TASK_RUN_HELPER,
        ),
        (
            Contains("System.Threading.Tasks.Task.InnerInvoke"),
            MethodRoles::TASK_RUN_HELPER,
        ),
        (
            Prefix("System.Threading.Tasks.Task.Execute"),
            MethodRoles::TASK_RUN_HELPER,
        ),
        (
            Prefix("System.Runtime.CompilerServices.AsyncMethodBuilderCore.InvokeMoveNext"),
            MethodRoles::TASK_RUN_HELPER,
        ),
        //
        // Scheduling points, which are also where scheduling gets logged
        (
            Contains("TplEtwProvider.TaskScheduled"),
            MethodRoles::TASK_SCHEDULE,
        ),
        (
            Contains("TplEventSource.TaskScheduled"),
            MethodRoles::TASK_SCHEDULE,
        ),
        (
            Contains("TplEtwProvider.AwaitTaskContinuationScheduled"),
            MethodRoles::TASK_SCHEDULE,
        ),
        (
            Contains("TplEventSource.AwaitTaskContinuationScheduled"),
            MethodRoles::TASK_SCHEDULE,
        ),
        (
            Contains("TplEtwProvider.TaskWaitBegin"),
            MethodRoles::TASK_SCHEDULE,
        ),
        (
            Contains("TplEventSource.TaskWaitBegin"),
            MethodRoles::TASK_SCHEDULE,
        ),
        (
            Contains("FrameworkEventSource.ThreadTransferSend"),
            MethodRoles::TASK_SCHEDULE,
        ),
        //
        // Scheduling machinery above those points
        (
            Prefix("System.Threading.Tasks.ThreadPoolTaskScheduler.QueueTask"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        (
            Prefix("System.Threading.Tasks.TaskScheduler.InternalQueueTask"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        (
            Prefix("System.Threading.Tasks.Task.ScheduleAndStart"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        (
            Prefix("System.Threading.Tasks.Task.InternalStartNew"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        (
            Prefix("System.Threading.Tasks.Task.Run"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        (
            Prefix("System.Threading.Tasks.TaskFactory.StartNew"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        (
            Prefix("System.Runtime.CompilerServices.AsyncTaskMethodBuilder"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        (
            Prefix("System.Runtime.CompilerServices.TaskAwaiter"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        (
            Prefix("System.Threading.Tasks.Task.SetContinuationForAwait"),
            MethodRoles::TASK_SCHEDULE_HELPER,
        ),
        //
        // End of waits
        (
            Contains("TplEtwProvider.TaskWaitEnd"),
            MethodRoles::TASK_WAIT_END,
        ),
        (
            Contains("TplEventSource.TaskWaitEnd"),
            MethodRoles::TASK_WAIT_END,
        ),
    ]
};

/// Roles of every method known to the symbol resolver
#[derive(Clone, Debug, PartialEq)]
pub struct MethodRoleTable {
    /// Roles, indexed by MethodIndex
    roles: Box<[MethodRoles]>,

    /// Number of methods with at least one role
    num_classified: usize,
}
//
impl MethodRoleTable {
    /// Scan the runtime core library and classify its well-known methods
    ///
    /// Symbols are resolved for every module whose name contains one of the
    /// `core_library_patterns` (case-insensitively). Fails if no well-known
    /// method was found at all, as stack synthesis would then silently
    /// produce garbage.
    pub fn build(
        log: &mut impl TraceLog,
        core_library_patterns: &[Box<str>],
    ) -> Result<Self, ClassifyError> {
        // Find and resolve the core library modules
        let patterns = core_library_patterns
            .iter()
            .map(|pattern| pattern.to_lowercase())
            .collect::<Vec<_>>();
        let mut core_modules = vec![false; log.num_modules()];
        for (idx, is_core) in core_modules.iter_mut().enumerate() {
            let module = ModuleIndex::new(idx);
            let name = log.module_name(module).to_lowercase();
            if !patterns.iter().any(|pattern| name.contains(pattern.as_str())) {
                continue;
            }
            if log.resolve_module_symbols(module) {
                debug!("Resolved symbols of core library module {name}");
                *is_core = true;
            } else {
                warn!("Failed to resolve symbols of core library module {name}");
            }
        }

        // Classify the methods of those modules
        let mut roles = vec![MethodRoles::empty(); log.num_methods()].into_boxed_slice();
        let mut scanned_methods = 0;
        let mut num_classified = 0;
        for (idx, method_roles) in roles.iter_mut().enumerate() {
            let method = MethodIndex::new(idx);
            if !core_modules[log.method_module(method).index()] {
                continue;
            }
            scanned_methods += 1;
            let name = log.method_name(method);
            *method_roles = WELL_KNOWN_METHODS
                .iter()
                .filter(|(pattern, _)| pattern.matches(name))
                .fold(MethodRoles::empty(), |acc, &(_, role)| acc | role);
            if !method_roles.is_empty() {
                num_classified += 1;
            }
        }
        if num_classified == 0 {
            return Err(ClassifyError::NoWellKnownMethods { scanned_methods });
        }
        info!(
            "Recognized {num_classified} well-known methods out of {scanned_methods} core library methods"
        );
        Ok(Self {
            roles,
            num_classified,
        })
    }

    /// Roles of a method
    pub fn get(&self, method: MethodIndex) -> MethodRoles {
        self.roles.get(method.index()).copied().unwrap_or_default()
    }

    /// Number of methods with at least one role
    pub fn num_classified(&self) -> usize {
        self.num_classified
    }
}

/// What can go wrong while classifying well-known methods
#[derive(Error, Debug, PartialEq)]
pub enum ClassifyError {
    /// Not a single well-known method was found
    #[error("found no well-known runtime method among {scanned_methods} core library methods, are symbols missing?")]
    NoWellKnownMethods {
        /// Number of methods that were looked at
        scanned_methods: usize,
    },
}
