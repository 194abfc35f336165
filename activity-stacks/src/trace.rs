//! Interface to the execution trace which activities are reconstructed from
//!
//! The engine does not parse traces itself. It consumes a time-ordered stream
//! of `TraceEvent`s, and queries a `TraceLog` for everything else it needs to
//! know: thread bookkeeping, raw call stack navigation and just enough symbol
//! information to recognize a few well-known runtime methods.

use serde::Deserialize;
use std::borrow::Cow;

/// Clock timestamp, in milliseconds since the start of the trace
pub type Timestamp = f64;

index_type! {
    /// Position of a thread in `TraceLog::threads()`
    ThreadIndex
}

index_type! {
    /// Handle to a raw call stack, i.e. one instruction-level frame plus a
    /// handle to the raw call stack of its caller
    RawStackIndex
}

index_type! {
    /// Handle to a code address appearing in raw call stacks
    CodeAddressIndex
}

index_type! {
    /// Handle to a method known to the symbol resolver
    MethodIndex
}

index_type! {
    /// Handle to a loaded module (DLL, shared library...)
    ModuleIndex
}

index_type! {
    /// Position of an event in the trace
    EventIndex
}

/// Bookkeeping information about an OS thread
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ThreadInfo {
    /// OS thread identifier
    pub thread_id: u32,

    /// OS identifier of the process which the thread belongs to
    pub process_id: u32,

    /// Name of that process
    pub process_name: Box<str>,

    /// When the thread started, or trace start if it was already running
    #[serde(default)]
    pub start: Timestamp,

    /// When the thread ended, or trace end if it was still running
    #[serde(default = "infinite_end")]
    pub end: Timestamp,
}
//
fn infinite_end() -> Timestamp {
    Timestamp::INFINITY
}

/// Execution trace, as seen by the activity correlation engine
pub trait TraceLog {
    /// Every thread that was observed during the trace
    fn threads(&self) -> &[ThreadInfo];

    /// Information about one thread, if the index is valid
    fn thread(&self, thread: ThreadIndex) -> Option<&ThreadInfo> {
        self.threads().get(thread.index())
    }

    /// Raw call stack of the caller of some frame, None at the root
    fn caller(&self, stack: RawStackIndex) -> Option<RawStackIndex>;

    /// Code address of the innermost frame of a raw call stack
    fn code_address(&self, stack: RawStackIndex) -> CodeAddressIndex;

    /// Method which a code address belongs to, if it could be resolved
    fn method(&self, code: CodeAddressIndex) -> Option<MethodIndex>;

    /// Module which a code address belongs to, if known
    fn code_module(&self, code: CodeAddressIndex) -> Option<ModuleIndex>;

    /// Human-readable name of the frame associated with a code address
    fn frame_name(&self, code: CodeAddressIndex) -> Cow<'_, str>;

    /// Number of modules that were loaded during the trace
    fn num_modules(&self) -> usize;

    /// Name of a module
    fn module_name(&self, module: ModuleIndex) -> &str;

    /// Make sure that the methods of a module are resolved
    ///
    /// Returns false if symbols could not be obtained for that module.
    fn resolve_module_symbols(&mut self, module: ModuleIndex) -> bool;

    /// Number of methods known to the symbol resolver
    fn num_methods(&self) -> usize;

    /// Module which a method belongs to
    fn method_module(&self, method: MethodIndex) -> ModuleIndex;

    /// Fully qualified name of a method
    fn method_name(&self, method: MethodIndex) -> &str;
}

/// Event from the execution trace
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TraceEvent {
    /// Position of this event in the trace
    #[serde(default)]
    pub index: EventIndex,

    /// Process that emitted this event
    pub process_id: u32,

    /// Thread that emitted this event, if it could be determined
    #[serde(default)]
    pub thread: Option<ThreadIndex>,

    /// When this event was emitted
    pub timestamp: Timestamp,

    /// Raw call stack at the time the event was emitted, if collected
    #[serde(default)]
    pub stack: Option<RawStackIndex>,

    /// Event-specific data
    pub payload: EventPayload,
}

/// Event shapes that the activity correlation engine knows about
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum EventPayload {
    /// A task was queued to a task scheduler
    TaskScheduled {
        /// Identifier of the scheduled task
        task_id: u32,
    },

    /// A task started executing
    TaskExecuteStart {
        /// Identifier of the task
        task_id: u32,
    },

    /// A task finished executing
    TaskExecuteStop {
        /// Identifier of the task
        task_id: u32,
    },

    /// The continuation of an await was queued
    AwaitTaskContinuationScheduled {
        /// Identifier of the task that will run the continuation
        continue_with_task_id: u32,
    },

    /// Some code started waiting for a task
    TaskWaitSend {
        /// Identifier of the awaited task
        task_id: u32,

        /// Whether the wait blocks the current thread
        behavior: WaitBehavior,
    },

    /// A wait for a task ended
    TaskWaitStop {
        /// Identifier of the awaited task
        task_id: u32,
    },

    /// Work was handed over to another thread by a framework component
    ThreadTransferSend {
        /// Correlation identifier
        id: u64,

        /// Nature of the transfer
        kind: TransferKind,
    },

    /// Work handed over by `ThreadTransferSend` started running
    ThreadTransferReceive {
        /// Correlation identifier
        id: u64,

        /// Nature of the transfer
        kind: TransferKind,
    },

    /// An I/O completion was queued to the I/O thread pool
    IoEnqueue {
        /// Address of the native overlapped structure of the I/O operation
        native_overlapped: u64,
    },

    /// An I/O request was packed for the I/O thread pool
    IoPack {
        /// Address of the native overlapped structure of the I/O operation
        native_overlapped: u64,
    },

    /// An I/O completion was dequeued by an I/O thread pool worker
    IoDequeue {
        /// Address of the native overlapped structure of the I/O operation
        native_overlapped: u64,
    },

    /// The OS switched threads on a CPU
    ContextSwitch,

    /// Any other event, e.g. a CPU sample
    Other,
}

/// How a task wait affects the waiting thread
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
pub enum WaitBehavior {
    /// The thread blocks until the task completes
    Synchronous,

    /// The thread goes on and the continuation runs later
    Asynchronous,
}

/// Nature of a framework thread transfer
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
pub enum TransferKind {
    /// Managed timer, may fire several times
    Timer,

    /// Managed asynchronous I/O operation
    AsyncIo,

    /// WinRT dispatcher operation
    WinRtDispatch,

    /// Transfer of an unknown nature
    Other,
}
