//! Synthetic traces for engine scenarios

use activity_stacks::{
    trace::{CodeAddressIndex, ModuleIndex, RawStackIndex},
    ActivityComputer, ActivityObserver, EventPayload, MemoryTrace, ThreadIndex, TraceEvent,
};
use std::collections::HashMap;

/// Well-known runtime methods that scenarios can use in raw stacks
const RUNTIME_METHODS: &[(&str, &str)] = &[
    ("Run", "System.Threading.Tasks.Task.ExecuteEntry"),
    ("ExecCtx", "System.Threading.ExecutionContext.RunInternal"),
    ("Sched", "System.Threading.Tasks.TplEventSource.TaskScheduled"),
    (
        "Queue",
        "System.Threading.Tasks.ThreadPoolTaskScheduler.QueueTask",
    ),
    ("WaitEnd", "System.Threading.Tasks.TplEventSource.TaskWaitEnd"),
];

/// Name of the process that every scenario thread belongs to
pub const PROCESS: &str = "app";

/// Process id of every scenario thread
pub const PID: u32 = 1;

/// Builder of scenario traces
///
/// Frames are designated by short names. Runtime frames are those of
/// `RUNTIME_METHODS`, OS and runtime native frames are named `Os` and `Clr`,
/// and any other name designates a method of the user's `app` module.
pub struct Scenario {
    /// Trace being built
    trace: MemoryTrace,

    /// User module
    app: ModuleIndex,

    /// Code address of each named frame
    codes: HashMap<&'static str, CodeAddressIndex>,
}
//
impl Scenario {
    /// Set up a process with `num_threads` threads whose OS thread ids are
    /// 100, 101, and so on
    pub fn new(num_threads: u32) -> Self {
        Self::with_runtime(num_threads, true)
    }

    /// Like `new()`, but the runtime core library may lack its well-known
    /// methods (as happens when symbols are broken)
    pub fn with_runtime(num_threads: u32, well_known_methods: bool) -> Self {
        let mut trace = MemoryTrace::new();
        let corelib = trace.add_module("System.Private.CoreLib.dll");
        let app = trace.add_module(PROCESS);
        let ntdll = trace.add_module("ntdll.dll");
        let coreclr = trace.add_module("coreclr.dll");
        let mut codes = HashMap::new();
        if well_known_methods {
            for &(short, name) in RUNTIME_METHODS {
                let method = trace.add_method(corelib, name);
                codes.insert(short, trace.add_code(corelib, Some(method)));
            }
        } else {
            let method = trace.add_method(corelib, "System.String.Concat");
            trace.add_code(corelib, Some(method));
        }
        for (short, module, name) in [
            ("Os", ntdll, "RtlUserThreadStart"),
            ("Clr", coreclr, "ThreadNative::KickOffThread"),
        ] {
            let method = trace.add_method(module, name);
            codes.insert(short, trace.add_code(module, Some(method)));
        }
        for thread in 0..num_threads {
            trace.add_thread(100 + thread, PID, PROCESS);
        }
        Self { trace, app, codes }
    }

    /// Register a raw stack, given as frame names from leaf to root
    pub fn stack(&mut self, frames: &[&'static str]) -> RawStackIndex {
        let codes = frames
            .iter()
            .map(|&name| self.code(name))
            .collect::<Vec<_>>();
        self.trace.add_stack(&codes)
    }

    /// Code address of a named frame
    fn code(&mut self, name: &'static str) -> CodeAddressIndex {
        if let Some(&code) = self.codes.get(name) {
            return code;
        }
        let method = self.trace.add_method(self.app, name);
        let code = self.trace.add_code(self.app, Some(method));
        self.codes.insert(name, code);
        code
    }

    /// Record an event on the thread of OS id `100 + thread`
    pub fn event(
        &mut self,
        thread: usize,
        timestamp: f64,
        stack: Option<RawStackIndex>,
        payload: EventPayload,
    ) -> usize {
        self.trace
            .push_event(ThreadIndex::new(thread), timestamp, stack, payload)
            .index()
    }

    /// Hand the trace over to an engine, along with the recorded events
    pub fn finish(mut self) -> Replay {
        let events = self.trace.take_events();
        Replay {
            computer: ActivityComputer::new(self.trace),
            events,
            next: 0,
        }
    }
}

/// Engine replaying a scenario
pub struct Replay {
    /// Engine under test
    pub computer: ActivityComputer<MemoryTrace>,

    /// Scenario events
    events: Vec<TraceEvent>,

    /// Index of the next event to be processed
    next: usize,
}
//
impl Replay {
    /// Process events up to `last` included, with a no-op observer
    pub fn until(&mut self, last: usize) {
        self.until_with(last, &mut ());
    }

    /// Process events up to `last` included
    pub fn until_with(&mut self, last: usize, observer: &mut impl ActivityObserver<MemoryTrace>) {
        while self.next <= last {
            self.computer.process_event(&self.events[self.next], observer);
            self.next += 1;
        }
    }

    /// Access an event
    pub fn event(&self, index: usize) -> &TraceEvent {
        &self.events[index]
    }

    /// Synthesize the stack of an event and return its frame names
    pub fn stack_names(&mut self, event: usize) -> Vec<String> {
        let stack = self
            .computer
            .call_stack(&self.events[event], None, false)
            .expect("Classification should succeed")
            .expect("Event should have a thread");
        self.names(stack)
    }

    /// Frame names of a synthesized stack, from leaf to root
    pub fn names(&self, stack: activity_stacks::CallStackIndex) -> Vec<String> {
        self.computer
            .output()
            .frame_names(stack)
            .into_iter()
            .map(String::from)
            .collect()
    }
}

/// Frame name of a user method
pub fn app(method: &str) -> String {
    format!("{PROCESS}!{method}")
}

/// Root frames of stacks synthesized on the thread of OS id `100 + thread`
pub fn root(thread: u32) -> [String; 2] {
    [
        format!("Thread ({})", 100 + thread),
        format!("Process {PROCESS} ({PID})"),
    ]
}

/// Shorthand for events which do not affect activities, like CPU samples
pub fn sample() -> EventPayload {
    EventPayload::Other
}
