//! In-memory execution trace, loadable from JSON

use crate::trace::{
    CodeAddressIndex, EventIndex, EventPayload, MethodIndex, ModuleIndex, RawStackIndex,
    ThreadIndex, ThreadInfo, Timestamp, TraceEvent, TraceLog,
};
use serde::Deserialize;
use serde_json as json;
use std::{
    borrow::Cow,
    fs::File,
    io::{self, Read},
    path::Path,
    str::FromStr,
};
use thiserror::Error;

/// Loaded module
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct ModuleRecord {
    /// Module name
    name: Box<str>,

    /// Truth that symbols can be obtained for this module
    #[serde(default = "yes")]
    symbols: bool,

    /// Truth that someone asked for this module's symbols
    #[serde(skip)]
    resolved: bool,
}
//
fn yes() -> bool {
    true
}

/// Method known to the symbol resolver
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct MethodRecord {
    /// Fully qualified name
    name: Box<str>,

    /// Module the method belongs to
    module: ModuleIndex,
}

/// Code address appearing in raw stacks
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct CodeAddressRecord {
    /// Instruction address
    address: u64,

    /// Module the address belongs to, if known
    #[serde(default)]
    module: Option<ModuleIndex>,

    /// Method the address belongs to, if known
    #[serde(default)]
    method: Option<MethodIndex>,
}

/// Raw call stack node
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct StackRecord {
    /// Code address of the innermost frame
    code: CodeAddressIndex,

    /// Call stack of the caller, None at the root
    #[serde(default)]
    caller: Option<RawStackIndex>,
}

/// Execution trace held in memory
///
/// Can be loaded from a JSON file or built programmatically. Raw stacks are
/// stored as a tree where each node's caller comes first.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryTrace {
    /// Loaded modules
    modules: Vec<ModuleRecord>,

    /// Methods of all modules
    methods: Vec<MethodRecord>,

    /// Code addresses appearing in raw stacks
    code_addresses: Vec<CodeAddressRecord>,

    /// Raw stack nodes
    stacks: Vec<StackRecord>,

    /// Observed threads
    threads: Vec<ThreadInfo>,

    /// Events, in timestamp order
    events: Vec<TraceEvent>,
}
//
impl MemoryTrace {
    /// Start with an empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TraceLoadError> {
        let mut trace_str = String::new();
        File::open(path)?.read_to_string(&mut trace_str)?;
        Ok(Self::from_str(&trace_str)?)
    }

    /// Add a module with symbols
    pub fn add_module(&mut self, name: &str) -> ModuleIndex {
        self.push_module(name, true)
    }

    /// Add a module for which symbols cannot be obtained
    pub fn add_module_without_symbols(&mut self, name: &str) -> ModuleIndex {
        self.push_module(name, false)
    }

    /// Common part of add_module and add_module_without_symbols
    fn push_module(&mut self, name: &str, symbols: bool) -> ModuleIndex {
        self.modules.push(ModuleRecord {
            name: name.into(),
            symbols,
            resolved: false,
        });
        ModuleIndex::new(self.modules.len() - 1)
    }

    /// Add a method to a module
    pub fn add_method(&mut self, module: ModuleIndex, name: &str) -> MethodIndex {
        assert!(module.index() < self.modules.len(), "invalid {module:?}");
        self.methods.push(MethodRecord {
            name: name.into(),
            module,
        });
        MethodIndex::new(self.methods.len() - 1)
    }

    /// Add a code address within a module, and possibly a method
    pub fn add_code(
        &mut self,
        module: ModuleIndex,
        method: Option<MethodIndex>,
    ) -> CodeAddressIndex {
        assert!(module.index() < self.modules.len(), "invalid {module:?}");
        let index = self.code_addresses.len();
        self.code_addresses.push(CodeAddressRecord {
            address: 0x1000 + 0x10 * index as u64,
            module: Some(module),
            method,
        });
        CodeAddressIndex::new(index)
    }

    /// Add a raw call stack, given as a list of code addresses from leaf to
    /// root, and return the handle to its leaf
    pub fn add_stack(&mut self, frames: &[CodeAddressIndex]) -> RawStackIndex {
        assert!(!frames.is_empty(), "raw stacks have at least one frame");
        let mut caller = None;
        for &code in frames.iter().rev() {
            assert!(code.index() < self.code_addresses.len(), "invalid {code:?}");
            self.stacks.push(StackRecord { code, caller });
            caller = Some(RawStackIndex::new(self.stacks.len() - 1));
        }
        RawStackIndex::new(self.stacks.len() - 1)
    }

    /// Add a thread that lives through the whole trace
    pub fn add_thread(
        &mut self,
        thread_id: u32,
        process_id: u32,
        process_name: &str,
    ) -> ThreadIndex {
        self.threads.push(ThreadInfo {
            thread_id,
            process_id,
            process_name: process_name.into(),
            start: 0.0,
            end: Timestamp::INFINITY,
        });
        ThreadIndex::new(self.threads.len() - 1)
    }

    /// Append an event emitted by a known thread
    pub fn push_event(
        &mut self,
        thread: ThreadIndex,
        timestamp: Timestamp,
        stack: Option<RawStackIndex>,
        payload: EventPayload,
    ) -> EventIndex {
        let index = EventIndex::new(self.events.len());
        self.events.push(TraceEvent {
            index,
            process_id: self.threads[thread.index()].process_id,
            thread: Some(thread),
            timestamp,
            stack,
            payload,
        });
        index
    }

    /// Events recorded so far
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Extract the events, e.g. to replay them while the rest of the trace is
    /// owned by an `ActivityComputer`
    pub fn take_events(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Truth that symbols were requested for a module
    pub fn symbols_resolved(&self, module: ModuleIndex) -> bool {
        self.modules[module.index()].resolved
    }

    /// Check every cross-reference and renumber events
    fn validate(&mut self) -> Result<(), TraceParseError> {
        let num_modules = self.modules.len();
        let num_methods = self.methods.len();
        let num_codes = self.code_addresses.len();
        let num_stacks = self.stacks.len();
        let num_threads = self.threads.len();
        for (idx, method) in self.methods.iter().enumerate() {
            check_reference("method", idx, "module", method.module.index(), num_modules)?;
        }
        for (idx, code) in self.code_addresses.iter().enumerate() {
            if let Some(module) = code.module {
                check_reference("code address", idx, "module", module.index(), num_modules)?;
            }
            if let Some(method) = code.method {
                check_reference("code address", idx, "method", method.index(), num_methods)?;
            }
        }
        for (idx, stack) in self.stacks.iter().enumerate() {
            check_reference("stack", idx, "code address", stack.code.index(), num_codes)?;
            if let Some(caller) = stack.caller {
                check_reference("stack", idx, "stack", caller.index(), idx)?;
            }
        }
        let mut last_timestamp = Timestamp::NEG_INFINITY;
        for (idx, event) in self.events.iter_mut().enumerate() {
            event.index = EventIndex::new(idx);
            if let Some(thread) = event.thread {
                check_reference("event", idx, "thread", thread.index(), num_threads)?;
            }
            if let Some(stack) = event.stack {
                check_reference("event", idx, "stack", stack.index(), num_stacks)?;
            }
            if event.timestamp < last_timestamp {
                return Err(TraceParseError::UnorderedEvents { index: idx });
            }
            last_timestamp = event.timestamp;
        }
        Ok(())
    }

    /// Method of a code address, if its module has symbols
    fn visible_method(&self, code: CodeAddressIndex) -> Option<MethodIndex> {
        self.code_addresses[code.index()]
            .method
            .filter(|&method| self.modules[self.method_module(method).index()].symbols)
    }
}
//
impl FromStr for MemoryTrace {
    type Err = TraceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut trace = json::from_str::<Self>(s)?;
        trace.validate()?;
        Ok(trace)
    }
}
//
impl TraceLog for MemoryTrace {
    fn threads(&self) -> &[ThreadInfo] {
        &self.threads
    }

    fn caller(&self, stack: RawStackIndex) -> Option<RawStackIndex> {
        self.stacks[stack.index()].caller
    }

    fn code_address(&self, stack: RawStackIndex) -> CodeAddressIndex {
        self.stacks[stack.index()].code
    }

    fn method(&self, code: CodeAddressIndex) -> Option<MethodIndex> {
        self.visible_method(code)
    }

    fn code_module(&self, code: CodeAddressIndex) -> Option<ModuleIndex> {
        let record = &self.code_addresses[code.index()];
        record
            .module
            .or_else(|| record.method.map(|method| self.method_module(method)))
    }

    fn frame_name(&self, code: CodeAddressIndex) -> Cow<'_, str> {
        let module = self
            .code_module(code)
            .map_or("?", |module| self.module_name(module));
        match self.visible_method(code) {
            Some(method) => format!("{module}!{}", self.method_name(method)).into(),
            None => format!("{module}!{:#x}", self.code_addresses[code.index()].address).into(),
        }
    }

    fn num_modules(&self) -> usize {
        self.modules.len()
    }

    fn module_name(&self, module: ModuleIndex) -> &str {
        &self.modules[module.index()].name
    }

    fn resolve_module_symbols(&mut self, module: ModuleIndex) -> bool {
        let record = &mut self.modules[module.index()];
        record.resolved = true;
        record.symbols
    }

    fn num_methods(&self) -> usize {
        self.methods.len()
    }

    fn method_module(&self, method: MethodIndex) -> ModuleIndex {
        self.methods[method.index()].module
    }

    fn method_name(&self, method: MethodIndex) -> &str {
        &self.methods[method.index()].name
    }
}

/// What can go wrong while loading a trace from a file
#[derive(Error, Debug)]
pub enum TraceLoadError {
    /// Failed to load data from the file
    #[error("failed to load trace from file ({0})")]
    Io(#[from] io::Error),

    /// Failed to parse data from the file
    #[error("failed to parse trace ({0})")]
    Parse(#[from] TraceParseError),
}

/// What can go wrong while parsing a trace from a string
#[derive(Error, Debug)]
pub enum TraceParseError {
    /// Failed to parse data as JSON
    #[error("failed to parse data as JSON ({0})")]
    Json(#[from] json::Error),

    /// Some record refers to an entity that does not exist
    #[error("{what} #{index} refers to nonexistent {target} #{target_index}")]
    DanglingReference {
        /// Kind of record that holds the reference
        what: &'static str,

        /// Index of that record
        index: usize,

        /// Kind of record that is referred to
        target: &'static str,

        /// Index that is referred to
        target_index: usize,
    },

    /// Events are not sorted by timestamp
    #[error("event #{index} is older than its predecessor")]
    UnorderedEvents {
        /// Index of the first out-of-order event
        index: usize,
    },
}

/// Check that a reference from the `index`-th `what` designates one of the
/// `len` first elements of the `target` table
fn check_reference(
    what: &'static str,
    index: usize,
    target: &'static str,
    target_index: usize,
    len: usize,
) -> Result<(), TraceParseError> {
    if target_index < len {
        Ok(())
    } else {
        Err(TraceParseError::DanglingReference {
            what,
            index,
            target,
            target_index,
        })
    }
}
