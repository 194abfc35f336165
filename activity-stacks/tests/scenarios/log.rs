//! Checking logs from the activity correlation engine

use log::{LevelFilter, Log};
use simplelog::{CombinedLogger, Config, SharedLogger, TestLogger};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, OnceLock},
    thread::{self, ThreadId},
};

pub use log::Level as LogLevel;

/// Handle to the logs emitted by the current test
///
/// The engine is single-threaded, so every log that it emits on behalf of a
/// test comes from that test's thread. Logs are recorded from the moment
/// where this handle is created to the moment where it is dropped.
pub struct LogCapture(ThreadId);
//
impl LogCapture {
    /// Start recording the logs of the current thread
    pub fn start() -> Self {
        let thread = thread::current().id();
        LogCollector::instance().insert(thread, Vec::new());
        Self(thread)
    }

    /// Extract the messages recorded so far at some level
    pub fn take(&self, level: LogLevel) -> Vec<String> {
        let mut lock = LogCollector::instance();
        let logs = lock
            .get_mut(&self.0)
            .expect("Capture should be registered until dropped");
        let (taken, kept) = std::mem::take(logs)
            .into_iter()
            .partition::<Vec<_>, _>(|(log_level, _)| *log_level == level);
        *logs = kept;
        taken.into_iter().map(|(_, message)| message).collect()
    }
}
//
impl Drop for LogCapture {
    fn drop(&mut self) {
        LogCollector::instance().remove(&self.0);
    }
}

/// Global log collector
struct LogCollector;
//
impl LogCollector {
    /// Acquire access to the recorded logs, setting up logging as needed
    fn instance() -> MutexGuard<'static, HashMap<ThreadId, Vec<(LogLevel, String)>>> {
        static LOGS: OnceLock<Mutex<HashMap<ThreadId, Vec<(LogLevel, String)>>>> =
            OnceLock::new();
        LOGS.get_or_init(|| {
            CombinedLogger::init(vec![
                TestLogger::new(LevelFilter::Warn, Config::default()),
                Box::new(LogCollectorHandle),
            ])
            .expect("Failed to initialize logger");
            Mutex::new(HashMap::new())
        })
        .lock()
        .expect("Log collector was poisoned")
    }
}

/// Logger that feeds engine logs to the LogCollector
struct LogCollectorHandle;
//
impl Log for LogCollectorHandle {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.target().starts_with("activity_stacks") && metadata.level() <= LogLevel::Debug
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let mut lock = LogCollector::instance();
            if let Some(logs) = lock.get_mut(&thread::current().id()) {
                logs.push((record.level(), format!("{}", record.args())));
            }
        }
    }

    fn flush(&self) {}
}
//
impl SharedLogger for LogCollectorHandle {
    fn level(&self) -> LevelFilter {
        LevelFilter::Debug
    }

    fn config(&self) -> Option<&Config> {
        None
    }

    fn as_log(self: Box<Self>) -> Box<dyn Log> {
        self as _
    }
}
