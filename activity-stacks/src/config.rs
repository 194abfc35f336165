//! Tunables of the activity correlation engine

use crate::cache::StackCache;
use serde::Deserialize;
use serde_json as json;
use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    str::FromStr,
};
use thiserror::Error;

/// Configuration of an `ActivityComputer`
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ComputerConfig {
    /// Disable the synthesized stack cache
    ///
    /// Needed when the top frames that the caller wants to see at the root of
    /// synthesized stacks are not purely a function of the thread.
    pub no_cache: bool,

    /// Base-2 logarithm of the number of synthesized stack cache slots
    pub cache_size_log2: u8,

    /// Module name fragments that identify the runtime core library
    pub core_library_patterns: Vec<Box<str>>,

    /// Module name fragments used to recognize unbroken raw stacks
    pub unbroken_stack: UnbrokenStackRules,
}
//
impl ComputerConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let mut config_str = String::new();
        File::open(path)?.read_to_string(&mut config_str)?;
        Ok(Self::from_str(&config_str)?)
    }

    /// Cache size, clamped to the supported range
    pub fn clamped_cache_size_log2(&self) -> u8 {
        self.cache_size_log2
            .clamp(StackCache::MIN_SIZE_LOG2, StackCache::MAX_SIZE_LOG2)
    }
}
//
impl Default for ComputerConfig {
    fn default() -> Self {
        Self {
            no_cache: false,
            cache_size_log2: 10,
            core_library_patterns: vec!["mscorlib".into(), "system.private.corelib".into()],
            unbroken_stack: UnbrokenStackRules::default(),
        }
    }
}
//
impl FromStr for ComputerConfig {
    type Err = json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        json::from_str(s)
    }
}

/// Module name fragments telling apart raw stacks that were fully walked
///
/// A context switch stack is deemed unbroken if its root frame belongs to one
/// of the `root_modules`, at least one frame belongs to one of the
/// `runtime_modules` and no frame belongs to one of the `jit_modules`. All
/// matching is case-insensitive substring matching.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UnbrokenStackRules {
    /// Where fully walked stacks bottom out (OS thread dispatch library)
    pub root_modules: Vec<Box<str>>,

    /// Runtime modules that a managed thread's stack goes through
    pub runtime_modules: Vec<Box<str>>,

    /// Just-in-time compiler modules, which break stack walks
    pub jit_modules: Vec<Box<str>>,
}
//
impl UnbrokenStackRules {
    /// Truth that some module name matches one of some patterns
    pub(crate) fn matches(patterns: &[Box<str>], module_name: &str) -> bool {
        let module_name = module_name.to_lowercase();
        patterns
            .iter()
            .any(|pattern| module_name.contains(&*pattern.to_lowercase()))
    }
}
//
impl Default for UnbrokenStackRules {
    fn default() -> Self {
        Self {
            root_modules: vec!["ntdll".into()],
            runtime_modules: vec!["clr".into(), "coreclr".into()],
            jit_modules: vec!["clrjit".into()],
        }
    }
}

/// What can go wrong while loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    /// Failed to load data from the file
    #[error("failed to load configuration from file ({0})")]
    Io(#[from] io::Error),

    /// Failed to parse data from the file
    #[error("failed to parse configuration ({0})")]
    Parse(#[from] json::Error),
}
