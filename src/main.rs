//! Activity-aware call stacks for asynchronous programs

#![deny(missing_docs)]

mod profile;
mod stdio;

use activity_stacks::{
    ActivityComputer, ActivityIndex, ActivityObserver, ClassifyError, ComputerConfig,
    ConfigLoadError, EventPayload, MemoryTrace, TraceEvent, TraceLoadError, TraceLog,
};
use clap::Parser;
use profile::StackProfile;
use std::{path::PathBuf, process::ExitCode};
use thiserror::Error;

/// Replay an execution trace and display where time went, following
/// asynchronous work back to the code that queued it
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct CliArgs {
    /// Engine configuration file (JSON)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Disable the synthesized stack cache
    #[clap(long)]
    no_cache: bool,

    /// Only display chains of activities, ignoring raw call stacks
    #[clap(short, long)]
    activity_only: bool,

    /// Remove the runtime frames that logged each event from raw stacks
    #[clap(short, long)]
    trim: bool,

    /// Hide call tree nodes below this percentage of samples
    #[clap(short = 'T', long, default_value = "0")]
    threshold: f32,

    /// Execution trace to be analyzed (JSON)
    input: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = CliArgs::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Replay the trace and display the resulting profile
fn run(args: CliArgs) -> Result<(), CliError> {
    // Load the inputs
    let mut config = match &args.config {
        Some(path) => ComputerConfig::from_file(path)?,
        None => ComputerConfig::default(),
    };
    config.no_cache |= args.no_cache;
    eprintln!("Processing input data...");
    let mut trace = MemoryTrace::from_file(&args.input)?;
    let events = trace.take_events();
    let mut computer = ActivityComputer::with_config(trace, config);
    if !args.activity_only {
        let roles = computer.classify()?;
        log::info!("{} well-known runtime methods", roles.num_classified());
    }

    // Replay events, sampling the synthesized stack of each CPU sample
    let mut counts = LifecycleCounts::default();
    let mut profile = StackProfile::new();
    for event in &events {
        computer.process_event(event, &mut counts);
        if !is_sample(event) {
            continue;
        }
        let Some(thread) = computer.event_thread(event) else {
            continue;
        };
        let stack = if args.activity_only {
            computer.activity_only_stack(computer.current_activity(thread))
        } else {
            match computer.call_stack(event, None, args.trim)? {
                Some(stack) => stack,
                None => continue,
            }
        };
        let kind = computer
            .activity(computer.current_activity(thread))
            .kind();
        profile.record(computer.output(), stack, kind);
    }

    // Display the results
    println!(
        "Data from {} ({} threads, {} events, {} activities)",
        args.input.display(),
        computer.log().threads().len(),
        events.len(),
        computer.registry().len()
    );
    stdio::print_lifecycle_counts(&counts);
    if profile.total() > 0 {
        stdio::print_kind_breakdown(&profile);
        stdio::print_hierarchical_profile(
            &profile,
            computer.output(),
            f64::from(args.threshold) / 100.0,
        );
    } else {
        println!("\nNo CPU sample with a call stack was found");
    }
    Ok(())
}

/// Truth that an event is a call stack sample to be profiled
fn is_sample(event: &TraceEvent) -> bool {
    event.stack.is_some()
        && matches!(
            event.payload,
            EventPayload::Other | EventPayload::ContextSwitch
        )
}

/// Number of activity lifecycle notifications of each kind
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LifecycleCounts {
    /// Activities created
    pub created: usize,

    /// Activity starts
    pub started: usize,

    /// Activity stops
    pub stopped: usize,

    /// Awaits that unblocked their creator
    pub unblocked: usize,
}
//
impl<L: TraceLog> ActivityObserver<L> for LifecycleCounts {
    fn on_create(&mut self, _: &mut ActivityComputer<L>, _: ActivityIndex, _: &TraceEvent) {
        self.created += 1;
    }

    fn on_start(&mut self, _: &mut ActivityComputer<L>, _: ActivityIndex, _: &TraceEvent) {
        self.started += 1;
    }

    fn on_stop(&mut self, _: &mut ActivityComputer<L>, _: ActivityIndex, _: &TraceEvent) {
        self.stopped += 1;
    }

    fn on_await_unblocks(&mut self, _: &mut ActivityComputer<L>, _: ActivityIndex, _: &TraceEvent) {
        self.unblocked += 1;
    }
}

/// What can go wrong while replaying a trace
#[derive(Error, Debug)]
enum CliError {
    /// Failed to load the configuration
    #[error(transparent)]
    Config(#[from] ConfigLoadError),

    /// Failed to load the trace
    #[error(transparent)]
    Trace(#[from] TraceLoadError),

    /// Failed to make sense of the trace's runtime
    #[error(transparent)]
    Classify(#[from] ClassifyError),
}
