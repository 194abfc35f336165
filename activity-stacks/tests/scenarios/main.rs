//! Replay of synthetic traces through the activity correlation engine

mod fixture;
mod log;

use crate::{
    fixture::{app, root, sample, Scenario},
    log::{LogCapture, LogLevel},
};
use activity_stacks::{
    trace::WaitBehavior, ActivityComputer, ActivityIndex, ActivityKind, ActivityObserver,
    ClassifyError, EventPayload, MemoryTrace, ThreadIndex, TraceEvent,
};
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

/// Thread 0 schedules task 1 from method Y calling X, then thread 1 runs it
/// and calls Z. Returns the index of a CPU sample taken in Z.
fn schedule_and_run(scenario: &mut Scenario) -> usize {
    let creation = scenario.stack(&["Sched", "Queue", "X", "Y"]);
    scenario.event(
        0,
        1.0,
        Some(creation),
        EventPayload::TaskScheduled { task_id: 1 },
    );
    scenario.event(1, 2.0, None, EventPayload::TaskExecuteStart { task_id: 1 });
    let running = scenario.stack(&["Z", "Run", "Y"]);
    scenario.event(1, 3.0, Some(running), sample())
}

#[test]
fn splice() {
    let mut scenario = Scenario::new(2);
    let idx = schedule_and_run(&mut scenario);
    let mut replay = scenario.finish();
    replay.until(idx);

    let task = replay.computer.current_activity(ThreadIndex::new(1));
    assert_eq!(
        replay.computer.activity(task).kind(),
        ActivityKind::TaskScheduled
    );
    assert_eq!(
        replay.computer.activity(task).creator(),
        Some(ActivityIndex::new(0))
    );

    let [thread, process] = root(0);
    assert_eq!(
        replay.stack_names(idx),
        vec![
            app("Z"),
            "STARTING TASK on Thread 101".to_owned(),
            app("X"),
            app("Y"),
            thread,
            process
        ]
    );
}

#[test]
fn cache_transparency() {
    let replay_with = |no_cache| {
        let mut scenario = Scenario::new(2);
        let idx = schedule_and_run(&mut scenario);
        let mut replay = scenario.finish();
        replay.computer.set_no_cache(no_cache);
        replay.until(idx);
        let event = replay.event(idx).clone();
        let first = replay.computer.call_stack(&event, None, false).unwrap();
        let second = replay.computer.call_stack(&event, None, false).unwrap();
        assert_eq!(first, second);
        replay.names(first.unwrap())
    };
    assert_eq!(replay_with(false), replay_with(true));
}

#[test]
fn recursion_collapse() {
    let mut scenario = Scenario::new(3);
    schedule_and_run(&mut scenario);
    let creation = scenario.stack(&["Sched", "Queue", "Z", "Run", "Y"]);
    scenario.event(
        1,
        4.0,
        Some(creation),
        EventPayload::TaskScheduled { task_id: 2 },
    );
    scenario.event(2, 5.0, None, EventPayload::TaskExecuteStart { task_id: 2 });
    let running = scenario.stack(&["Z", "Run", "W"]);
    let idx = scenario.event(2, 6.0, Some(running), sample());
    let mut replay = scenario.finish();
    replay.until(idx);

    let event = replay.event(idx).clone();
    let stack = replay
        .computer
        .call_stack(&event, None, false)
        .unwrap()
        .unwrap();
    let [thread, process] = root(0);
    let expected = vec![
        app("Z"),
        "STARTING TASK on Thread 101, 102".to_owned(),
        app("X"),
        app("Y"),
        thread,
        process,
    ];
    assert_eq!(replay.names(stack), expected);

    // The nested task reuses the stack of its creator as-is
    let task = replay.computer.current_activity(ThreadIndex::new(2));
    assert_eq!(
        replay.computer.call_stack_for_activity(task, None).unwrap(),
        stack
    );

    // Thread ids are only recorded once
    assert_eq!(replay.stack_names(idx), expected);
}

/// Thread 0 runs a chain of `num_tasks` continuations, each one scheduled by
/// the previous one, alternately from methods X and Y. Returns the index of a
/// CPU sample taken in Z while the last task runs.
fn continuation_chain(scenario: &mut Scenario, num_tasks: u32) -> usize {
    let from_x = scenario.stack(&["Sched", "Queue", "X", "Run", "W"]);
    let from_y = scenario.stack(&["Sched", "Queue", "Y", "Run", "W"]);
    let mut timestamp = 0.0;
    let mut tick = || {
        timestamp += 1.0;
        timestamp
    };
    for task_id in 1..=num_tasks {
        let creation = if task_id % 2 == 0 { from_x } else { from_y };
        scenario.event(
            0,
            tick(),
            Some(creation),
            EventPayload::TaskScheduled { task_id },
        );
        if task_id > 1 {
            scenario.event(
                0,
                tick(),
                None,
                EventPayload::TaskExecuteStop {
                    task_id: task_id - 1,
                },
            );
        }
        scenario.event(0, tick(), None, EventPayload::TaskExecuteStart { task_id });
    }
    let running = scenario.stack(&["Z", "Run", "W"]);
    scenario.event(0, tick(), Some(running), sample())
}

#[test]
fn long_continuation_chain() {
    const NUM_TASKS: u32 = 20_000;
    let synthesize_with = |no_cache| {
        let mut scenario = Scenario::new(1);
        let idx = continuation_chain(&mut scenario, NUM_TASKS);
        let mut replay = scenario.finish();
        replay.computer.set_no_cache(no_cache);
        replay.until(idx);
        replay.stack_names(idx)
    };
    let names = synthesize_with(false);

    // Each task adds a marker and the frame that scheduled its successor
    assert_eq!(names.len(), 2 * NUM_TASKS as usize + 5);
    let marker = "STARTING TASK on Thread 100".to_owned();
    assert_eq!(names[..4], [app("Z"), marker.clone(), app("X"), marker]);
    let [thread, process] = root(0);
    assert_eq!(
        names[names.len() - 5..],
        [
            app("Y"),
            "System.Private.CoreLib.dll!System.Threading.Tasks.Task.ExecuteEntry".to_owned(),
            app("W"),
            thread,
            process
        ]
    );
    assert_eq!(synthesize_with(true), names);
}

/// Observer that records which waits unblocked their creator, along with the
/// stack that started waiting
#[derive(Default)]
struct UnblockRecorder {
    unblocked: Vec<(ActivityIndex, Vec<String>)>,
}
//
impl ActivityObserver<MemoryTrace> for UnblockRecorder {
    fn on_await_unblocks(
        &mut self,
        computer: &mut ActivityComputer<MemoryTrace>,
        activity: ActivityIndex,
        _event: &TraceEvent,
    ) {
        let stack = computer
            .call_stack_for_activity(activity, None)
            .expect("Classification should succeed");
        let names = computer
            .output()
            .frame_names(stack)
            .into_iter()
            .map(String::from)
            .collect();
        self.unblocked.push((activity, names));
    }
}

#[test]
fn await_unblocks_once() {
    let mut scenario = Scenario::new(2);
    let waiting = scenario.stack(&["X", "Y"]);
    for task_id in [5, 6] {
        scenario.event(
            0,
            f64::from(task_id),
            Some(waiting),
            EventPayload::TaskWaitSend {
                task_id,
                behavior: WaitBehavior::Asynchronous,
            },
        );
    }
    scenario.event(1, 7.0, None, EventPayload::TaskWaitStop { task_id: 5 });
    let last = scenario.event(1, 8.0, None, EventPayload::TaskWaitStop { task_id: 6 });
    let mut replay = scenario.finish();
    let mut recorder = UnblockRecorder::default();
    replay.until_with(last, &mut recorder);

    let [first, second] = [2, 3].map(ActivityIndex::new);
    let [thread, process] = root(0);
    assert_eq!(
        recorder.unblocked,
        vec![(first, vec![app("X"), app("Y"), thread, process])]
    );

    // The end of the second wait implicitly completes the first continuation
    assert_eq!(replay.computer.activity(first).end_time(), Some(8.0));
    assert_eq!(
        replay.computer.current_activity(ThreadIndex::new(1)),
        second
    );
    assert!(replay
        .computer
        .stacks()
        .pending_waits(ActivityIndex::new(0))
        .is_empty());
}

#[test]
fn synchronous_wait() {
    let mut scenario = Scenario::new(1);
    scenario.event(
        0,
        1.0,
        None,
        EventPayload::TaskWaitSend {
            task_id: 3,
            behavior: WaitBehavior::Synchronous,
        },
    );
    let last = scenario.event(0, 2.0, None, EventPayload::TaskWaitStop { task_id: 3 });
    let mut replay = scenario.finish();
    replay.until(last);

    let wait = replay.computer.activity(ActivityIndex::new(1));
    assert_eq!(wait.kind(), ActivityKind::TaskWaitSynchronous);
    assert_eq!(wait.start_time(), Some(2.0));
    assert_eq!(wait.end_time(), Some(2.0));
    assert_eq!(
        replay.computer.current_activity(ThreadIndex::new(0)),
        ActivityIndex::new(0)
    );
}

#[test]
fn missing_runtime_methods_are_fatal() {
    let mut scenario = Scenario::with_runtime(1, false);
    let raw = scenario.stack(&["X"]);
    let idx = scenario.event(0, 1.0, Some(raw), sample());
    let mut replay = scenario.finish();
    replay.until(idx);

    let event = replay.event(idx).clone();
    assert_matches!(
        replay.computer.call_stack(&event, None, false),
        Err(ClassifyError::NoWellKnownMethods { .. })
    );
    assert_matches!(
        replay.computer.classify(),
        Err(ClassifyError::NoWellKnownMethods { .. })
    );
}

#[test]
fn unbroken_stack_resets_thread() {
    let mut scenario = Scenario::new(2);
    schedule_and_run(&mut scenario);
    let idle = scenario.stack(&["Clr", "Os"]);
    let idx = scenario.event(1, 4.0, Some(idle), EventPayload::ContextSwitch);
    let mut replay = scenario.finish();
    replay.until(idx);

    // The task never stopped, so it is still considered running...
    let thread = ThreadIndex::new(1);
    assert_ne!(
        replay.computer.current_activity(thread),
        replay.computer.default_activity(thread)
    );

    // ...until a stack shows that the thread went back to the OS
    let [thread_frame, process] = root(1);
    assert_eq!(
        replay.stack_names(idx),
        vec![
            "coreclr.dll!ThreadNative::KickOffThread".to_owned(),
            "ntdll.dll!RtlUserThreadStart".to_owned(),
            thread_frame,
            process
        ]
    );
    assert_eq!(
        replay.computer.current_activity(thread),
        replay.computer.default_activity(thread)
    );
}

#[test]
fn activity_only() {
    let mut scenario = Scenario::new(2);
    let idx = schedule_and_run(&mut scenario);
    let mut replay = scenario.finish();
    replay.until(idx);

    let task = replay.computer.current_activity(ThreadIndex::new(1));
    let stack = replay.computer.activity_only_stack(task);
    assert_eq!(
        replay.names(stack),
        vec![
            "TaskScheduled (Activity 2)",
            "Thread (100)",
            "Process app (1)"
        ]
    );
}

#[test]
fn protocol_violations_are_logged() {
    let log = LogCapture::start();
    let mut scenario = Scenario::new(2);
    scenario.event(0, 1.0, None, EventPayload::TaskExecuteStart { task_id: 99 });
    scenario.event(0, 2.0, None, EventPayload::TaskScheduled { task_id: 1 });
    scenario.event(0, 3.0, None, EventPayload::TaskScheduled { task_id: 1 });
    scenario.event(1, 4.0, None, EventPayload::TaskExecuteStart { task_id: 1 });
    scenario.event(1, 5.0, None, EventPayload::TaskExecuteStart { task_id: 1 });
    scenario.event(0, 6.0, None, EventPayload::TaskScheduled { task_id: 2 });
    let last = scenario.event(0, 7.0, None, EventPayload::TaskExecuteStop { task_id: 2 });
    let mut replay = scenario.finish();
    replay.until(last);

    assert_eq!(
        log.take(LogLevel::Warn),
        vec![
            "Start of ScheduledTask 0x63 in process 1 at event 0 matches no pending activity",
            "Ignoring duplicate creation of ScheduledTask 0x1 in process 1 at event 2, activity 2 is still pending",
            "Double start of activity 2 (TaskScheduled) at event 4",
            "Stopping unstarted activity 3 (TaskScheduled) at event 6, resetting thread 0",
        ]
    );

    // None of this prevents the first task from running
    assert_eq!(
        replay.computer.current_activity(ThreadIndex::new(1)),
        ActivityIndex::new(2)
    );
    assert_eq!(
        replay.computer.activity(ActivityIndex::new(3)).end_time(),
        Some(7.0)
    );
}

#[test]
fn repeated_stops_are_harmless() {
    let log = LogCapture::start();
    let mut scenario = Scenario::new(2);
    scenario.event(0, 1.0, None, EventPayload::TaskScheduled { task_id: 1 });
    scenario.event(1, 2.0, None, EventPayload::TaskExecuteStart { task_id: 1 });
    scenario.event(1, 3.0, None, EventPayload::TaskExecuteStop { task_id: 1 });
    let last = scenario.event(1, 4.0, None, EventPayload::TaskExecuteStop { task_id: 1 });
    let mut replay = scenario.finish();
    replay.until(last);

    let task = replay.computer.activity(ActivityIndex::new(2));
    assert_eq!(task.start_time(), Some(2.0));
    assert_eq!(task.end_time(), Some(3.0));
    assert_eq!(replay.computer.registry().num_live(), 0);
    assert!(log.take(LogLevel::Warn).is_empty());
    assert_eq!(
        log.take(LogLevel::Debug),
        vec![
            "Stop of ScheduledTask 0x1 in process 1 at event 3 matches no pending activity",
            "Ignoring stop of an unknown activity at event 3",
        ]
    );
}

#[test]
fn default_activities() {
    let mut scenario = Scenario::new(3);
    schedule_and_run(&mut scenario);
    let last = scenario.event(2, 4.0, None, EventPayload::TaskScheduled { task_id: 7 });
    let mut replay = scenario.finish();
    replay.until(last);

    let registry = replay.computer.registry();
    let roots = registry
        .iter()
        .filter(|activity| activity.creator().is_none())
        .map(|activity| activity.index())
        .collect::<Vec<_>>();
    assert_eq!(roots, (0..3).map(ActivityIndex::new).collect::<Vec<_>>());
    for thread in (0..3).map(ThreadIndex::new) {
        let default = replay.computer.default_activity(thread);
        assert_eq!(default, replay.computer.default_activity(thread));
        assert_eq!(replay.computer.activity(default).thread(), thread);
        assert_eq!(
            replay.computer.activity(default).kind(),
            ActivityKind::Initial
        );
    }
}
