//! Translation of raw trace events into activity lifecycle commands
//!
//! This is a pure function of each event: all state lives in the
//! `ActivityComputer` that executes the resulting commands.

use crate::{
    activity::ActivityKind,
    identity::{IdKind, RawActivityId},
    trace::{EventPayload, TraceEvent, TransferKind, WaitBehavior},
};

/// What to do when a creation targets a raw identity that is still pending
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum OnDuplicate {
    /// Keep the pending activity and drop the new one (first write wins)
    Ignore,

    /// Register the new activity in place of the pending one (last write wins)
    Replace,
}

/// Activity lifecycle transition requested by a trace event
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Command {
    /// Create a new activity on the event's thread
    Create {
        /// Identity under which the new activity is registered
        raw_id: RawActivityId,

        /// Kind of the new activity
        kind: ActivityKind,

        /// Policy for identities that are still pending
        on_duplicate: OnDuplicate,

        /// Record the new activity as a wait of its creator
        records_wait: bool,
    },

    /// Start a previously created activity on the event's thread
    Start {
        /// Identity of the activity
        raw_id: RawActivityId,

        /// Truth that this start marks the end of a wait
        await_end: bool,
    },

    /// Stop a running activity
    Stop {
        /// Identity of the activity
        raw_id: RawActivityId,
    },
}

/// Figure out which lifecycle transition, if any, an event calls for
pub fn translate(event: &TraceEvent) -> Option<Command> {
    let id = |kind, correlation| RawActivityId::for_event(event, kind, correlation);
    let create = |raw_id, kind, on_duplicate| Command::Create {
        raw_id,
        kind,
        on_duplicate,
        records_wait: false,
    };
    let start = |raw_id| Command::Start {
        raw_id,
        await_end: false,
    };
    let command = match event.payload {
        EventPayload::TaskScheduled { task_id } => create(
            id(IdKind::ScheduledTask, task_id.into()),
            ActivityKind::TaskScheduled,
            OnDuplicate::Ignore,
        ),
        EventPayload::AwaitTaskContinuationScheduled {
            continue_with_task_id,
        } => create(
            id(IdKind::ScheduledTask, continue_with_task_id.into()),
            ActivityKind::AwaitTaskScheduled,
            OnDuplicate::Replace,
        ),
        EventPayload::TaskExecuteStart { task_id } => {
            start(id(IdKind::ScheduledTask, task_id.into()))
        }
        EventPayload::TaskExecuteStop { task_id } => Command::Stop {
            raw_id: id(IdKind::ScheduledTask, task_id.into()),
        },
        EventPayload::TaskWaitSend { task_id, behavior } => Command::Create {
            raw_id: id(IdKind::Continuation, task_id.into()),
            kind: match behavior {
                WaitBehavior::Synchronous => ActivityKind::TaskWaitSynchronous,
                WaitBehavior::Asynchronous => ActivityKind::TaskWait,
            },
            on_duplicate: OnDuplicate::Replace,
            records_wait: true,
        },
        EventPayload::TaskWaitStop { task_id } => Command::Start {
            raw_id: id(IdKind::Continuation, task_id.into()),
            await_end: true,
        },
        EventPayload::ThreadTransferSend { id: transfer, kind } => create(
            id(IdKind::Timer, transfer),
            transfer_activity_kind(kind),
            OnDuplicate::Replace,
        ),
        EventPayload::ThreadTransferReceive { id: transfer, .. } => {
            start(id(IdKind::Timer, transfer))
        }
        EventPayload::IoEnqueue { native_overlapped }
        | EventPayload::IoPack { native_overlapped } => create(
            id(IdKind::Io, native_overlapped),
            ActivityKind::IoThreadPool,
            OnDuplicate::Replace,
        ),
        EventPayload::IoDequeue { native_overlapped } => start(id(IdKind::Io, native_overlapped)),
        EventPayload::ContextSwitch | EventPayload::Other => return None,
    };
    Some(command)
}

/// Kind of the activity created by a framework thread transfer
fn transfer_activity_kind(kind: TransferKind) -> ActivityKind {
    match kind {
        TransferKind::Timer => ActivityKind::FxTimer,
        TransferKind::AsyncIo => ActivityKind::FxAsyncIo,
        TransferKind::WinRtDispatch => ActivityKind::FxWinRtDispatch,
        TransferKind::Other => ActivityKind::FxTransfer,
    }
}
