//! Correlation keys used to match the creation of an activity with its start
//! and stop events

use crate::trace::TraceEvent;
use std::fmt::{self, Display, Formatter};

/// Family of correlation numbers that a raw activity identity belongs to
///
/// Providers reuse small integers across unrelated id spaces (a task id and a
/// timer id may well be equal), so the family is part of the identity.
#[derive(
    Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum IdKind {
    /// Code that runs once an awaited task completes
    Continuation = 1,

    /// Task queued to a task scheduler
    ScheduledTask = 2,

    /// Framework thread transfer, most often a timer
    Timer = 3,

    /// I/O thread pool completion
    Io = 4,
}

/// Process-scoped identity of a pending activity
///
/// Ordering and hashing consider all three components, so identities from
/// different processes or id families never collide.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RawActivityId {
    /// Process in which the activity lives
    process_id: u32,

    /// Id family
    kind: IdKind,

    /// Provider-supplied correlation number
    correlation: u64,
}
//
impl RawActivityId {
    /// Number of bits of the packed encoding used by the correlation number
    const CORRELATION_BITS: u32 = 44;

    /// Build an identity from its components
    pub fn new(process_id: u32, kind: IdKind, correlation: u64) -> Self {
        Self {
            process_id,
            kind,
            correlation,
        }
    }

    /// Build an identity for a correlation number found in some event
    pub fn for_event(event: &TraceEvent, kind: IdKind, correlation: u64) -> Self {
        Self::new(event.process_id, kind, correlation)
    }

    /// Process in which the activity lives
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Id family
    pub fn kind(&self) -> IdKind {
        self.kind
    }

    /// Provider-supplied correlation number
    pub fn correlation(&self) -> u64 {
        self.correlation
    }

    /// Pack this identity into a single 64-bit number
    ///
    /// The low 16 bits of the process id go to the top bits, followed by 4
    /// bits of id family and 44 bits of correlation number. Wider correlation
    /// numbers (pointers) have their high bits folded into the low ones, so
    /// this encoding is deterministic but not injective. Use the structure
    /// itself as a map key.
    pub fn encode(&self) -> u64 {
        let correlation_mask = (1u64 << Self::CORRELATION_BITS) - 1;
        let folded = (self.correlation ^ (self.correlation >> Self::CORRELATION_BITS))
            & correlation_mask;
        (u64::from(self.process_id & 0xFFFF) << 48)
            | (u64::from(self.kind as u8) << Self::CORRELATION_BITS)
            | folded
    }
}
//
impl Display for RawActivityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let kind: &'static str = self.kind.into();
        write!(
            f,
            "{kind} {:#x} in process {}",
            self.correlation, self.process_id
        )
    }
}
