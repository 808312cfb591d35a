//! Readiness bookkeeping fed by printer notifications.

use bitflags::bitflags;
use log::debug;

use crate::t02::StatusEvent;

bitflags! {
    /// Everything currently keeping the printer from accepting a job.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct NotReadyReason: u8 {
        const NO_PAPER = 1 << 0;
        const COVER_OPEN = 1 << 1;
        const OVERHEATED = 1 << 2;
    }
}

/// What a single notification did to the tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Update {
    /// This was the first frame the printer ever sent on this connection.
    pub first_contact: bool,
    pub flags_changed: bool,
    pub print_complete: bool,
}

/// There is no "ready" opcode: the first notification of any kind is taken as
/// the printer being alive. That is a heuristic the firmware happens to satisfy,
/// not an acknowledgment.
#[derive(Debug, Default, Clone)]
pub struct StatusTracker {
    flags: NotReadyReason,
    contacted: bool,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> NotReadyReason {
        self.flags
    }

    pub fn contacted(&self) -> bool {
        self.contacted
    }

    pub fn is_ready(&self) -> bool {
        self.contacted && self.flags.is_empty()
    }

    /// Parse and apply a raw frame. Frames under 3 bytes are dropped.
    pub fn feed(&mut self, frame: &[u8]) -> Option<(StatusEvent, Update)> {
        let event = StatusEvent::parse(frame)?;
        Some((event, self.apply(event)))
    }

    pub fn apply(&mut self, event: StatusEvent) -> Update {
        let before = self.flags;
        let mut update = Update {
            first_contact: !self.contacted,
            ..Update::default()
        };
        self.contacted = true;

        match event {
            StatusEvent::Overheated => self.flags.insert(NotReadyReason::OVERHEATED),
            StatusEvent::TemperatureNormal => self.flags.remove(NotReadyReason::OVERHEATED),
            StatusEvent::CoverOpen => self.flags.insert(NotReadyReason::COVER_OPEN),
            StatusEvent::CoverClosed => self.flags.remove(NotReadyReason::COVER_OPEN),
            StatusEvent::NoPaper => self.flags.insert(NotReadyReason::NO_PAPER),
            StatusEvent::PaperPresent => self.flags.remove(NotReadyReason::NO_PAPER),
            StatusEvent::CancelAcknowledged => {}
            StatusEvent::PrintComplete => update.print_complete = true,
            StatusEvent::Unrecognized(a, b) => {
                if !update.first_contact {
                    debug!("ignoring unrecognized status {:#04x} {:#04x}", a, b);
                }
            }
        }

        update.flags_changed = before != self.flags;
        update
    }

    /// Forget everything; used when the link drops.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
