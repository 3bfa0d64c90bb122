//! Connection state bitmask.
//!
//! The phase bits (`NOT_CONNECTED`, `PROCESSING_CONNECT`, `CONNECTED`) are
//! mutually exclusive. `CLOSED` and `INVALID_CONFIGURATION` are sticky: they
//! are only ever OR-ed in. `READ_THROTTLED` is set and cleared independently.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFlags: u32 {
        const NOT_CONNECTED = 1;
        const PROCESSING_CONNECT = 1 << 1;
        const CONNECTED = 1 << 2;
        const CLOSED = 1 << 3;
        const READ_THROTTLED = 1 << 4;
        const INVALID_CONFIGURATION = 1 << 5;

        const PHASE = Self::NOT_CONNECTED.bits()
            | Self::PROCESSING_CONNECT.bits()
            | Self::CONNECTED.bits();
    }
}

/// State of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    flags: StateFlags,
}

impl ConnectionState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flags: StateFlags::NOT_CONNECTED,
        }
    }

    #[must_use]
    pub fn flags(&self) -> StateFlags {
        self.flags
    }

    /// Move to another phase, keeping every non-phase bit.
    pub fn set_phase(&mut self, phase: StateFlags) {
        debug_assert!(StateFlags::PHASE.contains(phase) && phase.bits().count_ones() == 1);
        self.flags = (self.flags - StateFlags::PHASE) | (phase & StateFlags::PHASE);
    }

    #[must_use]
    pub fn phase(&self) -> StateFlags {
        self.flags & StateFlags::PHASE
    }

    /// Set `CLOSED`. Returns false if it was already set.
    pub fn mark_closed(&mut self) -> bool {
        let first = !self.is_closed();
        self.flags |= StateFlags::CLOSED;
        first
    }

    pub fn mark_invalid_configuration(&mut self) {
        self.flags |= StateFlags::INVALID_CONFIGURATION;
    }

    pub fn set_read_throttled(&mut self, throttled: bool) {
        self.flags.set(StateFlags::READ_THROTTLED, throttled);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.flags.contains(StateFlags::CLOSED)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.flags.contains(StateFlags::CONNECTED)
    }

    #[must_use]
    pub fn is_processing_connect(&self) -> bool {
        self.flags.contains(StateFlags::PROCESSING_CONNECT)
    }

    #[must_use]
    pub fn is_read_throttled(&self) -> bool {
        self.flags.contains(StateFlags::READ_THROTTLED)
    }

    #[must_use]
    pub fn has_invalid_configuration(&self) -> bool {
        self.flags.contains(StateFlags::INVALID_CONFIGURATION)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
