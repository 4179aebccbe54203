use std::time::Duration;

use crate::TransportKind;

/// Tuning for a [`Mux`](crate::Mux).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    /// Socket kind used for every tag.
    pub transport: TransportKind,
    /// Largest chunk handed out by one read. Datagrams and packets longer
    /// than this are truncated.
    pub read_buffer_size: usize,
    /// How many readiness events one poll can collect.
    pub events_capacity: usize,
    /// Poll timeout used once the work passed to `read_while` has returned.
    pub tail_grace: Duration,
    /// Extra empty polls required after the work returned before the drain
    /// is considered quiescent.
    pub tail_rechecks: u32,
}

impl MuxConfig {
    pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;
    pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
    pub const DEFAULT_TAIL_GRACE: Duration = Duration::from_millis(2);
    pub const DEFAULT_TAIL_RECHECKS: u32 = 1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity.max(1);
        self
    }

    pub fn with_tail_grace(mut self, grace: Duration) -> Self {
        self.tail_grace = grace;
        self
    }

    pub fn with_tail_rechecks(mut self, rechecks: u32) -> Self {
        self.tail_rechecks = rechecks;
        self
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stream,
            read_buffer_size: Self::DEFAULT_READ_BUFFER_SIZE,
            events_capacity: Self::DEFAULT_EVENTS_CAPACITY,
            tail_grace: Self::DEFAULT_TAIL_GRACE,
            tail_rechecks: Self::DEFAULT_TAIL_RECHECKS,
        }
    }
}
