//! Backpressure coordination (spec §4.8, §3 "Backpressure sub-state").
//!
//! Independent of session state: a non-writable channel on one side
//! blocks reads on the other, so its write buffer cannot grow further
//! from that side's traffic. Edge-triggered — `block`/`unblock` are
//! only emitted on a genuine writable/unwritable transition, never
//! repeated, matching invariant I6 (`clientReadsBlocked` is true iff
//! autoread was last set to false).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadGate {
    Block,
    Unblock,
}

#[derive(Debug, Default)]
pub struct Backpressure {
    client_reads_blocked: bool,
    server_reads_blocked: bool,
}

impl Backpressure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_reads_blocked(&self) -> bool {
        self.client_reads_blocked
    }

    pub fn server_reads_blocked(&self) -> bool {
        self.server_reads_blocked
    }

    /// The server (upstream) channel's writability changed. A
    /// writable->unwritable edge blocks client reads; the reverse
    /// unblocks them. Returns `None` if this isn't an edge (repeated
    /// writability events with no change in gate state).
    pub fn on_server_writability_changed(&mut self, writable: bool) -> Option<ReadGate> {
        edge(&mut self.client_reads_blocked, writable)
    }

    /// The client (downstream) channel's writability changed,
    /// analogously gating server reads.
    pub fn on_client_writability_changed(&mut self, writable: bool) -> Option<ReadGate> {
        edge(&mut self.server_reads_blocked, writable)
    }
}

fn edge(blocked: &mut bool, writable: bool) -> Option<ReadGate> {
    let should_block = !writable;
    if should_block == *blocked {
        return None;
    }
    *blocked = should_block;
    Some(if should_block {
        ReadGate::Block
    } else {
        ReadGate::Unblock
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_writability_events_do_not_re_trigger() {
        let mut bp = Backpressure::new();
        assert_eq!(
            bp.on_server_writability_changed(false),
            Some(ReadGate::Block)
        );
        assert_eq!(bp.on_server_writability_changed(false), None);
        assert_eq!(
            bp.on_server_writability_changed(true),
            Some(ReadGate::Unblock)
        );
        assert_eq!(bp.on_server_writability_changed(true), None);
    }

    #[test]
    fn client_and_server_gates_are_independent() {
        let mut bp = Backpressure::new();
        bp.on_server_writability_changed(false);
        assert!(bp.client_reads_blocked());
        assert!(!bp.server_reads_blocked());
        bp.on_client_writability_changed(false);
        assert!(bp.server_reads_blocked());
    }
}
