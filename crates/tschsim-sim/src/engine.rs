//! The discrete-event queue.
//!
//! Events are plain data: an [`EventKind`] dispatched by the simulation
//! loop, keyed by `(asn, priority, seq)`. The sequence number preserves
//! FIFO order among events with equal `(asn, priority)`, which the
//! determinism contract requires. The kind itself doubles as the
//! uniqueness tag: scheduling a kind that is already pending replaces the
//! pending occurrence. Cancellation is lazy — stale heap entries are
//! skipped on pop — so the event currently being executed can never be
//! cancelled out from under the loop.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use tschsim_common::{Asn, MoteId};

/// What an event does when it fires. Smaller priority runs earlier
/// within one ASN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A mote activates its cells at this slot.
    CellActivation(MoteId),
    /// The propagation engine resolves this slot's transmissions.
    Propagate,
    /// A mote's application emits a data packet.
    AppPacket(MoteId),
    /// A mote broadcasts its routing beacon.
    Dio(MoteId),
    /// A mote's OTF controller re-sizes its bundles.
    OtfHousekeeping(MoteId),
    /// A mote's 6top layer inspects cell health.
    SixtopHousekeeping(MoteId),
    /// The per-cycle statistics snapshot.
    CycleStats,
    /// End of the run.
    EndOfRun,
}

impl EventKind {
    /// Dispatch priority within one ASN.
    pub fn priority(self) -> u8 {
        match self {
            EventKind::CellActivation(_) => 0,
            EventKind::Propagate => 1,
            EventKind::AppPacket(_) => 2,
            EventKind::Dio(_) => 3,
            EventKind::OtfHousekeeping(_) => 4,
            EventKind::SixtopHousekeeping(_) => 5,
            EventKind::CycleStats => 6,
            EventKind::EndOfRun => 7,
        }
    }
}

/// A fired event, as handed to the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The slot at which the event fires.
    pub asn: Asn,
    /// What to do.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedEvent {
    asn: Asn,
    priority: u8,
    seq: u64,
    kind: EventKind,
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.asn, self.priority, self.seq).cmp(&(other.asn, other.priority, other.seq))
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered event container.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    // Tag -> seq of the one live occurrence. Heap entries whose seq no
    // longer matches are stale and skipped on pop.
    pending: HashMap<EventKind, u64>,
    next_seq: u64,
}

impl EventQueue {
    /// An empty queue.
    pub fn new() -> Self {
        EventQueue::default()
    }

    /// Schedule `kind` at `asn`, replacing any pending occurrence of the
    /// same kind.
    pub fn schedule_at(&mut self, asn: Asn, kind: EventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(kind, seq);
        self.heap.push(Reverse(QueuedEvent {
            asn,
            priority: kind.priority(),
            seq,
            kind,
        }));
    }

    /// Drop any pending occurrence of `kind`. The currently executing
    /// event is unaffected (it has already been popped).
    pub fn cancel(&mut self, kind: EventKind) {
        self.pending.remove(&kind);
    }

    /// Whether `kind` has a pending occurrence.
    pub fn is_pending(&self, kind: EventKind) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Pop the next live event in `(asn, priority, seq)` order.
    pub fn pop(&mut self) -> Option<Event> {
        while let Some(Reverse(queued)) = self.heap.pop() {
            match self.pending.get(&queued.kind) {
                Some(&live_seq) if live_seq == queued.seq => {
                    self.pending.remove(&queued.kind);
                    return Some(Event {
                        asn: queued.asn,
                        kind: queued.kind,
                    });
                }
                // Replaced or cancelled since it was pushed.
                _ => continue,
            }
        }
        None
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no live events remain.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
