//! Packets carried over cells.

use crate::schedule::ScheduleSnapshot;
use tschsim_common::{Asn, MoteId};

/// Where a transmission is headed.
///
/// Broadcast is a real variant rather than a reserved id, so shared-cell
/// code paths are statically distinguishable from unicast ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// A single neighbor expected to acknowledge.
    Unicast(MoteId),
    /// Every listener in range; never acknowledged.
    Broadcast,
}

/// Application payload. Immutable once created; relays copy it with the
/// hop count bumped, so sender and receiver never share mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPayload {
    /// Originating mote.
    pub source: MoteId,
    /// ASN at which the source emitted the packet.
    pub emitted_asn: Asn,
    /// Hops travelled so far.
    pub hops: u8,
}

impl DataPayload {
    /// The payload a relay forwards: same origin, one more hop.
    pub fn relayed(self) -> Self {
        DataPayload {
            hops: self.hops + 1,
            ..self
        }
    }
}

/// What a packet carries.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketKind {
    /// Application data on its way to the root.
    Data(DataPayload),
    /// A broadcast copy of the sender's full schedule.
    Gossip {
        /// The gossiping mote.
        sender: MoteId,
        /// ASN at which the snapshot was taken.
        asn: Asn,
        /// The sender's schedule at that ASN.
        snapshot: ScheduleSnapshot,
    },
}

/// A queued or in-flight packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Payload.
    pub kind: PacketKind,
    /// MAC retries remaining before the packet is dropped.
    pub retries_left: u8,
    /// ASN at which the packet entered the current hop's queue.
    pub enqueued_asn: Asn,
}

impl Packet {
    /// A fresh data packet emitted at `asn` by `source`.
    pub fn data(source: MoteId, asn: Asn, max_retries: u8) -> Self {
        Packet {
            kind: PacketKind::Data(DataPayload {
                source,
                emitted_asn: asn,
                hops: 0,
            }),
            retries_left: max_retries,
            enqueued_asn: asn,
        }
    }

    /// The relayed copy of a received data payload.
    pub fn relay(payload: DataPayload, asn: Asn, max_retries: u8) -> Self {
        Packet {
            kind: PacketKind::Data(payload.relayed()),
            retries_left: max_retries,
            enqueued_asn: asn,
        }
    }
}
