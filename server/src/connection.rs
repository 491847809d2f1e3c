//! Per-connection state.
//!
//! A connection is split into two halves. [`Connection`] is private to the
//! owning I/O thread: the transport, the inbound decode slot, the encoded
//! write buffer, and the interest/readiness masks. [`ConnShared`] is the
//! cross-thread half — packet queues, lifecycle flags, the sticky error —
//! and is only ever touched under the owning thread's lock.

use crate::error::Error;
use crate::transport::{Events, Transport};
use bytes::BytesMut;
use protocol_gearman::Packet;
use std::collections::VecDeque;

/// Opaque connection identifier.
///
/// Packs the owning thread index, a generation counter, and the arena slot
/// into a `u64`. The generation changes every time a slot is reused, so a
/// handle held across a connection's death is detectable rather than
/// silently landing on the next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn new(thread: usize, slot: usize, generation: u16) -> Self {
        debug_assert!(thread <= u16::MAX as usize);
        debug_assert!(slot <= u32::MAX as usize);
        Self(((thread as u64) << 48) | ((generation as u64) << 32) | slot as u64)
    }

    /// Index of the owning I/O thread.
    #[inline]
    pub fn thread(&self) -> usize {
        (self.0 >> 48) as usize
    }

    /// Arena slot on the owning thread.
    #[inline]
    pub(crate) fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u16 {
        (self.0 >> 32) as u16
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}c{}.{}", self.thread(), self.slot(), self.generation())
    }
}

/// Default capacity of the inbound read buffer.
pub(crate) const READ_BUF_SIZE: usize = 16 * 1024;

/// I/O-thread-private half of a connection.
pub(crate) struct Connection {
    pub(crate) id: ConnId,
    pub(crate) transport: Box<dyn Transport>,
    /// Bytes received but not yet framed into packets.
    pub(crate) read_buf: BytesMut,
    /// Packet under construction from the byte stream; created lazily,
    /// cleared when a complete packet is dispatched.
    pub(crate) inbound: Option<Packet>,
    /// Encoded bytes of the in-flight outbound packet.
    pub(crate) write_buf: BytesMut,
    pub(crate) write_pos: usize,
    /// Outbound packet whose bytes sit in `write_buf`; retained until the
    /// transport accepts the whole packet.
    pub(crate) inflight: Option<Packet>,
    /// Whether `inflight` was the tail of the queue when popped (drives
    /// the transport flush hint).
    pub(crate) inflight_is_tail: bool,
    /// Interest mask currently armed on the transport.
    pub(crate) events: Events,
    /// Readiness reported by the poller, consumed by `run`.
    pub(crate) revents: Events,
}

impl Connection {
    pub(crate) fn new(id: ConnId, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            read_buf: BytesMut::with_capacity(READ_BUF_SIZE),
            inbound: None,
            write_buf: BytesMut::new(),
            write_pos: 0,
            inflight: None,
            inflight_is_tail: false,
            events: Events::READABLE,
            revents: Events::empty(),
        }
    }

    /// True when the encoded in-flight packet has bytes left to send.
    #[inline]
    pub(crate) fn has_pending_write(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }
}

/// Cross-thread half of a connection, guarded by the owning I/O thread's
/// lock.
#[derive(Default)]
pub(crate) struct ConnShared {
    /// Fully formed packets awaiting send, drained in order.
    pub(crate) outbound: VecDeque<Packet>,
    /// Fully formed packets awaiting command execution, drained in order
    /// by the processing thread.
    pub(crate) proc_inbound: VecDeque<Packet>,
    /// Peer is gone or the protocol failed fatally; the processing thread
    /// must release this connection's registrations.
    pub(crate) dead: bool,
    /// The processing thread has finished with the connection; the owning
    /// I/O thread releases it on its next pass.
    pub(crate) free: bool,
    /// Exactly one NOOP is sitting in `outbound`.
    pub(crate) noop_queued: bool,
    pub(crate) in_io_list: bool,
    pub(crate) in_proc_list: bool,
    /// Last executor failure, held until the owning I/O thread observes it.
    pub(crate) last_ret: Option<Error>,
}
