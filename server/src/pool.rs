//! Per-thread packet object pool.
//!
//! Inbound packets are acquired by the I/O thread and released by
//! whichever thread executes the command, so the pool lives behind the
//! owning thread's lock. The pool is bounded: releases past the cap drop
//! the object so a burst does not retain memory forever.

use protocol_gearman::Packet;

pub(crate) struct PacketPool {
    free: Vec<Packet>,
    capacity: usize,
}

impl PacketPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
        }
    }

    /// Take a packet from the pool, or allocate one.
    ///
    /// The returned packet is always in its pristine state.
    pub(crate) fn acquire(&mut self) -> Packet {
        self.free.pop().unwrap_or_default()
    }

    /// Return a packet to the pool.
    pub(crate) fn release(&mut self, mut packet: Packet) {
        if self.free.len() < self.capacity {
            packet.reset();
            self.free.push(packet);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }
}
