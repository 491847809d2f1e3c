//! I/O thread core.
//!
//! An [`IoThread`] owns a set of connections and drives their non-blocking
//! socket I/O. It is driven externally: the embedder calls
//! [`IoThread::run`] whenever its poller reports readiness (or whenever it
//! wants forward progress), after marking ready connections with
//! [`IoThread::mark_ready`].
//!
//! Cross-thread traffic goes through the thread's mailbox
//! ([`ThreadShared`]): one mutex guarding the shared connection halves, the
//! io/proc attention queues, and the packet pool. The processing thread
//! (and the command executor, through [`Server`](crate::server::Server))
//! posts work into the mailbox and fires the thread's run callback; the
//! I/O thread drains the mailbox at the start of every `run`.

use crate::connection::{ConnId, ConnShared, Connection};
use crate::error::{ConnError, Error, RunStatus};
use crate::metrics::{
    CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, PACKETS_RECEIVED, PACKETS_SENT, PROTOCOL_ERRORS,
};
use crate::pool::PacketPool;
use crate::server::{Limits, Server};
use crate::transport::{Events, Transport};
use bytes::Buf;
use parking_lot::Mutex;
use protocol_gearman::{Command, Magic, Packet, ParseError};
use slab::Slab;
use std::collections::VecDeque;
use std::sync::Arc;

type RunCallback = Box<dyn Fn() + Send + Sync>;
type LogCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Cross-thread mailbox of one I/O thread.
pub(crate) struct ThreadShared {
    pub(crate) index: usize,
    pub(crate) limits: Limits,
    pub(crate) queues: Mutex<ThreadQueues>,
    run_fn: Mutex<Option<RunCallback>>,
    log_fn: Mutex<Option<LogCallback>>,
}

/// Everything guarded by the thread lock.
pub(crate) struct ThreadQueues {
    /// Shared halves of this thread's connections, by slot.
    pub(crate) conns: Slab<ConnShared>,
    /// Slot reuse counters; a slot's generation bumps on every release.
    pub(crate) generations: Vec<u16>,
    /// Connections needing I/O attention (flush, error surfacing, release).
    pub(crate) io_list: VecDeque<usize>,
    /// Connections needing processing attention.
    pub(crate) proc_list: VecDeque<usize>,
    pub(crate) pool: PacketPool,
}

impl ThreadShared {
    pub(crate) fn new(index: usize, limits: Limits) -> Self {
        let pool = PacketPool::new(limits.packet_pool_capacity);
        Self {
            index,
            limits,
            queues: Mutex::new(ThreadQueues {
                conns: Slab::new(),
                generations: Vec::new(),
                io_list: VecDeque::new(),
                proc_list: VecDeque::new(),
                pool,
            }),
            run_fn: Mutex::new(None),
            log_fn: Mutex::new(None),
        }
    }

    /// Nudge the embedder to call `run` again soon.
    pub(crate) fn wake(&self) {
        if let Some(f) = &*self.run_fn.lock() {
            f();
        }
    }

    pub(crate) fn log(&self, line: &str) {
        match &*self.log_fn.lock() {
            Some(f) => f(line),
            None => tracing::debug!(thread = self.index, "{line}"),
        }
    }
}

enum IoAction {
    Release,
    Surface(Error),
    Flush,
}

enum FlushOutcome {
    Done,
    WouldBlock,
}

/// State for one I/O thread, driven by an external event loop.
///
/// `run` is non-reentrant and the `IoThread` itself is single-threaded;
/// only its mailbox is shared. The first instance serves alone with
/// commands executed inline; creating a second instance starts the
/// server's processing thread and switches all dispatch to it.
pub struct IoThread {
    server: Server,
    shared: Arc<ThreadShared>,
    /// I/O-side connection records, indexed by the same slots as the
    /// mailbox slab.
    conns: Vec<Option<Connection>>,
    /// Slots the poller reported ready since the last `run`.
    ready: VecDeque<usize>,
    recv_buf: Vec<u8>,
}

impl IoThread {
    /// Create an I/O thread bound to `server`.
    ///
    /// Starting the processing thread happens here when this is the second
    /// thread; a spawn failure is returned as [`Error::ThreadSetup`] and
    /// leaves the server unchanged.
    pub fn new(server: &Server) -> Result<IoThread, Error> {
        let shared = server.register_thread()?;
        let recv_buf = vec![0u8; shared.limits.read_buffer_size];
        Ok(IoThread {
            server: server.clone(),
            shared,
            conns: Vec::new(),
            ready: VecDeque::new(),
            recv_buf,
        })
    }

    /// Index of this thread, as carried in its connections' handles.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Install the wake hook invoked when another thread queues I/O work
    /// here (typically a poll waker).
    pub fn set_run_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.shared.run_fn.lock() = Some(Box::new(f));
    }

    /// Install a log hook; without one, log lines go to `tracing`.
    pub fn set_log_callback(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.log_fn.lock() = Some(Box::new(f));
    }

    /// Number of live connections on this thread.
    pub fn connection_count(&self) -> usize {
        self.conns.iter().filter(|c| c.is_some()).count()
    }

    /// Adopt a transport as a new connection owned by this thread.
    pub fn add_connection(&mut self, mut transport: Box<dyn Transport>) -> Result<ConnId, Error> {
        transport.set_event_mask(Events::READABLE)?;

        let (slot, generation) = {
            let mut guard = self.shared.queues.lock();
            let q = &mut *guard;
            let slot = q.conns.insert(ConnShared::default());
            if slot >= q.generations.len() {
                q.generations.resize(slot + 1, 0);
            }
            (slot, q.generations[slot])
        };

        let id = ConnId::new(self.shared.index, slot, generation);
        if slot >= self.conns.len() {
            self.conns.resize_with(slot + 1, || None);
        }
        self.conns[slot] = Some(Connection::new(id, transport));

        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();
        self.shared.log(&format!("connection {id} added"));
        Ok(id)
    }

    /// Record poller readiness for a connection, to be consumed by the
    /// next `run`.
    pub fn mark_ready(&mut self, id: ConnId, events: Events) {
        if events.is_empty() {
            return;
        }
        let Some(conn) = self
            .conns
            .get_mut(id.slot())
            .and_then(Option::as_mut)
            .filter(|c| c.id == id)
        else {
            return;
        };
        let was_idle = conn.revents.is_empty();
        conn.revents |= events;
        if was_idle {
            self.ready.push_back(id.slot());
        }
    }

    /// Tear a connection down.
    ///
    /// With a processing thread running, the connection is marked dead and
    /// handed to it so worker/client registrations are released first; the
    /// actual release happens on a later `run` here. Single-threaded, the
    /// executor is notified and the connection is released immediately.
    pub fn close_connection(&mut self, id: ConnId) {
        if self.conn_mut(id).is_none() {
            return;
        }
        if self.server.thread_count() > 1 {
            {
                let mut guard = self.shared.queues.lock();
                let q = &mut *guard;
                let Some(shared) = q.conns.get_mut(id.slot()) else {
                    return;
                };
                if shared.dead || shared.free {
                    return;
                }
                shared.dead = true;
                if !shared.in_proc_list {
                    shared.in_proc_list = true;
                    q.proc_list.push_back(id.slot());
                }
            }
            self.server.signal_proc();
        } else {
            self.server.executor_connection_closed(id);
            self.release(id.slot());
        }
    }

    /// Drive this thread's connections.
    ///
    /// Invoked by the embedder on poller readiness or to make forward
    /// progress. Per-connection fatal errors are returned as
    /// [`ConnError`]; the embedder is expected to call
    /// [`close_connection`](Self::close_connection) on the offender and
    /// then call `run` again.
    pub fn run(&mut self) -> Result<RunStatus, ConnError> {
        let multi = self.server.thread_count() > 1;
        let mut io_wait = false;

        // Packets queued by the processing thread, error surfacing, and
        // released connections come first.
        if multi {
            self.drain_io_list(&mut io_wait)?;
        }

        // Poller-reported activity.
        while let Some(slot) = self.ready.pop_front() {
            let Some(conn) = self.conns.get_mut(slot).and_then(Option::as_mut) else {
                continue;
            };
            let id = conn.id;
            let revents = std::mem::take(&mut conn.revents);

            if revents.contains(Events::READABLE)
                && let Err(error) = self.read_packets(slot)
            {
                return Err(ConnError::new(id, error));
            }

            if revents.contains(Events::WRITABLE) {
                match self.flush(slot, true) {
                    Ok(FlushOutcome::WouldBlock) => io_wait = true,
                    Ok(FlushOutcome::Done) => {}
                    Err(error) => return Err(ConnError::new(id, error)),
                }
            }
        }

        // Single-threaded, commands ran inline above and may have queued
        // replies on sibling connections; flush them in the same pass.
        if !multi {
            self.drain_io_list(&mut io_wait)?;
        }

        if self.server.shutdown_requested() {
            Ok(RunStatus::Shutdown)
        } else if self.server.graceful_requested() {
            if self.server.job_count() == 0 {
                Ok(RunStatus::Shutdown)
            } else {
                Ok(RunStatus::ShutdownGraceful)
            }
        } else if io_wait {
            Ok(RunStatus::IoWait)
        } else {
            Ok(RunStatus::Ok)
        }
    }

    fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns
            .get_mut(id.slot())
            .and_then(Option::as_mut)
            .filter(|c| c.id == id)
    }

    fn drain_io_list(&mut self, io_wait: &mut bool) -> Result<(), ConnError> {
        loop {
            let (slot, action) = {
                let mut guard = self.shared.queues.lock();
                let q = &mut *guard;
                let Some(slot) = q.io_list.pop_front() else {
                    break;
                };
                let Some(shared) = q.conns.get_mut(slot) else {
                    continue;
                };
                shared.in_io_list = false;
                if shared.free {
                    (slot, IoAction::Release)
                } else if let Some(error) = shared.last_ret.take() {
                    (slot, IoAction::Surface(error))
                } else {
                    (slot, IoAction::Flush)
                }
            };

            let Some(id) = self.conns.get(slot).and_then(Option::as_ref).map(|c| c.id) else {
                continue;
            };

            match action {
                IoAction::Release => self.release(slot),
                IoAction::Surface(error) => return Err(ConnError::new(id, error)),
                IoAction::Flush => match self.flush(slot, false) {
                    Ok(FlushOutcome::WouldBlock) => *io_wait = true,
                    Ok(FlushOutcome::Done) => {}
                    Err(error) => return Err(ConnError::new(id, error)),
                },
            }
        }
        Ok(())
    }

    /// Send queued outbound packets in order.
    ///
    /// A packet leaves the queue only once the transport has accepted all
    /// of its bytes. `writable_now` is set when the poller just reported
    /// writability, which clears a previously armed want-write state.
    fn flush(&mut self, slot: usize, writable_now: bool) -> Result<FlushOutcome, Error> {
        let shared = self.shared.clone();
        let Some(conn) = self.conns.get_mut(slot).and_then(Option::as_mut) else {
            return Ok(FlushOutcome::Done);
        };

        // A previous send returned would-block and the socket has not
        // become writable since; skip the redundant syscall.
        if conn.events.contains(Events::WRITABLE) && !writable_now {
            return Ok(FlushOutcome::WouldBlock);
        }

        loop {
            while conn.has_pending_write() {
                match conn
                    .transport
                    .send(&conn.write_buf[conn.write_pos..], conn.inflight_is_tail)
                {
                    Ok(n) => conn.write_pos += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if !conn.events.contains(Events::WRITABLE) {
                            conn.events = Events::READABLE | Events::WRITABLE;
                            conn.transport.set_event_mask(conn.events)?;
                        }
                        return Ok(FlushOutcome::WouldBlock);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(Error::Transport(e)),
                }
            }

            // The in-flight packet is fully on the wire.
            if let Some(packet) = conn.inflight.take() {
                let was_noop = packet.command == Command::Noop;
                let mut guard = shared.queues.lock();
                let q = &mut *guard;
                if was_noop && let Some(cs) = q.conns.get_mut(slot) {
                    cs.noop_queued = false;
                }
                q.pool.release(packet);
                drop(guard);
                PACKETS_SENT.increment();
            }
            conn.write_buf.clear();
            conn.write_pos = 0;

            let next = {
                let mut guard = shared.queues.lock();
                let q = &mut *guard;
                match q.conns.get_mut(slot) {
                    Some(cs) => {
                        let packet = cs.outbound.pop_front();
                        let is_tail = cs.outbound.is_empty();
                        packet.map(|p| (p, is_tail))
                    }
                    None => None,
                }
            };

            match next {
                Some((packet, is_tail)) => {
                    packet.encode(&mut conn.write_buf);
                    conn.inflight = Some(packet);
                    conn.inflight_is_tail = is_tail;
                }
                None => {
                    // Queue drained; drop back to read-only interest.
                    if conn.events.contains(Events::WRITABLE) || writable_now {
                        conn.events = Events::READABLE;
                        conn.transport.set_event_mask(conn.events)?;
                    }
                    return Ok(FlushOutcome::Done);
                }
            }
        }
    }

    /// Decode packets from the byte stream until the transport would
    /// block, dispatching each complete packet inline (single-threaded) or
    /// to the processing thread.
    fn read_packets(&mut self, slot: usize) -> Result<(), Error> {
        let shared = self.shared.clone();
        let server = self.server.clone();
        let multi = server.thread_count() > 1;
        let Some(conn) = self.conns.get_mut(slot).and_then(Option::as_mut) else {
            return Ok(());
        };
        let id = conn.id;

        loop {
            // Frame whatever is buffered.
            loop {
                if conn.inbound.is_none() {
                    let mut guard = shared.queues.lock();
                    let q = &mut *guard;
                    if multi
                        && let Some(cs) = q.conns.get(slot)
                        && cs.proc_inbound.len() >= shared.limits.proc_backlog
                    {
                        return Err(Error::Backlog(cs.proc_inbound.len()));
                    }
                    conn.inbound = Some(q.pool.acquire());
                }

                let mut packet = conn.inbound.take().expect("inbound slot just filled");
                match packet.parse_from(&conn.read_buf) {
                    Ok(consumed) => {
                        conn.read_buf.advance(consumed);
                        PACKETS_RECEIVED.increment();
                        if multi {
                            {
                                let mut guard = shared.queues.lock();
                                let q = &mut *guard;
                                match q.conns.get_mut(slot) {
                                    // A connection on its way out never
                                    // goes back on the processing list.
                                    Some(cs) if !cs.dead && !cs.free => {
                                        cs.proc_inbound.push_back(packet);
                                        if !cs.in_proc_list {
                                            cs.in_proc_list = true;
                                            q.proc_list.push_back(slot);
                                        }
                                    }
                                    _ => q.pool.release(packet),
                                }
                            }
                            server.signal_proc();
                        } else {
                            let result = server.execute(id, &packet);
                            shared.queues.lock().pool.release(packet);
                            result?;
                        }
                    }
                    Err(ParseError::Incomplete) => {
                        conn.inbound = Some(packet);
                        break;
                    }
                    Err(e) => {
                        PROTOCOL_ERRORS.increment();
                        return Err(Error::Protocol(e));
                    }
                }
            }

            match conn.transport.recv(&mut self.recv_buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => conn.read_buf.extend_from_slice(&self.recv_buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    /// Final lifecycle step: close the transport, recycle queued packets,
    /// and bump the slot generation so stale handles miss.
    fn release(&mut self, slot: usize) {
        let Some(conn) = self.conns.get_mut(slot).and_then(Option::take) else {
            return;
        };
        let id = conn.id;

        {
            let mut guard = self.shared.queues.lock();
            let q = &mut *guard;
            if q.conns.contains(slot) {
                let shared = q.conns.remove(slot);
                for packet in shared.outbound {
                    q.pool.release(packet);
                }
                for packet in shared.proc_inbound {
                    q.pool.release(packet);
                }
            }
            if let Some(g) = q.generations.get_mut(slot) {
                *g = g.wrapping_add(1);
            }
            q.io_list.retain(|&s| s != slot);
            q.proc_list.retain(|&s| s != slot);
            if let Some(packet) = conn.inbound {
                q.pool.release(packet);
            }
            if let Some(packet) = conn.inflight {
                q.pool.release(packet);
            }
        }

        CONNECTIONS_ACTIVE.decrement();
        self.shared.log(&format!("connection {id} released"));
        // Dropping the transport closes the socket.
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        let live: Vec<usize> = self
            .conns
            .iter()
            .enumerate()
            .filter_map(|(slot, c)| c.as_ref().map(|_| slot))
            .collect();
        for slot in live {
            self.release(slot);
        }
        self.server.unregister_thread(&self.shared);
    }
}

// Re-exported for executors building wakeup packets.
pub(crate) fn noop_packet(pool: &mut PacketPool) -> Packet {
    let mut packet = pool.acquire();
    packet.magic = Magic::Response;
    packet.command = Command::Noop;
    packet
}
