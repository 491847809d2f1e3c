//! Server coordinator and processing thread.
//!
//! [`Server`] is a cheaply clonable handle shared by every I/O thread, the
//! processing thread, and the command executor. It owns the I/O-thread
//! registry, the processing thread's lifecycle, the shutdown flags, and
//! the outstanding-job counter that gates graceful shutdown.
//!
//! With one I/O thread there is no processing thread and commands run
//! inline on the I/O thread. Creating the second I/O thread starts the
//! processing thread; dropping back to one joins it. The dispatch path is
//! otherwise identical in both modes.

use crate::connection::ConnId;
use crate::error::Error;
use crate::execute::CommandExecutor;
use crate::metrics::{JOBS_COMPLETED, JOBS_QUEUED};
use crate::thread::{ThreadShared, noop_packet};
use parking_lot::{Condvar, Mutex};
use protocol_gearman::Packet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;

/// Tunable resource limits, applied per I/O thread.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Packets retained in each thread's free pool.
    pub packet_pool_capacity: usize,
    /// Per-connection cap on packets awaiting the processing thread.
    pub proc_backlog: usize,
    /// Size of each thread's scratch receive buffer.
    pub read_buffer_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            packet_pool_capacity: 128,
            proc_backlog: 1024,
            read_buffer_size: 16 * 1024,
        }
    }
}

#[derive(Default)]
struct ProcState {
    wakeup: bool,
    shutdown: bool,
}

struct ProcControl {
    state: Mutex<ProcState>,
    cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ServerInner {
    executor: Box<dyn CommandExecutor>,
    limits: Limits,
    threads: Mutex<Vec<Arc<ThreadShared>>>,
    thread_count: AtomicUsize,
    next_thread_index: AtomicUsize,
    proc: ProcControl,
    shutdown: AtomicBool,
    shutdown_graceful: AtomicBool,
    job_count: AtomicU64,
}

/// Handle to the shared broker state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Build a server around a command executor, with default limits.
    pub fn new(executor: impl CommandExecutor + 'static) -> Server {
        Self::with_limits(executor, Limits::default())
    }

    /// Build a server with explicit resource limits.
    pub fn with_limits(executor: impl CommandExecutor + 'static, limits: Limits) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                executor: Box::new(executor),
                limits,
                threads: Mutex::new(Vec::new()),
                thread_count: AtomicUsize::new(0),
                next_thread_index: AtomicUsize::new(0),
                proc: ProcControl {
                    state: Mutex::new(ProcState::default()),
                    cond: Condvar::new(),
                    handle: Mutex::new(None),
                },
                shutdown: AtomicBool::new(false),
                shutdown_graceful: AtomicBool::new(false),
                job_count: AtomicU64::new(0),
            }),
        }
    }

    /// Number of registered I/O threads.
    pub fn thread_count(&self) -> usize {
        self.inner.thread_count.load(Ordering::SeqCst)
    }

    /// Request an immediate shutdown: every `run` on every I/O thread
    /// returns `Shutdown` from now on. Nothing is drained.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    /// Request a draining shutdown: `run` keeps reporting
    /// `ShutdownGraceful` (and traffic keeps flowing) until the
    /// outstanding-job counter reaches zero.
    pub fn shutdown_graceful(&self) {
        self.inner.shutdown_graceful.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn graceful_requested(&self) -> bool {
        self.inner.shutdown_graceful.load(Ordering::SeqCst)
    }

    /// Record a newly created job. Called by executors.
    pub fn job_created(&self) {
        self.inner.job_count.fetch_add(1, Ordering::SeqCst);
        JOBS_QUEUED.increment();
    }

    /// Record a job leaving the system (completed or failed).
    pub fn job_finished(&self) {
        let prev = self.inner.job_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "job counter underflow");
        JOBS_COMPLETED.increment();
        if prev == 1 && self.graceful_requested() {
            // Last job drained; nudge pollers so they observe Shutdown.
            self.wake_all();
        }
    }

    /// Jobs currently outstanding.
    pub fn job_count(&self) -> u64 {
        self.inner.job_count.load(Ordering::SeqCst)
    }

    /// Append a packet to a connection's outbound queue and mark the
    /// connection for I/O attention on its owning thread.
    ///
    /// Callable from any thread; fails with [`Error::ConnectionGone`] when
    /// the handle is stale.
    pub fn queue_packet(&self, conn: ConnId, packet: Packet) -> Result<(), Error> {
        let thread = self
            .thread_shared(conn.thread())
            .ok_or(Error::ConnectionGone)?;
        {
            let mut guard = thread.queues.lock();
            let q = &mut *guard;
            if q.generations.get(conn.slot()).copied() != Some(conn.generation()) {
                return Err(Error::ConnectionGone);
            }
            let Some(shared) = q.conns.get_mut(conn.slot()) else {
                return Err(Error::ConnectionGone);
            };
            if shared.dead || shared.free {
                return Err(Error::ConnectionGone);
            }
            shared.outbound.push_back(packet);
            if !shared.in_io_list {
                shared.in_io_list = true;
                q.io_list.push_back(conn.slot());
            }
        }
        thread.wake();
        Ok(())
    }

    /// Queue a NOOP wakeup for a (presumably sleeping) worker connection.
    ///
    /// At most one NOOP is outstanding per connection; extra calls while
    /// one is queued are no-ops.
    pub fn queue_noop(&self, conn: ConnId) -> Result<(), Error> {
        let thread = self
            .thread_shared(conn.thread())
            .ok_or(Error::ConnectionGone)?;
        {
            let mut guard = thread.queues.lock();
            let q = &mut *guard;
            if q.generations.get(conn.slot()).copied() != Some(conn.generation()) {
                return Err(Error::ConnectionGone);
            }
            let Some(shared) = q.conns.get_mut(conn.slot()) else {
                return Err(Error::ConnectionGone);
            };
            if shared.dead || shared.free {
                return Err(Error::ConnectionGone);
            }
            if shared.noop_queued {
                return Ok(());
            }
            let packet = noop_packet(&mut q.pool);
            shared.noop_queued = true;
            shared.outbound.push_back(packet);
            if !shared.in_io_list {
                shared.in_io_list = true;
                q.io_list.push_back(conn.slot());
            }
        }
        thread.wake();
        Ok(())
    }

    // --- Executor bridging -------------------------------------------------

    pub(crate) fn execute(&self, conn: ConnId, packet: &Packet) -> Result<(), Error> {
        self.inner.executor.run_command(self, conn, packet)
    }

    pub(crate) fn executor_connection_closed(&self, conn: ConnId) {
        self.inner.executor.connection_closed(self, conn);
    }

    // --- I/O thread registry -----------------------------------------------

    pub(crate) fn register_thread(&self) -> Result<Arc<ThreadShared>, Error> {
        let mut threads = self.inner.threads.lock();
        if threads.len() == 1 {
            // Going multi-threaded; the processing thread takes over
            // command dispatch.
            self.proc_start()?;
        }
        let index = self.inner.next_thread_index.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(ThreadShared::new(index, self.inner.limits.clone()));
        threads.push(shared.clone());
        self.inner.thread_count.store(threads.len(), Ordering::SeqCst);
        Ok(shared)
    }

    pub(crate) fn unregister_thread(&self, shared: &Arc<ThreadShared>) {
        let stop_proc = {
            let mut threads = self.inner.threads.lock();
            threads.retain(|t| !Arc::ptr_eq(t, shared));
            self.inner.thread_count.store(threads.len(), Ordering::SeqCst);
            threads.len() == 1
        };
        // Joining outside the registry lock; the processing thread takes
        // that lock on every pass.
        if stop_proc {
            self.proc_kill();
        }
    }

    fn thread_shared(&self, index: usize) -> Option<Arc<ThreadShared>> {
        self.inner
            .threads
            .lock()
            .iter()
            .find(|t| t.index == index)
            .cloned()
    }

    fn wake_all(&self) {
        let threads: Vec<Arc<ThreadShared>> = self.inner.threads.lock().clone();
        for thread in threads {
            thread.wake();
        }
    }

    // --- Processing thread -------------------------------------------------

    /// Wake the processing thread; a spurious signal is harmless (an empty
    /// pass is a no-op).
    pub(crate) fn signal_proc(&self) {
        let mut state = self.inner.proc.state.lock();
        state.wakeup = true;
        self.inner.proc.cond.notify_one();
    }

    pub(crate) fn proc_running(&self) -> bool {
        self.inner.proc.handle.lock().is_some()
    }

    fn proc_start(&self) -> Result<(), Error> {
        let mut handle = self.inner.proc.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        {
            let mut state = self.inner.proc.state.lock();
            state.shutdown = false;
            state.wakeup = false;
        }
        let server = self.clone();
        let joined = std::thread::Builder::new()
            .name("processing".to_string())
            .spawn(move || server.proc_loop())
            .map_err(Error::ThreadSetup)?;
        *handle = Some(joined);
        tracing::debug!("processing thread started");
        Ok(())
    }

    fn proc_kill(&self) {
        let Some(handle) = self.inner.proc.handle.lock().take() else {
            return;
        };
        {
            let mut state = self.inner.proc.state.lock();
            state.shutdown = true;
            self.inner.proc.cond.notify_one();
        }
        let _ = handle.join();
        tracing::debug!("processing thread stopped");
    }

    fn proc_loop(&self) {
        loop {
            {
                let mut state = self.inner.proc.state.lock();
                while !state.wakeup {
                    if state.shutdown {
                        return;
                    }
                    self.inner.proc.cond.wait(&mut state);
                }
                state.wakeup = false;
            }

            let threads: Vec<Arc<ThreadShared>> = self.inner.threads.lock().clone();
            for thread in threads {
                self.drain_proc_list(&thread);
            }
        }
    }

    /// Service every connection on one thread's processing list.
    fn drain_proc_list(&self, thread: &Arc<ThreadShared>) {
        enum Work {
            Dead,
            Packets(std::collections::VecDeque<Packet>),
        }

        loop {
            let (slot, id, work) = {
                let mut guard = thread.queues.lock();
                let q = &mut *guard;
                let Some(slot) = q.proc_list.pop_front() else {
                    break;
                };
                let generation = q.generations.get(slot).copied().unwrap_or(0);
                let Some(shared) = q.conns.get_mut(slot) else {
                    continue;
                };
                shared.in_proc_list = false;
                let id = ConnId::new(thread.index, slot, generation);
                if shared.free {
                    // Already handed back to the I/O thread.
                    continue;
                }
                if shared.dead {
                    (slot, id, Work::Dead)
                } else {
                    (slot, id, Work::Packets(std::mem::take(&mut shared.proc_inbound)))
                }
            };

            match work {
                Work::Dead => {
                    // Release worker/client registrations, then hand the
                    // connection back to its I/O thread for the final
                    // release.
                    self.inner.executor.connection_closed(self, id);
                    {
                        let mut guard = thread.queues.lock();
                        let q = &mut *guard;
                        if let Some(shared) = q.conns.get_mut(slot) {
                            shared.free = true;
                            while let Some(packet) = shared.proc_inbound.pop_front() {
                                q.pool.release(packet);
                            }
                            while let Some(packet) = shared.outbound.pop_front() {
                                q.pool.release(packet);
                            }
                            if !shared.in_io_list {
                                shared.in_io_list = true;
                                q.io_list.push_back(slot);
                            }
                        }
                    }
                    thread.wake();
                }
                Work::Packets(packets) => {
                    let mut failed = None;
                    for packet in packets {
                        if let Err(error) = self.inner.executor.run_command(self, id, &packet) {
                            // Keep draining; the last failure wins and is
                            // surfaced on the connection's next I/O pass.
                            failed = Some(error);
                        }
                        thread.queues.lock().pool.release(packet);
                    }
                    if let Some(error) = failed {
                        {
                            let mut guard = thread.queues.lock();
                            let q = &mut *guard;
                            if let Some(shared) = q.conns.get_mut(slot) {
                                shared.last_ret = Some(error);
                                if !shared.in_io_list {
                                    shared.in_io_list = true;
                                    q.io_list.push_back(slot);
                                }
                            }
                        }
                        thread.wake();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_gearman::Command;

    struct NullExecutor;

    impl CommandExecutor for NullExecutor {
        fn run_command(
            &self,
            _server: &Server,
            _conn: ConnId,
            _packet: &Packet,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn test_queue_packet_to_unknown_connection() {
        let server = Server::new(NullExecutor);
        let bogus = ConnId::new(0, 0, 0);
        assert!(matches!(
            server.queue_packet(bogus, Packet::response(Command::Noop, &[])),
            Err(Error::ConnectionGone)
        ));
        assert!(matches!(
            server.queue_noop(bogus),
            Err(Error::ConnectionGone)
        ));
    }

    #[test]
    fn test_job_counter() {
        let server = Server::new(NullExecutor);
        assert_eq!(server.job_count(), 0);
        server.job_created();
        server.job_created();
        assert_eq!(server.job_count(), 2);
        server.job_finished();
        assert_eq!(server.job_count(), 1);
    }

    #[test]
    fn test_signal_without_proc_thread_is_harmless() {
        let server = Server::new(NullExecutor);
        server.signal_proc();
        assert!(!server.proc_running());
    }

    #[test]
    fn test_shutdown_flags() {
        let server = Server::new(NullExecutor);
        assert!(!server.shutdown_requested());
        assert!(!server.graceful_requested());
        server.shutdown_graceful();
        assert!(server.graceful_requested());
        server.shutdown();
        assert!(server.shutdown_requested());
    }
}
