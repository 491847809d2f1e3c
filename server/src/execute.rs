//! Command execution - bridges decoded packets to the shared job tables.
//!
//! The broker core is generic over a [`CommandExecutor`]; the
//! [`JobQueueExecutor`] here is the in-memory reference implementation.
//! In multi-threaded servers only the processing thread calls into it, so
//! its internal lock is effectively uncontended; single-threaded servers
//! call it inline on the I/O thread.

use crate::connection::ConnId;
use crate::error::Error;
use crate::server::Server;
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::Mutex;
use protocol_gearman::{Command, Packet};
use std::collections::VecDeque;

/// Executes protocol commands against shared server state.
///
/// `run_command` may queue outbound packets on any connection through the
/// [`Server`] handle; the core takes care of marking those connections for
/// I/O attention on their owning threads.
pub trait CommandExecutor: Send + Sync {
    /// Execute one decoded packet arriving on `conn`.
    ///
    /// An `Err` is fatal for that connection: the core records it and the
    /// embedder tears the connection down.
    fn run_command(&self, server: &Server, conn: ConnId, packet: &Packet) -> Result<(), Error>;

    /// Observe a connection going away; release anything registered to it.
    fn connection_closed(&self, server: &Server, conn: ConnId) {
        let _ = (server, conn);
    }
}

struct WorkerEntry {
    abilities: AHashSet<Bytes>,
    sleeping: bool,
    client_id: Option<Bytes>,
}

impl WorkerEntry {
    fn new() -> Self {
        Self {
            abilities: AHashSet::new(),
            sleeping: false,
            client_id: None,
        }
    }
}

struct Job {
    handle: Bytes,
    function: Bytes,
    data: Bytes,
    /// Submitting client for foreground jobs; `None` once detached or for
    /// background jobs.
    client: Option<ConnId>,
    assigned: Option<ConnId>,
    numerator: Bytes,
    denominator: Bytes,
}

#[derive(Default)]
struct Tables {
    workers: AHashMap<ConnId, WorkerEntry>,
    /// All live jobs by handle.
    jobs: AHashMap<Bytes, Job>,
    /// Unassigned job handles per function, oldest first.
    pending: AHashMap<Bytes, VecDeque<Bytes>>,
    handle_seq: u64,
}

/// In-memory job queue executor.
pub struct JobQueueExecutor {
    tables: Mutex<Tables>,
    handle_prefix: String,
}

impl Default for JobQueueExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueueExecutor {
    pub fn new() -> Self {
        Self::with_handle_prefix("broker")
    }

    /// Use a custom host tag in generated job handles (`H:<tag>:<n>`).
    pub fn with_handle_prefix(prefix: &str) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            handle_prefix: prefix.to_string(),
        }
    }

    fn next_handle(&self, tables: &mut Tables) -> Bytes {
        tables.handle_seq += 1;
        Bytes::from(format!("H:{}:{}", self.handle_prefix, tables.handle_seq))
    }

    /// NOOP every sleeping worker able to run `function`. Duplicate
    /// wakeups are suppressed by the core's per-connection NOOP flag.
    fn wake_workers(server: &Server, tables: &Tables, function: &[u8]) {
        for (id, worker) in &tables.workers {
            if worker.sleeping && worker.abilities.contains(function) {
                // A stale handle here just means the worker died first.
                let _ = server.queue_noop(*id);
            }
        }
    }

    fn submit(
        &self,
        server: &Server,
        conn: ConnId,
        packet: &Packet,
        background: bool,
    ) -> Result<(), Error> {
        let function = Bytes::copy_from_slice(packet.arg(0).unwrap_or(b""));
        let data = Bytes::copy_from_slice(packet.arg(2).unwrap_or(b""));

        let mut tables = self.tables.lock();
        let handle = self.next_handle(&mut tables);
        let job = Job {
            handle: handle.clone(),
            function: function.clone(),
            data,
            client: (!background).then_some(conn),
            assigned: None,
            numerator: Bytes::from_static(b"0"),
            denominator: Bytes::from_static(b"0"),
        };
        tables.jobs.insert(handle.clone(), job);
        tables
            .pending
            .entry(function.clone())
            .or_default()
            .push_back(handle.clone());
        server.job_created();

        server.queue_packet(conn, Packet::response(Command::JobCreated, &[&handle]))?;
        Self::wake_workers(server, &tables, &function);
        tracing::debug!(handle = %String::from_utf8_lossy(&handle), background, "job submitted");
        Ok(())
    }

    fn grab_job(&self, server: &Server, conn: ConnId) -> Result<(), Error> {
        let mut tables = self.tables.lock();
        let tables = &mut *tables;

        let assignment = match tables.workers.get_mut(&conn) {
            Some(worker) => {
                // A worker asking for work is awake, whatever it said
                // earlier.
                worker.sleeping = false;
                worker.abilities.iter().find_map(|function| {
                    let queue = tables.pending.get_mut(function)?;
                    loop {
                        let handle = queue.pop_front()?;
                        // Handles of dead jobs may linger in the queue.
                        if tables.jobs.contains_key(&handle) {
                            return Some(handle);
                        }
                    }
                })
            }
            None => None,
        };

        match assignment {
            Some(handle) => {
                let job = tables.jobs.get_mut(&handle).expect("handle just checked");
                job.assigned = Some(conn);
                let reply = Packet::response(
                    Command::JobAssign,
                    &[&job.handle, &job.function, &job.data],
                );
                server.queue_packet(conn, reply)
            }
            None => server.queue_packet(conn, Packet::response(Command::NoJob, &[])),
        }
    }

    fn work_complete(&self, server: &Server, packet: &Packet) -> Result<(), Error> {
        let handle = packet.arg(0).unwrap_or(b"");
        let Some(job) = self.tables.lock().jobs.remove(handle) else {
            tracing::debug!("completion for unknown job handle, ignoring");
            return Ok(());
        };

        if let Some(client) = job.client {
            let forward = match packet.command {
                Command::WorkComplete => Packet::response(
                    Command::WorkComplete,
                    &[&job.handle, packet.arg(1).unwrap_or(b"")],
                ),
                _ => Packet::response(Command::WorkFail, &[&job.handle]),
            };
            if let Err(Error::ConnectionGone) = server.queue_packet(client, forward) {
                tracing::debug!("client left before its job finished");
            }
        }
        server.job_finished();
        Ok(())
    }

    fn work_status(&self, server: &Server, packet: &Packet) -> Result<(), Error> {
        let handle = packet.arg(0).unwrap_or(b"");
        let numerator = packet.arg(1).unwrap_or(b"0");
        let denominator = packet.arg(2).unwrap_or(b"0");

        let client = {
            let mut tables = self.tables.lock();
            let Some(job) = tables.jobs.get_mut(handle) else {
                return Ok(());
            };
            job.numerator = Bytes::copy_from_slice(numerator);
            job.denominator = Bytes::copy_from_slice(denominator);
            job.client
        };

        if let Some(client) = client {
            let forward =
                Packet::response(Command::WorkStatus, &[handle, numerator, denominator]);
            let _ = server.queue_packet(client, forward);
        }
        Ok(())
    }

    fn get_status(&self, server: &Server, conn: ConnId, packet: &Packet) -> Result<(), Error> {
        let handle = packet.arg(0).unwrap_or(b"");
        let tables = self.tables.lock();
        let reply = match tables.jobs.get(handle) {
            Some(job) => Packet::response(
                Command::StatusRes,
                &[
                    handle,
                    b"1",
                    if job.assigned.is_some() { b"1" } else { b"0" },
                    &job.numerator,
                    &job.denominator,
                ],
            ),
            None => Packet::response(Command::StatusRes, &[handle, b"0", b"0", b"0", b"0"]),
        };
        drop(tables);
        server.queue_packet(conn, reply)
    }

    fn pre_sleep(&self, server: &Server, conn: ConnId) -> Result<(), Error> {
        let has_work = {
            let mut tables = self.tables.lock();
            let tables = &mut *tables;
            let worker = tables.workers.entry(conn).or_insert_with(WorkerEntry::new);
            worker.sleeping = true;

            // Work may have arrived between the last GRAB_JOB and this
            // PRE_SLEEP; wake the worker right back up if so.
            worker.abilities.iter().any(|function| {
                tables
                    .pending
                    .get(function)
                    .is_some_and(|queue| !queue.is_empty())
            })
        };
        if has_work {
            let _ = server.queue_noop(conn);
        }
        Ok(())
    }
}

impl CommandExecutor for JobQueueExecutor {
    fn run_command(&self, server: &Server, conn: ConnId, packet: &Packet) -> Result<(), Error> {
        match packet.command {
            Command::EchoReq => {
                let data = packet.arg(0).unwrap_or(b"");
                server.queue_packet(conn, Packet::response(Command::EchoRes, &[data]))
            }

            Command::CanDo => {
                let function = Bytes::copy_from_slice(packet.arg(0).unwrap_or(b""));
                self.tables
                    .lock()
                    .workers
                    .entry(conn)
                    .or_insert_with(WorkerEntry::new)
                    .abilities
                    .insert(function);
                Ok(())
            }

            Command::CantDo => {
                let function = packet.arg(0).unwrap_or(b"");
                if let Some(worker) = self.tables.lock().workers.get_mut(&conn) {
                    worker.abilities.remove(function);
                }
                Ok(())
            }

            Command::ResetAbilities => {
                if let Some(worker) = self.tables.lock().workers.get_mut(&conn) {
                    worker.abilities.clear();
                }
                Ok(())
            }

            Command::SetClientId => {
                let id = Bytes::copy_from_slice(packet.arg(0).unwrap_or(b""));
                self.tables
                    .lock()
                    .workers
                    .entry(conn)
                    .or_insert_with(WorkerEntry::new)
                    .client_id = Some(id);
                Ok(())
            }

            Command::PreSleep => self.pre_sleep(server, conn),
            Command::GrabJob => self.grab_job(server, conn),

            Command::SubmitJob => self.submit(server, conn, packet, false),
            Command::SubmitJobBg => self.submit(server, conn, packet, true),

            Command::WorkComplete | Command::WorkFail => self.work_complete(server, packet),
            Command::WorkStatus => self.work_status(server, packet),
            Command::GetStatus => self.get_status(server, conn, packet),

            other => {
                // Well-formed but out of place here (for example a reply
                // command sent by a peer). Tell the peer and carry on.
                let text = format!("unexpected {other} packet");
                server.queue_packet(
                    conn,
                    Packet::response(Command::Error, &[b"UNKNOWN_COMMAND", text.as_bytes()]),
                )
            }
        }
    }

    fn connection_closed(&self, server: &Server, conn: ConnId) {
        let mut tables = self.tables.lock();
        let tables = &mut *tables;
        if let Some(worker) = tables.workers.remove(&conn) {
            let name = worker
                .client_id
                .as_deref()
                .map(|id| String::from_utf8_lossy(id).into_owned())
                .unwrap_or_else(|| "-".to_string());
            tracing::debug!(conn = %conn, worker = %name, "worker unregistered");
        }

        // Jobs assigned to a dying worker go back to the head of their
        // function queue; jobs whose client left keep running detached.
        let mut requeued: Vec<Bytes> = Vec::new();
        for job in tables.jobs.values_mut() {
            if job.assigned == Some(conn) {
                job.assigned = None;
                tables
                    .pending
                    .entry(job.function.clone())
                    .or_default()
                    .push_front(job.handle.clone());
                requeued.push(job.function.clone());
            }
            if job.client == Some(conn) {
                job.client = None;
            }
        }
        for function in requeued {
            Self::wake_workers(server, tables, &function);
        }
    }
}
