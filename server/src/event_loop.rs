//! Native poll loop driving the I/O thread core.
//!
//! One OS thread per I/O thread, each with its own `mio::Poll` and its own
//! SO_REUSEPORT listening socket per configured address (the kernel load
//! balances accepts across workers). A `mio::Waker` is wired to the core's
//! run callback so cross-thread work queued by the processing thread
//! interrupts the poll immediately.

use crate::config::Config;
use crate::connection::ConnId;
use crate::error::{Error, RunStatus};
use crate::server::Server;
use crate::thread::IoThread;
use crate::transport::{Events as Readiness, TcpTransport};
use crate::workers::{join_workers, spawn_workers};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Token offset for listeners to avoid collision with connections.
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

/// Run the broker until shutdown completes.
///
/// Binds every configured listener once per worker (SO_REUSEPORT), spawns
/// the workers, and joins them. Bind failures surface here, before any
/// thread starts.
pub fn run(config: &Config, server: Server) -> Result<(), Box<dyn std::error::Error>> {
    let num_workers = config.threads();
    let cpu_affinity = config.cpu_affinity();

    let mut seeds: Vec<Option<Vec<TcpListener>>> = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let mut listeners = Vec::with_capacity(config.listener.len());
        for listener in &config.listener {
            listeners.push(listen_reuseport(listener.address, listener.backlog)?);
        }
        seeds.push(Some(listeners));
    }
    let seeds = Arc::new(Mutex::new(seeds));

    let handles = spawn_workers(num_workers, cpu_affinity.as_deref(), "io", move |worker_id| {
        let listeners = seeds.lock()[worker_id]
            .take()
            .expect("listener seed consumed twice");
        if let Err(e) = run_worker(worker_id, listeners, &server) {
            tracing::error!(worker = worker_id, "worker failed: {e}");
        }
    });

    join_workers(handles);
    Ok(())
}

fn run_worker(worker_id: usize, mut listeners: Vec<TcpListener>, server: &Server) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

    let mut thread = IoThread::new(server).map_err(io::Error::other)?;
    {
        let waker = waker.clone();
        thread.set_run_callback(move || {
            let _ = waker.wake();
        });
    }

    for (i, listener) in listeners.iter_mut().enumerate() {
        poll.registry()
            .register(listener, Token(LISTENER_TOKEN_OFFSET + i), Interest::READABLE)?;
    }

    let mut events = Events::with_capacity(1024);
    let mut conns: HashMap<Token, ConnId> = HashMap::new();
    let mut tokens: HashMap<ConnId, Token> = HashMap::new();
    let mut next_token = 0usize;

    loop {
        // The timeout bounds how stale a shutdown-flag observation can be.
        poll.poll(&mut events, Some(Duration::from_millis(100)))?;

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                // Cross-thread work; the run call below drains it.
                continue;
            }

            if token.0 >= LISTENER_TOKEN_OFFSET {
                let idx = token.0 - LISTENER_TOKEN_OFFSET;
                if idx < listeners.len() {
                    accept_pending(
                        poll.registry(),
                        &listeners[idx],
                        &mut thread,
                        &mut conns,
                        &mut tokens,
                        &mut next_token,
                    );
                }
                continue;
            }

            if let Some(&id) = conns.get(&token) {
                let mut ready = Readiness::empty();
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    // Errors and half-closes are discovered on the read
                    // path.
                    ready |= Readiness::READABLE;
                }
                if event.is_writable() {
                    ready |= Readiness::WRITABLE;
                }
                thread.mark_ready(id, ready);
            }
        }

        // Drive the core; every fatal connection is torn down and the run
        // retried so one bad peer cannot stall the rest.
        loop {
            match thread.run() {
                Ok(RunStatus::Shutdown) => {
                    tracing::info!(worker = worker_id, "worker stopping");
                    return Ok(());
                }
                Ok(_) => break,
                Err(err) => {
                    match &err.error {
                        Error::ConnectionClosed => {
                            tracing::debug!(conn = %err.conn, "peer disconnected");
                        }
                        other => {
                            tracing::warn!(conn = %err.conn, "closing connection: {other}");
                        }
                    }
                    thread.close_connection(err.conn);
                    if let Some(token) = tokens.remove(&err.conn) {
                        conns.remove(&token);
                    }
                }
            }
        }
    }
}

fn accept_pending(
    registry: &Registry,
    listener: &TcpListener,
    thread: &mut IoThread,
    conns: &mut HashMap<Token, ConnId>,
    tokens: &mut HashMap<ConnId, Token>,
    next_token: &mut usize,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                let token = Token(*next_token);
                *next_token += 1;

                if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
                    tracing::warn!("failed to register connection from {addr}: {e}");
                    continue;
                }
                let conn_registry = match registry.try_clone() {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("failed to clone registry: {e}");
                        continue;
                    }
                };

                let transport = TcpTransport::new(stream, conn_registry, token);
                match thread.add_connection(Box::new(transport)) {
                    Ok(id) => {
                        conns.insert(token, id);
                        tokens.insert(id, token);
                        tracing::debug!(conn = %id, peer = %addr, "accepted");
                    }
                    Err(e) => tracing::warn!("failed to adopt connection from {addr}: {e}"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!("accept error: {e}");
                break;
            }
        }
    }
}

/// Bind a non-blocking listener with SO_REUSEPORT so every worker can own
/// one socket per address.
fn listen_reuseport(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();
        let optval: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}
