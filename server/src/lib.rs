//! Gearman-compatible job queue broker.
//!
//! Clients submit work, workers announce the functions they can execute,
//! and the broker matches, dispatches, tracks, and reports completion.
//! The crate is built around a thread-per-core I/O layer ([`IoThread`])
//! and, in multi-threaded servers, a single processing thread that
//! executes decoded commands against the shared job tables.

pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod execute;
pub mod logging;
pub mod metrics;
mod pool;
pub mod server;
pub mod signal;
pub mod thread;
pub mod transport;
pub mod workers;

pub use config::Config;
pub use connection::ConnId;
pub use error::{ConnError, Error, RunStatus};
pub use execute::{CommandExecutor, JobQueueExecutor};
pub use server::{Limits, Server};
pub use thread::IoThread;
pub use transport::{Events, TcpTransport, Transport};
