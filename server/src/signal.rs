//! Signal handling for shutdown.
//!
//! The first SIGINT/SIGTERM requests a graceful shutdown (serve until the
//! job queue drains); a second forces an immediate shutdown; a third exits
//! the process outright.

use crate::server::Server;

/// Install the shutdown signal handler for `server`.
pub fn install_signal_handler(server: Server) {
    let mut signals = 0u32;

    ctrlc::set_handler(move || {
        signals += 1;
        match signals {
            1 => {
                tracing::info!("shutdown signal received, draining outstanding jobs");
                server.shutdown_graceful();
            }
            2 => {
                tracing::warn!("second signal, shutting down immediately");
                server.shutdown();
            }
            _ => {
                tracing::warn!("third signal, exiting");
                std::process::exit(1);
            }
        }
    })
    .expect("failed to set signal handler");
}
