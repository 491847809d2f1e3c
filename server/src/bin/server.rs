//! Broker binary.

use clap::Parser;
use server::{Config, JobQueueExecutor, Limits, Server};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gearmand")]
#[command(about = "Gearman-compatible job queue broker")]
struct Args {
    /// Path to configuration file (built-in defaults apply when omitted)
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    server::logging::init(&config.logging);

    let limits = Limits {
        packet_pool_capacity: config.connection.packet_pool,
        proc_backlog: config.connection.packet_backlog,
        read_buffer_size: config.connection.read_buffer_size,
    };
    let broker = Server::with_limits(JobQueueExecutor::new(), limits);

    server::signal::install_signal_handler(broker.clone());

    for listener in &config.listener {
        tracing::info!(address = %listener.address, "listening");
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        threads = config.threads(),
        "broker starting"
    );

    if let Err(e) = server::event_loop::run(&config, broker) {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }

    tracing::info!("broker stopped");
}

fn print_default_config() {
    let config = r#"# Broker configuration

[workers]
# Number of I/O threads (default: number of CPUs)
# threads = 4

# CPU cores to pin I/O threads to (Linux-style, e.g., "0-3,6,8")
# cpu_affinity = "0-3"

# Listeners - configure one or more
[[listener]]
address = "0.0.0.0:4730"
backlog = 4096

[connection]
# Scratch receive buffer size per I/O thread
read_buffer_size = 16384

# Packet objects each I/O thread keeps pooled for reuse
packet_pool = 128

# Per-connection cap on packets queued for the processing thread
packet_backlog = 1024

[logging]
# Filter level: "trace", "debug", "info", "warn", or "error"
# The RUST_LOG environment variable takes precedence
level = "info"

# Output format: "pretty", "json", or "compact"
format = "pretty"

timestamps = true
thread_names = true
"#;
    print!("{config}");
}
