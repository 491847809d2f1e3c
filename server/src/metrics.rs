//! Broker metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections adopted by I/O threads"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "packets_received",
    description = "Total complete packets decoded from the wire"
)]
pub static PACKETS_RECEIVED: Counter = Counter::new();

#[metric(
    name = "packets_sent",
    description = "Total packets fully written to the wire"
)]
pub static PACKETS_SENT: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Total connections dropped for protocol violations"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(name = "jobs_queued", description = "Total jobs accepted")]
pub static JOBS_QUEUED: Counter = Counter::new();

#[metric(
    name = "jobs_completed",
    description = "Total jobs that completed or failed"
)]
pub static JOBS_COMPLETED: Counter = Counter::new();
