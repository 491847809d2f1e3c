//! Integration tests for the two shutdown modes.

mod common;

use common::*;
use protocol_gearman::{Command, Packet};
use std::time::Duration;

#[test]
fn test_immediate_shutdown_stops_workers() {
    let (broker, _addr, handle) = start_broker(2);
    broker.shutdown();
    join_within(handle, Duration::from_secs(3));
}

#[test]
fn test_graceful_shutdown_with_no_jobs_stops_promptly() {
    let (broker, addr, handle) = start_broker(1);

    let mut conn = connect(addr);
    write_packet(&mut conn, &Packet::request(Command::EchoReq, &[b"ping"]));
    assert_eq!(read_packet(&mut conn).command, Command::EchoRes);
    drop(conn);

    // No outstanding jobs: graceful behaves like immediate.
    broker.shutdown_graceful();
    join_within(handle, Duration::from_secs(3));
}

#[test]
fn test_graceful_shutdown_drains_outstanding_jobs() {
    let (broker, addr, handle) = start_broker(2);

    let mut worker = connect(addr);
    let mut client = connect(addr);

    write_packet(&mut worker, &Packet::request(Command::CanDo, &[b"slow"]));
    write_packet(
        &mut client,
        &Packet::request(Command::SubmitJobBg, &[b"slow", b"", b"x"]),
    );
    assert_eq!(read_packet(&mut client).command, Command::JobCreated);
    assert_eq!(broker.job_count(), 1);

    broker.shutdown_graceful();

    // The broker keeps serving while the job is outstanding.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!handle.is_finished(), "broker stopped with a job outstanding");
    write_packet(&mut client, &Packet::request(Command::EchoReq, &[b"alive"]));
    assert_eq!(read_packet(&mut client).arg(0), Some(&b"alive"[..]));

    // Worker finishes the job; the drain completes and the broker stops.
    write_packet(&mut worker, &Packet::request(Command::GrabJob, &[]));
    let assign = read_packet(&mut worker);
    assert_eq!(assign.command, Command::JobAssign);
    write_packet(
        &mut worker,
        &Packet::request(Command::WorkComplete, &[assign.arg(0).unwrap(), b""]),
    );

    join_within(handle, Duration::from_secs(3));
    assert_eq!(broker.job_count(), 0);
}
