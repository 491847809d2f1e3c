//! End-to-end protocol tests over real TCP sockets.

mod common;

use common::*;
use protocol_gearman::{Command, Packet};
use std::time::Duration;

#[test]
fn test_echo_single_thread() {
    let (broker, addr, handle) = start_broker(1);

    let mut conn = connect(addr);
    write_packet(&mut conn, &Packet::request(Command::EchoReq, &[b"hello"]));
    let reply = read_packet(&mut conn);
    assert_eq!(reply.command, Command::EchoRes);
    assert_eq!(reply.arg(0), Some(&b"hello"[..]));

    drop(conn);
    broker.shutdown();
    join_within(handle, Duration::from_secs(3));
}

#[test]
fn test_echo_multi_thread() {
    let (broker, addr, handle) = start_broker(2);

    // Several connections so both workers see traffic.
    for i in 0..4u8 {
        let mut conn = connect(addr);
        let payload = vec![i; 32];
        write_packet(&mut conn, &Packet::request(Command::EchoReq, &[&payload]));
        let reply = read_packet(&mut conn);
        assert_eq!(reply.command, Command::EchoRes);
        assert_eq!(reply.arg(0), Some(&payload[..]));
    }

    broker.shutdown();
    join_within(handle, Duration::from_secs(3));
}

#[test]
fn test_pipelined_echoes_preserve_order() {
    let (broker, addr, handle) = start_broker(2);

    let mut conn = connect(addr);
    let mut batch = bytes::BytesMut::new();
    for i in 0..10u32 {
        Packet::request(Command::EchoReq, &[i.to_string().as_bytes()]).encode(&mut batch);
    }
    use std::io::Write;
    conn.write_all(&batch).unwrap();

    for i in 0..10u32 {
        let reply = read_packet(&mut conn);
        assert_eq!(reply.command, Command::EchoRes);
        assert_eq!(reply.arg(0), Some(i.to_string().as_bytes()));
    }

    broker.shutdown();
    join_within(handle, Duration::from_secs(3));
}

#[test]
fn test_submit_grab_complete_over_tcp() {
    let (broker, addr, handle) = start_broker(2);

    let mut worker = connect(addr);
    let mut client = connect(addr);

    // Worker announces a function and goes to sleep.
    write_packet(&mut worker, &Packet::request(Command::CanDo, &[b"upper"]));
    write_packet(&mut worker, &Packet::request(Command::GrabJob, &[]));
    assert_eq!(read_packet(&mut worker).command, Command::NoJob);
    write_packet(&mut worker, &Packet::request(Command::PreSleep, &[]));

    // Client submits a foreground job.
    write_packet(
        &mut client,
        &Packet::request(Command::SubmitJob, &[b"upper", b"", b"payload"]),
    );
    let created = read_packet(&mut client);
    assert_eq!(created.command, Command::JobCreated);
    let job_handle = created.arg(0).unwrap().to_vec();
    assert_eq!(broker.job_count(), 1);

    // The sleeping worker gets a NOOP nudge, grabs, and completes.
    assert_eq!(read_packet(&mut worker).command, Command::Noop);
    write_packet(&mut worker, &Packet::request(Command::GrabJob, &[]));
    let assign = read_packet(&mut worker);
    assert_eq!(assign.command, Command::JobAssign);
    assert_eq!(assign.arg(0), Some(&job_handle[..]));
    assert_eq!(assign.arg(1), Some(&b"upper"[..]));
    assert_eq!(assign.arg(2), Some(&b"payload"[..]));

    write_packet(
        &mut worker,
        &Packet::request(Command::WorkComplete, &[&job_handle, b"PAYLOAD"]),
    );

    // Result is relayed to the submitting client.
    let done = read_packet(&mut client);
    assert_eq!(done.command, Command::WorkComplete);
    assert_eq!(done.arg(0), Some(&job_handle[..]));
    assert_eq!(done.arg(1), Some(&b"PAYLOAD"[..]));
    assert_eq!(broker.job_count(), 0);

    broker.shutdown();
    join_within(handle, Duration::from_secs(3));
}

#[test]
fn test_garbage_connection_is_dropped_without_harming_others() {
    let (broker, addr, handle) = start_broker(1);

    use std::io::{Read, Write};
    let mut bad = connect(addr);
    bad.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    // The broker drops the connection; the peer observes EOF.
    let mut buf = [0u8; 16];
    match bad.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from broker"),
        Err(e) => panic!("expected clean close, got {e}"),
    }

    // A well-behaved connection still works afterwards.
    let mut good = connect(addr);
    write_packet(&mut good, &Packet::request(Command::EchoReq, &[b"still up"]));
    assert_eq!(read_packet(&mut good).arg(0), Some(&b"still up"[..]));

    broker.shutdown();
    join_within(handle, Duration::from_secs(3));
}
