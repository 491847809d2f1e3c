//! Shared helpers for integration tests: start a broker over real TCP and
//! exchange packets with it.

use protocol_gearman::Packet;
use server::{Config, JobQueueExecutor, Server};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Get an available port for testing.
pub fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a broker with `threads` I/O threads; returns once it accepts
/// connections.
pub fn start_broker(threads: usize) -> (Server, SocketAddr, JoinHandle<()>) {
    let port = get_available_port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let config: Config = toml::from_str(&format!(
        r#"
        [workers]
        threads = {threads}

        [[listener]]
        address = "127.0.0.1:{port}"
        backlog = 128
        "#
    ))
    .unwrap();
    config.validate().unwrap();

    let broker = Server::new(JobQueueExecutor::new());
    let handle = {
        let broker = broker.clone();
        thread::spawn(move || {
            let _ = server::event_loop::run(&config, broker);
        })
    };

    // Wait for a listener to come up.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(_) => break,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("broker never came up: {e}"),
        }
    }

    (broker, addr, handle)
}

/// Connect a packet-speaking peer.
pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect to broker");
    stream.set_nodelay(true).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

pub fn write_packet(stream: &mut TcpStream, packet: &Packet) {
    let mut buf = bytes::BytesMut::new();
    packet.encode(&mut buf);
    stream.write_all(&buf).expect("write packet");
    stream.flush().unwrap();
}

/// Read exactly one packet, honoring the stream's read timeout.
pub fn read_packet(stream: &mut TcpStream) -> Packet {
    let mut header = [0u8; protocol_gearman::HEADER_LEN];
    stream.read_exact(&mut header).expect("read packet header");

    let body_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut frame = header.to_vec();
    frame.resize(protocol_gearman::HEADER_LEN + body_len, 0);
    stream
        .read_exact(&mut frame[protocol_gearman::HEADER_LEN..])
        .expect("read packet body");

    let (packet, consumed) = Packet::parse(&frame).expect("parse packet");
    assert_eq!(consumed, frame.len());
    packet
}

/// Wait for the broker thread to finish, panicking past `timeout`.
pub fn join_within(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "broker did not stop in time");
        thread::sleep(Duration::from_millis(20));
    }
    handle.join().unwrap();
}
