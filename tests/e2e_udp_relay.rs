//! UDP flows through the whole runtime.
//!
//! A `UnixDatagram` pair stands in for the TUN device: the test writes raw
//! IPv4/UDP packets into one end and reads the runtime's replies from it,
//! while real loopback sockets play the upstream resolvers.
#![cfg(unix)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::thread;
use std::time::Duration;

use tunrelay::app::Runtime;
use tunrelay::config::parse_config;
use tunrelay::stack::wire::{classify, udp_reply, Inbound};
use tunrelay::stack::FlowKey;

const CLIENT: &str = "198.18.0.2:45000";

fn runtime(yaml: &str) -> (Runtime<mio::net::UnixDatagram>, UnixDatagram) {
    let (ours, theirs) = UnixDatagram::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    theirs.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
    let config = parse_config(yaml).unwrap();
    let runtime = Runtime::new(&config, mio::net::UnixDatagram::from_std(ours)).unwrap();
    (runtime, theirs)
}

/// IPv4/UDP packet from `src` to `dst`, as the client would emit it.
fn client_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    udp_reply(&FlowKey::new(dst, src), payload, 65535).unwrap()
}

/// Turn the runtime until a packet comes out of the device.
fn next_packet(runtime: &mut Runtime<mio::net::UnixDatagram>, tun: &UnixDatagram) -> Vec<u8> {
    let mut buf = vec![0u8; 65535];
    for _ in 0..200 {
        runtime.turn(Some(Duration::from_millis(10))).unwrap();
        if let Ok(n) = tun.recv(&mut buf) {
            buf.truncate(n);
            return buf;
        }
    }
    panic!("runtime produced no packet");
}

fn expect_udp(packet: &[u8], from: SocketAddr, to: SocketAddr) -> Vec<u8> {
    match classify(packet).unwrap() {
        Inbound::Udp { origin, payload } => {
            assert_eq!(origin.key, FlowKey::new(from, to));
            payload.to_vec()
        }
        other => panic!("expected udp, got {:?}", other),
    }
}

#[test]
fn hijacked_udp_dns_goes_to_resolver_and_reply_is_unmodified() {
    let resolver = UdpSocket::bind("127.0.0.1:0").unwrap();
    resolver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let resolver_addr = resolver.local_addr().unwrap();

    let yaml = format!(
        "tunnel:\n  setup: false\ndns:\n  hijack: udp\n  server: {}\n",
        resolver_addr
    );
    let (mut runtime, tun) = runtime(&yaml);

    let client: SocketAddr = CLIENT.parse().unwrap();
    let original: SocketAddr = "8.8.8.8:53".parse().unwrap();
    tun.send(&client_packet(client, original, b"query-bytes")).unwrap();

    let mut buf = [0u8; 512];
    let mut received = None;
    for _ in 0..100 {
        runtime.turn(Some(Duration::from_millis(10))).unwrap();
        resolver.set_nonblocking(true).unwrap();
        if let Ok((n, from)) = resolver.recv_from(&mut buf) {
            received = Some((buf[..n].to_vec(), from));
            break;
        }
    }
    let (query, from) = received.expect("resolver never saw the query");
    assert_eq!(query, b"query-bytes");

    let answer = b"\x00\x01answer\xff\x00";
    resolver.send_to(answer, from).unwrap();

    let packet = next_packet(&mut runtime, &tun);
    // the client sees the reply from the address it originally asked
    let payload = expect_udp(&packet, original, client);
    assert_eq!(payload, answer);
    assert_eq!(runtime.udp_count(), 1);
}

#[test]
fn tcp_hijack_frames_dns_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let resolver_addr = listener.local_addr().unwrap();
    let answer = b"\xab\xcd\x81\x80answer".to_vec();
    let server_answer = answer.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).unwrap();
        let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut query).unwrap();
        assert_eq!(query, b"\xab\xcd\x01\x00query");

        let mut reply = (server_answer.len() as u16).to_be_bytes().to_vec();
        reply.extend_from_slice(&server_answer);
        stream.write_all(&reply).unwrap();
        thread::sleep(Duration::from_millis(300));
    });

    let yaml = format!(
        "tunnel:\n  setup: false\ndns:\n  hijack: tcp\n  server: {}\n",
        resolver_addr
    );
    let (mut runtime, tun) = runtime(&yaml);

    let client: SocketAddr = CLIENT.parse().unwrap();
    let original: SocketAddr = "9.9.9.9:53".parse().unwrap();
    tun.send(&client_packet(client, original, b"\xab\xcd\x01\x00query"))
        .unwrap();

    let packet = next_packet(&mut runtime, &tun);
    assert_eq!(expect_udp(&packet, original, client), answer);
    server.join().unwrap();
}

#[test]
fn flows_are_independent() {
    let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
    let echo_addr = echo.local_addr().unwrap();
    let server = thread::spawn(move || {
        echo.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 256];
        for _ in 0..2 {
            let (n, from) = echo.recv_from(&mut buf).unwrap();
            echo.send_to(&buf[..n], from).unwrap();
        }
    });

    let (mut runtime, tun) = runtime("tunnel:\n  setup: false\n");
    let a: SocketAddr = "198.18.0.2:1111".parse().unwrap();
    let b: SocketAddr = "198.18.0.3:2222".parse().unwrap();
    tun.send(&client_packet(a, echo_addr, b"from-a")).unwrap();
    tun.send(&client_packet(b, echo_addr, b"from-b")).unwrap();

    let replies = [next_packet(&mut runtime, &tun), next_packet(&mut runtime, &tun)];
    let mut seen: Vec<(SocketAddr, Vec<u8>)> = replies
        .iter()
        .map(|p| match classify(p).unwrap() {
            Inbound::Udp { origin, payload } => (origin.key.dst, payload.to_vec()),
            other => panic!("expected udp, got {:?}", other),
        })
        .collect();
    seen.sort_by_key(|(addr, _)| addr.port());
    assert_eq!(seen, vec![(a, b"from-a".to_vec()), (b, b"from-b".to_vec())]);
    assert_eq!(runtime.udp_count(), 2);
    server.join().unwrap();
}
