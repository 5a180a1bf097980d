//! End-to-end UDP ASSOCIATE tests.

mod common;

use common::*;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// Wrap a payload for `dest` in a SOCKS5 UDP request header.
fn udp_request(dest: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x00, 0x00, 0x00];
    match dest {
        SocketAddr::V4(addr) => {
            packet.push(0x01);
            packet.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            packet.push(0x04);
            packet.extend_from_slice(&addr.ip().octets());
        }
    }
    packet.extend_from_slice(&dest.port().to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Split a received SOCKS5 UDP datagram into source address and payload.
fn parse_udp_reply(datagram: &[u8]) -> (SocketAddr, Vec<u8>) {
    assert!(datagram.len() >= 10);
    assert_eq!(&datagram[..3], &[0x00, 0x00, 0x00]);
    assert_eq!(datagram[3], 0x01, "expected an IPv4 source");

    let ip = std::net::Ipv4Addr::new(datagram[4], datagram[5], datagram[6], datagram[7]);
    let port = u16::from_be_bytes([datagram[8], datagram[9]]);
    (
        SocketAddr::new(std::net::IpAddr::V4(ip), port),
        datagram[10..].to_vec(),
    )
}

/// Complete the handshake and UDP ASSOCIATE; returns the control stream
/// and the relay address to send datagrams to.
async fn associate(proxy: SocketAddr) -> (TcpStream, SocketAddr) {
    let mut control = socks5_handshake_no_auth(proxy).await;
    control.write_all(&udp_associate_request()).await.unwrap();

    let (rep, bnd) = read_reply(&mut control).await;
    assert_eq!(rep, 0x00);
    assert!(!bnd.ip().is_unspecified(), "BND must be sendable");
    assert_ne!(bnd.port(), 0);

    (control, bnd)
}

#[tokio::test]
async fn test_udp_associate_echo_round_trip() {
    init_tracing();
    let (proxy, _shutdown) = start_default_server().await;
    let echo = udp_echo_server().await;

    let (_control, relay) = associate(proxy).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&udp_request(echo, b"ping"), relay)
        .await
        .unwrap();

    let mut buf = [0u8; 65535];
    let (len, from) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
        .await
        .expect("no reply datagram")
        .unwrap();

    // replies come from the address advertised in BND
    assert_eq!(from, relay);

    let (source, payload) = parse_udp_reply(&buf[..len]);
    assert_eq!(payload, b"ping");
    assert_eq!(source, echo);
}

#[tokio::test]
async fn test_udp_associate_multiple_datagrams() {
    init_tracing();
    let (proxy, _shutdown) = start_default_server().await;
    let echo = udp_echo_server().await;

    let (_control, relay) = associate(proxy).await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    for i in 0u8..5 {
        let payload = [b'm', b's', b'g', b'0' + i];
        socket
            .send_to(&udp_request(echo, &payload), relay)
            .await
            .unwrap();

        let mut buf = [0u8; 65535];
        let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
            .await
            .expect("no reply datagram")
            .unwrap();
        let (_, received) = parse_udp_reply(&buf[..len]);
        assert_eq!(received, payload);
    }
}

#[tokio::test]
async fn test_udp_fragmented_datagrams_are_dropped() {
    init_tracing();
    let (proxy, _shutdown) = start_default_server().await;
    let echo = udp_echo_server().await;

    let (_control, relay) = associate(proxy).await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // FRAG = 1 must be dropped, never forwarded
    let mut fragmented = udp_request(echo, b"dropped");
    fragmented[2] = 0x01;
    socket.send_to(&fragmented, relay).await.unwrap();

    // a well-formed datagram still goes through afterwards
    socket
        .send_to(&udp_request(echo, b"kept"), relay)
        .await
        .unwrap();

    let mut buf = [0u8; 65535];
    let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
        .await
        .expect("no reply datagram")
        .unwrap();
    let (_, payload) = parse_udp_reply(&buf[..len]);
    assert_eq!(payload, b"kept");
}

#[tokio::test]
async fn test_udp_malformed_datagrams_are_dropped() {
    init_tracing();
    let (proxy, _shutdown) = start_default_server().await;
    let echo = udp_echo_server().await;

    let (_control, relay) = associate(proxy).await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // too short to carry a header
    socket.send_to(&[0x00, 0x00], relay).await.unwrap();
    // nonzero RSV
    let mut bad_rsv = udp_request(echo, b"x");
    bad_rsv[0] = 0x01;
    socket.send_to(&bad_rsv, relay).await.unwrap();

    socket
        .send_to(&udp_request(echo, b"good"), relay)
        .await
        .unwrap();

    let mut buf = [0u8; 65535];
    let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
        .await
        .expect("no reply datagram")
        .unwrap();
    let (_, payload) = parse_udp_reply(&buf[..len]);
    assert_eq!(payload, b"good");
}

#[tokio::test]
async fn test_udp_data_on_control_stream_is_fatal() {
    init_tracing();
    let (proxy, _shutdown) = start_default_server().await;

    let (mut control, _relay) = associate(proxy).await;

    // any bytes on the control stream end the association
    control.write_all(b"bogus").await.unwrap();
    let closed = timeout(Duration::from_secs(3), read_until_close(&mut control))
        .await
        .expect("session survived unexpected control data");
    assert!(closed.is_empty());
}

#[tokio::test]
async fn test_udp_control_eof_ends_association() {
    init_tracing();
    let (proxy, _shutdown) = start_default_server().await;
    let echo = udp_echo_server().await;

    let (control, relay) = associate(proxy).await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // association works while the control stream is open
    socket
        .send_to(&udp_request(echo, b"alive"), relay)
        .await
        .unwrap();
    let mut buf = [0u8; 65535];
    timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
        .await
        .expect("no reply datagram")
        .unwrap();

    // closing the control stream tears the association down
    drop(control);
    tokio::time::sleep(Duration::from_millis(200)).await;

    socket
        .send_to(&udp_request(echo, b"late"), relay)
        .await
        .unwrap();
    match timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await {
        Err(_elapsed) => {}
        Ok(Err(_)) => {}
        Ok(Ok(_)) => panic!("relay still alive after control EOF"),
    }
}
