//! Shared helpers for socksd integration tests.
#![allow(dead_code)]

use socksd::{Authenticator, NoAuth, ProxyServer, ServerConfig};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Once};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A config bound to an ephemeral loopback port.
pub fn localhost_config() -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        ..Default::default()
    }
}

/// Start a proxy server and return its address plus the shutdown handle.
pub async fn start_server(
    cfg: ServerConfig,
    auth: Arc<dyn Authenticator>,
) -> (SocketAddr, broadcast::Sender<()>) {
    let server = ProxyServer::new(cfg, auth);
    let listener = server.bind().await.expect("bind proxy listener");
    let addr = listener.local_addr().expect("proxy local addr");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    tokio::spawn(async move {
        let _ = server.serve(listener, shutdown_rx).await;
    });

    (addr, shutdown_tx)
}

/// Start a no-auth proxy server with default timeouts.
pub async fn start_default_server() -> (SocketAddr, broadcast::Sender<()>) {
    start_server(localhost_config(), Arc::new(NoAuth)).await
}

/// A TCP server that echoes every byte until the peer closes.
pub async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        loop {
                            match stream.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if stream.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// A TCP server that reads everything until EOF, then echoes it back in
/// one burst and closes. Exercises the half-close path.
pub async fn late_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    tokio::spawn(async move {
                        let mut collected = Vec::new();
                        if stream.read_to_end(&mut collected).await.is_ok() {
                            let _ = stream.write_all(&collected).await;
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// A UDP server that echoes every datagram back to its sender.
pub async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let _ = socket.send_to(&buf[..len], from).await;
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Connect and complete the no-auth method negotiation.
pub async fn socks5_handshake_no_auth(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    stream
}

/// Build a CONNECT request for an IP destination.
pub fn connect_request(dest: SocketAddr) -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00];
    encode_dest(&mut req, dest);
    req
}

/// Build a UDP ASSOCIATE request with the customary 0.0.0.0:0 hint.
pub fn udp_associate_request() -> Vec<u8> {
    vec![0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

fn encode_dest(out: &mut Vec<u8>, dest: SocketAddr) {
    match dest {
        SocketAddr::V4(addr) => {
            out.push(0x01);
            out.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            out.push(0x04);
            out.extend_from_slice(&addr.ip().octets());
        }
    }
    out.extend_from_slice(&dest.port().to_be_bytes());
}

/// Read a SOCKS5 reply; returns the REP code and the BND address.
pub async fn read_reply(stream: &mut TcpStream) -> (u8, SocketAddr) {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x05);
    assert_eq!(head[2], 0x00);

    let addr = match head[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await.unwrap();
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3])),
                u16::from_be_bytes([rest[4], rest[5]]),
            )
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await.unwrap();
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                u16::from_be_bytes([rest[16], rest[17]]),
            )
        }
        other => panic!("unexpected ATYPE in reply: {}", other),
    };

    (head[1], addr)
}

/// Full no-auth CONNECT through the proxy; panics unless REP is success.
pub async fn socks5_connect(proxy: SocketAddr, dest: SocketAddr) -> TcpStream {
    let mut stream = socks5_handshake_no_auth(proxy).await;
    stream.write_all(&connect_request(dest)).await.unwrap();
    let (rep, _bnd) = read_reply(&mut stream).await;
    assert_eq!(rep, 0x00);
    stream
}

/// Read until EOF or error; returns everything received.
pub async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}
