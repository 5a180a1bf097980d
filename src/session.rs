//! Per-connection proxy session.
//!
//! A session begins in the handshake (method selection, authentication,
//! command) driven off an ingress byte queue, then becomes either a TCP
//! relay (CONNECT) or a UDP association (UDP ASSOCIATE). All fatal
//! conditions surface as [`SessionError`] and tear down this session
//! only.

use crate::addr::Address;
use crate::buffer::ByteQueue;
use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::iochannel::IoChannel;
use crate::socks::auth::{AuthStatus, Authenticator};
use crate::socks::consts::*;
use crate::socks::wire::{self, DestAddr};
use crate::timeout::{SessionId, Wheels};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

/// Everything a session borrows from its server.
pub struct SessionCtx {
    /// Handle into the registry and the timeout wheels
    pub id: SessionId,
    /// Server tunables
    pub cfg: Arc<ServerConfig>,
    /// The configured authenticator
    pub auth: Arc<dyn Authenticator>,
    /// The three timeout axes
    pub wheels: Arc<Wheels>,
}

/// Handshake phases preceding command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Auth,
    Cmd,
}

/// What the handshake resolved to.
enum Handshake {
    Connect(Address),
    UdpAssociate,
}

/// Which relay direction a pump serves, for timeout bookkeeping.
#[derive(Debug, Clone, Copy)]
enum Dir {
    ClientToRemote,
    RemoteToClient,
}

/// Run one session to completion and log the outcome.
pub async fn run_session(ctx: SessionCtx, stream: TcpStream, peer: SocketAddr) {
    match drive(&ctx, stream, peer).await {
        Ok(()) => info!("session {} from {} closed", ctx.id, peer),
        Err(err) => warn!("session {} from {} failed: {}", ctx.id, peer, err),
    }
}

async fn drive(
    ctx: &SessionCtx,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), SessionError> {
    let control_local_ip = stream
        .local_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let (mut rd, wr) = stream.into_split();
    let mut client_chan = IoChannel::new(wr, ctx.cfg.max_write_buffer);
    let mut ingress = ByteQueue::new();

    match handshake(ctx, &mut rd, &mut client_chan, &mut ingress, peer).await? {
        Handshake::Connect(dest) => {
            run_connect(ctx, rd, client_chan, ingress.take(), dest).await
        }
        Handshake::UdpAssociate => run_udp(ctx, rd, client_chan, peer, control_local_ip).await,
    }
}

/// Calls [`Authenticator::end`] exactly once when the session leaves the
/// auth phase, including teardown paths.
struct AuthScope {
    auth: Arc<dyn Authenticator>,
    active: bool,
}

impl AuthScope {
    fn new(auth: Arc<dyn Authenticator>) -> Self {
        AuthScope {
            auth,
            active: false,
        }
    }

    fn enter(&mut self) {
        self.active = true;
    }

    fn finish(&mut self) {
        if self.active {
            self.active = false;
            self.auth.end();
        }
    }
}

impl Drop for AuthScope {
    fn drop(&mut self) {
        if self.active {
            self.auth.end();
        }
    }
}

/// Drive INIT → AUTH → CMD over the ingress queue.
///
/// Input is appended to the queue before processing; the dispatch loop
/// re-enters until the queue is empty or a step needs more bytes.
async fn handshake(
    ctx: &SessionCtx,
    rd: &mut OwnedReadHalf,
    client_chan: &mut IoChannel,
    ingress: &mut ByteQueue,
    peer: SocketAddr,
) -> Result<Handshake, SessionError> {
    let mut phase = Phase::Init;
    let mut auth = AuthScope::new(ctx.auth.clone());
    let mut buf = [0u8; TCP_READ_BUF];

    loop {
        while !ingress.is_empty() {
            match phase {
                Phase::Init => {
                    let (methods, used) = match wire::parse_method_selection(ingress)? {
                        Some(parsed) => parsed,
                        None => break,
                    };
                    ingress.pop(used);

                    let chosen = ctx.auth.begin(&methods);
                    client_chan
                        .send_all(&wire::encode_method_reply(chosen))
                        .await?;
                    if chosen == SOCKS5_METHOD_NOT_ACCEPTABLE {
                        return Err(SessionError::AuthRejected);
                    }
                    debug!("negotiated auth method {:#04x} with {}", chosen, peer);
                    phase = Phase::Auth;
                    auth.enter();
                }
                Phase::Auth => {
                    let mut reply = Vec::new();
                    let status = ctx.auth.step(ingress, &mut reply);
                    if !reply.is_empty() {
                        client_chan.send_all(&reply).await?;
                    }
                    match status? {
                        AuthStatus::Continue => break,
                        AuthStatus::Done => {
                            auth.finish();
                            phase = Phase::Cmd;
                        }
                        AuthStatus::Failed => {
                            auth.finish();
                            return Err(SessionError::AuthFailed);
                        }
                    }
                }
                Phase::Cmd => {
                    let (command, used) = match wire::parse_command(ingress)? {
                        Some(parsed) => parsed,
                        None => break,
                    };
                    ingress.pop(used);

                    let dest = match command.dest {
                        DestAddr::Ip(addr) => addr,
                        DestAddr::Domain(name, port) => {
                            reply_failure(client_chan).await?;
                            return Err(SessionError::DomainNotSupported(format!(
                                "{}:{}",
                                name, port
                            )));
                        }
                    };
                    match command.cmd {
                        SOCKS5_CMD_CONNECT => return Ok(Handshake::Connect(dest)),
                        SOCKS5_CMD_UDP_ASSOCIATE => {
                            if !ingress.is_empty() {
                                return Err(SessionError::UnexpectedData);
                            }
                            debug!("udp associate requested by {} (hint {})", peer, dest);
                            return Ok(Handshake::UdpAssociate);
                        }
                        other => {
                            reply_failure(client_chan).await?;
                            return Err(SessionError::UnsupportedCommand(other));
                        }
                    }
                }
            }
        }
        ingress.compact();

        let n = rd.read(&mut buf).await.map_err(SessionError::Read)?;
        if n == 0 {
            return Err(SessionError::UnexpectedEof);
        }
        ingress.push(&buf[..n]);
    }
}

async fn reply_failure(client_chan: &mut IoChannel) -> Result<(), SessionError> {
    client_chan
        .send_all(&wire::encode_reply(
            SOCKS5_REPLY_GENERAL_FAILURE,
            &Address::unspecified(),
        ))
        .await
}

/// Execute CONNECT and relay until both directions have completed.
async fn run_connect(
    ctx: &SessionCtx,
    client_rd: OwnedReadHalf,
    mut client_chan: IoChannel,
    pipelined: ByteQueue,
    dest: Address,
) -> Result<(), SessionError> {
    info!("session {} connecting to {}", ctx.id, dest);

    let remote = match TcpStream::connect(dest.socket_addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            reply_failure(&mut client_chan).await?;
            return Err(SessionError::Connect(e));
        }
    };
    let bnd = remote
        .local_addr()
        .map(Address::from)
        .unwrap_or_else(|_| Address::unspecified());
    client_chan
        .send_all(&wire::encode_reply(SOCKS5_REPLY_SUCCEEDED, &bnd))
        .await?;
    debug!("session {} relaying via {}", ctx.id, bnd);

    // handshake deadline over; idle tracking starts now
    ctx.wheels.update_client_stall(ctx.id, false);
    ctx.wheels.touch_idle(ctx.id);

    let (remote_rd, remote_wr) = remote.into_split();
    let mut remote_chan = IoChannel::with_queue(remote_wr, ctx.cfg.max_write_buffer, pipelined);
    ctx.wheels
        .update_remote_stall(ctx.id, !remote_chan.is_drained());

    tokio::try_join!(
        pump(ctx, client_rd, &mut remote_chan, Dir::ClientToRemote),
        pump(ctx, remote_rd, &mut client_chan, Dir::RemoteToClient),
    )?;
    Ok(())
}

/// Relay one direction: read from `rd`, write through `chan`.
///
/// Reading pauses while the egress queue is at its cap; queued bytes are
/// driven out whenever the socket turns writable. EOF from `rd` flushes
/// the queue and half-closes the peer, ending this direction.
async fn pump(
    ctx: &SessionCtx,
    mut rd: OwnedReadHalf,
    chan: &mut IoChannel,
    dir: Dir,
) -> Result<(), SessionError> {
    let mut buf = [0u8; TCP_READ_BUF];
    loop {
        tokio::select! {
            read = rd.read(&mut buf), if !chan.over_limit() => {
                match read {
                    Ok(0) => {
                        debug!("session {} {:?} eof, flushing", ctx.id, dir);
                        chan.set_producer_done();
                        while !chan.is_closed() {
                            chan.drive().await?;
                            update_stall(ctx, dir, chan);
                        }
                        return Ok(());
                    }
                    Ok(n) => {
                        chan.feed(&buf[..n])?;
                        update_stall(ctx, dir, chan);
                        ctx.wheels.touch_idle(ctx.id);
                    }
                    Err(e) => return Err(SessionError::Read(e)),
                }
            }
            drove = chan.drive(), if !chan.is_drained() => {
                drove?;
                update_stall(ctx, dir, chan);
            }
        }
    }
}

fn update_stall(ctx: &SessionCtx, dir: Dir, chan: &IoChannel) {
    let buffered = !chan.is_drained();
    match dir {
        Dir::ClientToRemote => ctx.wheels.update_remote_stall(ctx.id, buffered),
        Dir::RemoteToClient => ctx.wheels.update_client_stall(ctx.id, buffered),
    }
}

/// Execute UDP ASSOCIATE: translate datagrams between the client and
/// remote peers until the TCP control stream ends.
async fn run_udp(
    ctx: &SessionCtx,
    mut client_rd: OwnedReadHalf,
    mut client_chan: IoChannel,
    peer: SocketAddr,
    control_local_ip: IpAddr,
) -> Result<(), SessionError> {
    let (udp_client, udp_remote) = match bind_udp_pair(control_local_ip).await {
        Ok(pair) => pair,
        Err(e) => {
            reply_failure(&mut client_chan).await?;
            return Err(e);
        }
    };

    let mut bnd_sa = udp_client.local_addr().map_err(SessionError::Bind)?;
    if bnd_sa.ip().is_unspecified() {
        // advertise an address the client can actually send to
        bnd_sa.set_ip(control_local_ip);
    }
    let bnd = Address::from(bnd_sa);
    client_chan
        .send_all(&wire::encode_reply(SOCKS5_REPLY_SUCCEEDED, &bnd))
        .await?;
    info!("session {} udp association on {}", ctx.id, bnd);

    // handshake deadline over; idle tracking starts now
    ctx.wheels.update_client_stall(ctx.id, false);
    ctx.wheels.touch_idle(ctx.id);

    // learned from the first datagram that passes the source check
    let mut client_from: Option<SocketAddr> = None;
    let mut ctl_buf = [0u8; 512];
    let mut client_buf = vec![0u8; UDP_READ_BUF];
    let mut remote_buf = vec![0u8; UDP_READ_BUF];

    loop {
        tokio::select! {
            read = client_rd.read(&mut ctl_buf) => match read {
                Ok(0) => {
                    info!("session {} control stream eof, ending association", ctx.id);
                    return Ok(());
                }
                Ok(_) => return Err(SessionError::UnexpectedData),
                Err(e) => return Err(SessionError::Read(e)),
            },
            received = udp_client.recv_from(&mut client_buf) => match received {
                Ok((len, from)) => {
                    if forward_client_datagram(
                        &udp_remote,
                        &client_buf[..len],
                        from,
                        peer,
                        &mut client_from,
                    ) {
                        ctx.wheels.touch_idle(ctx.id);
                    }
                }
                Err(e) => warn!("udp recv error on client leg: {}", e),
            },
            received = udp_remote.recv_from(&mut remote_buf) => match received {
                Ok((len, from)) => {
                    if return_remote_datagram(&udp_client, &remote_buf[..len], from, client_from) {
                        ctx.wheels.touch_idle(ctx.id);
                    }
                }
                Err(e) => warn!("udp recv error on remote leg: {}", e),
            },
        }
    }
}

async fn bind_udp_pair(local_ip: IpAddr) -> Result<(UdpSocket, UdpSocket), SessionError> {
    let wildcard = if local_ip.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let client_facing = UdpSocket::bind(wildcard).await.map_err(SessionError::Bind)?;
    let remote_facing = UdpSocket::bind(wildcard).await.map_err(SessionError::Bind)?;
    Ok((client_facing, remote_facing))
}

/// Unwrap one client datagram and send its payload to the destination.
/// Returns whether the datagram was forwarded.
fn forward_client_datagram(
    udp_remote: &UdpSocket,
    datagram: &[u8],
    from: SocketAddr,
    tcp_peer: SocketAddr,
    client_from: &mut Option<SocketAddr>,
) -> bool {
    if from.ip() != tcp_peer.ip() {
        warn!(
            "dropping datagram from {}: source does not match client {}",
            from,
            tcp_peer.ip()
        );
        return false;
    }

    match client_from {
        None => {
            info!("learned client datagram source {}", from);
            *client_from = Some(from);
        }
        Some(prev) if *prev != from => {
            warn!("client datagram source changed from {} to {}", prev, from);
            *client_from = Some(from);
        }
        Some(_) => {}
    }

    let parsed = match wire::parse_udp_datagram(datagram) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("dropping datagram from {}: {}", from, e);
            return false;
        }
    };
    let dest = match parsed.dest {
        DestAddr::Ip(addr) => addr,
        DestAddr::Domain(name, port) => {
            warn!("dropping datagram for domain destination {}:{}", name, port);
            return false;
        }
    };

    match udp_remote.try_send_to(parsed.payload, dest.socket_addr()) {
        Ok(sent) => {
            if sent != parsed.payload.len() {
                error!("short udp send: {} of {} bytes", sent, parsed.payload.len());
            }
            debug!("forwarded {} bytes to {}", sent, dest);
            true
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            warn!("udp send to {} would block, dropping datagram", dest);
            false
        }
        Err(e) => {
            error!("udp send to {} failed: {}", dest, e);
            false
        }
    }
}

/// Wrap one remote datagram in a SOCKS5 header and return it to the
/// client. Returns whether the datagram was delivered.
fn return_remote_datagram(
    udp_client: &UdpSocket,
    payload: &[u8],
    from: SocketAddr,
    client_from: Option<SocketAddr>,
) -> bool {
    let client = match client_from {
        Some(addr) => addr,
        None => {
            warn!(
                "dropping datagram from {}: no client datagram seen yet",
                from
            );
            return false;
        }
    };

    let packet = wire::encode_udp_datagram(&Address::from(from), payload);
    match udp_client.try_send_to(&packet, client) {
        Ok(sent) => {
            if sent != packet.len() {
                error!("short udp send: {} of {} bytes", sent, packet.len());
            }
            debug!("returned {} bytes from {} to {}", payload.len(), from, client);
            true
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            warn!("udp send to client {} would block, dropping datagram", client);
            false
        }
        Err(e) => {
            error!("udp send to client {} failed: {}", client, e);
            false
        }
    }
}
