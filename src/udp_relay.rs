//! UDP relay engine (C4): handles one inbound datagram redirected to the
//! gateway's UDP listener by picking one of three paths and enforcing a
//! session deadline on whichever one is chosen.
//!
//! The three paths, in the order the original dispatcher checks them:
//! 1. DNS query matching `dns_mode = tcp` on port 53 → TCP-over-SOCKS5
//!    query to `remote_dns_server`, or a direct UDP query if a routing
//!    rule matches the qname first.
//! 2. DNS query matching `dns_mode = udp` on `local_dns_port` → SOCKS5
//!    UDP-ASSOCIATE to `remote_dns_server`, or a direct UDP query if a
//!    routing rule matches the qname first.
//! 3. Anything else → SOCKS5 UDP-ASSOCIATE to the original destination.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::config::{Config, DnsMode};
use crate::dns::{extract_domain, is_redirected_dns_port, select_route, Route};
use crate::error::{GatewayError, Result};
use crate::socks5::{self, UdpAssociate};

/// Handle one inbound datagram: `payload` as captured off the wire,
/// `orig_dst` its original destination (spec's `remote_fake_ip`/
/// `remote_fake_port`), and `reply` a sink back to the original sender.
pub async fn handle_datagram(
    config: &Config,
    payload: &[u8],
    orig_dst: SocketAddrV4,
    reply_socket: &UdpSocket,
    reply_to: SocketAddr,
) -> Result<()> {
    let deadline = Duration::from_millis(config.udp_session_timeout_ms);

    if is_redirected_dns_port(config, orig_dst.port()) {
        return match timeout(
            deadline,
            handle_dns_datagram(config, payload, reply_socket, reply_to),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::ProtocolError("dns relay timed out".into())),
        };
    }

    match timeout(
        deadline,
        relay_via_udp_associate(config, payload, orig_dst, reply_socket, reply_to),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(GatewayError::ProtocolError(
            "udp-associate session timed out".into(),
        )),
    }
}

async fn handle_dns_datagram(
    config: &Config,
    payload: &[u8],
    reply_socket: &UdpSocket,
    reply_to: SocketAddr,
) -> Result<()> {
    let domain = extract_domain(payload)?;
    match select_route(&domain, config) {
        Route::Direct { resolver } => {
            let answer = direct_udp_query(resolver, payload).await?;
            reply_socket
                .send_to(&answer, reply_to)
                .await
                .map_err(GatewayError::LocalIO)?;
        }
        Route::ViaProxy => {
            let answer = match config.dns_mode {
                DnsMode::Tcp => dns_over_socks5(config, payload).await?,
                DnsMode::Udp => dns_over_udp_associate(config, payload).await?,
            };
            reply_socket
                .send_to(&answer, reply_to)
                .await
                .map_err(GatewayError::LocalIO)?;
        }
    }
    Ok(())
}

/// Query `resolver` directly over UDP, bypassing the proxy entirely.
async fn direct_udp_query(resolver: Ipv4Addr, query: &[u8]) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(GatewayError::LocalIO)?;
    socket
        .send_to(query, (resolver, 53))
        .await
        .map_err(GatewayError::LocalIO)?;

    let mut buf = vec![0u8; 4096];
    let n = socket.recv(&mut buf).await.map_err(GatewayError::LocalIO)?;
    buf.truncate(n);
    Ok(buf)
}

/// Resolve `query` by tunneling a length-prefixed TCP DNS query through
/// the SOCKS5 proxy to `config.remote_dns_server`.
async fn dns_over_socks5(config: &Config, query: &[u8]) -> Result<Vec<u8>> {
    let mut stream: TcpStream = socks5::connect(config.socks_server, config.socks_port).await?;
    let bnd = socks5::authenticate(
        &mut stream,
        config.remote_dns_server,
        config.remote_dns_port,
        socks5::Command::Connect,
        None,
    )
    .await?;
    let _ = bnd;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await.map_err(GatewayError::LocalIO)?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(GatewayError::LocalIO)?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut answer = vec![0u8; len];
    stream
        .read_exact(&mut answer)
        .await
        .map_err(GatewayError::LocalIO)?;
    Ok(answer)
}

/// Resolve `query` via a SOCKS5 UDP-ASSOCIATE mapping targeting
/// `config.remote_dns_server:remote_dns_port`, the `dns_mode == udp` path
/// (`udp_raw.cpp`'s dispatcher sends the UDP-ASSOCIATE request to the
/// configured remote DNS server rather than to the query's original
/// destination when in UDP DNS mode).
async fn dns_over_udp_associate(config: &Config, query: &[u8]) -> Result<Vec<u8>> {
    let associate = UdpAssociate::establish(config).await?;
    let target = SocketAddrV4::new(config.remote_dns_server, config.remote_dns_port);
    associate.send_to(query, target).await?;

    let mut buf = vec![0u8; 4096];
    let n = associate.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

/// Relay one datagram to `orig_dst` through a fresh SOCKS5 UDP-ASSOCIATE
/// mapping, and forward the first reply back to the original sender.
async fn relay_via_udp_associate(
    config: &Config,
    payload: &[u8],
    orig_dst: SocketAddrV4,
    reply_socket: &UdpSocket,
    reply_to: SocketAddr,
) -> Result<()> {
    let associate = UdpAssociate::establish(config).await?;
    associate.send_to(payload, orig_dst).await?;

    let mut buf = vec![0u8; 4096];
    let n = associate.recv(&mut buf).await?;
    reply_socket
        .send_to(&buf[..n], reply_to)
        .await
        .map_err(GatewayError::LocalIO)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsMode;

    fn test_config() -> Config {
        Config {
            socks_server: Ipv4Addr::new(127, 0, 0, 1),
            socks_port: 1080,
            socks_username: None,
            socks_password: None,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            tcp_listen_port: 12345,
            local_dns_port: 53,
            dns_mode: DnsMode::Udp,
            remote_dns_server: Ipv4Addr::new(114, 114, 114, 114),
            remote_dns_port: 53,
            routing_rules: Vec::new(),
            backpressure_cap: 65536,
            udp_session_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn direct_udp_query_round_trips_against_mock_resolver() {
        let resolver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let resolver_addr = resolver.local_addr().unwrap();
        let resolver_ip = match resolver_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, from) = resolver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"query-bytes");
            resolver.send_to(b"answer-bytes", from).await.unwrap();
        });

        let answer = direct_udp_query(resolver_ip, b"query-bytes").await.unwrap();
        assert_eq!(answer, b"answer-bytes");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dns_datagram_times_out_when_no_route_reachable() {
        let config = test_config();
        let reply_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let reply_to: SocketAddr = ([127, 0, 0, 1], 9).into();
        // No routing rule and no reachable proxy: the TCP-over-SOCKS5
        // connect attempt will fail fast, well inside the 50ms deadline.
        let mut config = config;
        config.dns_mode = DnsMode::Tcp;
        let mut payload = vec![0u8; 12];
        payload.extend_from_slice(&[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0]);
        payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        let result = handle_datagram(
            &config,
            &payload,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 53),
            &reply_socket,
            reply_to,
        )
        .await;
        assert!(result.is_err());
    }
}
