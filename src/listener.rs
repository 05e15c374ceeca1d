//! Bootstrap and event-loop integration (C5+C6): binds the transparent
//! TCP and UDP listeners and spawns one task per accepted flow/datagram,
//! the direct analogue of `tcp_raw_init`/`udp_raw_init` registering their
//! callbacks with the single-threaded event loop.

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::Result;
use crate::tcp_flow;
use crate::transparent;
use crate::udp_relay;

/// Accept transparently-redirected TCP connections forever, spawning one
/// [`tcp_flow::run_flow`] task per connection. Each flow owns its own
/// `tokio::select!` loop, so a slow or stuck flow never blocks others —
/// the cooperative-scheduling guarantee the original relied on its
/// single-threaded libev loop for.
pub async fn serve_tcp(config: Arc<Config>) -> Result<()> {
    let listener = transparent::bind_tcp_listener(config.bind_addr, config.tcp_listen_port)?;
    tracing::info!(addr = %config.bind_addr, port = config.tcp_listen_port, "tcp: listening for redirected flows");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "tcp: accept failed");
                continue;
            }
        };

        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = accept_one_flow(stream, peer, &config).await {
                tracing::warn!(%err, %peer, "tcp: flow ended with error");
            }
        });
    }
}

async fn accept_one_flow(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    config: &Config,
) -> Result<()> {
    let orig_dst = transparent::original_dst(&stream)?;
    tracing::debug!(%peer, target = %orig_dst, "tcp: accepted flow");

    let mut stream = stream;
    tcp_flow::run_flow(&mut stream, config, *orig_dst.ip(), orig_dst.port()).await
}

/// Receive transparently-redirected UDP datagrams forever, spawning one
/// [`udp_relay::handle_datagram`] task per datagram. Each datagram is
/// independent (no UDP session state survives past its own deadline), so
/// fan-out here needs no session table at the listener layer itself.
pub async fn serve_udp(config: Arc<Config>) -> Result<()> {
    let socket = Arc::new(transparent::bind_udp_transparent(
        config.bind_addr,
        config.local_dns_port,
    )?);
    tracing::info!(addr = %config.bind_addr, port = config.local_dns_port, "udp: listening for redirected datagrams");

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, src, dst) = match transparent::recv_with_orig_dst(&socket, &mut buf).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "udp: recv failed");
                continue;
            }
        };

        let payload = buf[..n].to_vec();
        let config = config.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            if let Err(err) = udp_relay::handle_datagram(&config, &payload, dst, &socket, src).await {
                tracing::warn!(%err, %src, target = %dst, "udp: datagram relay failed");
            }
        });
    }
}
