//! TCP flow engine (C3): terminates one flow redirected from the stack,
//! proxies its bytes through an authenticated SOCKS5 CONNECT stream, and
//! replicates the stack's own backpressure discipline in both directions.
//!
//! Named after the lwIP callback states this replaces: `ES_ACCEPTED` →
//! first chunk not yet seen, `ES_RECEIVED` → steady state, `ES_CLOSING` →
//! half-closed, draining the last bytes before teardown.

use std::net::Ipv4Addr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::socks5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlowState {
    Accepted,
    Received,
    Closing,
}

const READ_CHUNK: usize = 16 * 1024;

/// Run one TCP flow to completion: connect+authenticate to the SOCKS5
/// proxy for `(target_host, target_port)`, then shuttle bytes between
/// `stack` (the transparently-redirected client socket) and the proxy
/// until either side closes or a non-transient error occurs.
///
/// `stack` is generic over `AsyncRead + AsyncWrite` so tests can drive
/// this with an in-memory duplex pair instead of a real socket.
pub async fn run_flow<S>(
    mut stack: S,
    config: &Config,
    target_host: Ipv4Addr,
    target_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut proxy = socks5::connect_and_authenticate(config, target_host, target_port).await?;
    run_flow_with_proxy(&mut stack, &mut proxy, config.backpressure_cap).await
}

/// Core of [`run_flow`], split out so tests can supply an already
/// connected mock proxy stream instead of a real SOCKS5 handshake.
/// Generic over the proxy side too, so tests exercise this exact
/// function (including its backpressure path) with an in-memory duplex
/// pair instead of a real `TcpStream`.
pub async fn run_flow_with_proxy<S, P>(stack: &mut S, proxy: &mut P, cap: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = FlowState::Accepted;

    // `inbuf`: bytes read from the stack, queued to write to the proxy
    // (the original's `es->buf`). `outbuf`: bytes read from the proxy,
    // queued to write back to the stack (`es->socks_buf`). `blocked`
    // gates further stack reads once `outbuf` backs up past `cap`,
    // mirroring `lwip_blocked`.
    let mut inbuf = BytesMut::new();
    let mut outbuf = BytesMut::new();
    let mut blocked = false;
    let mut stack_half_closed = false;
    let mut proxy_half_closed = false;

    let mut read_buf = vec![0u8; READ_CHUNK];

    loop {
        if state == FlowState::Closing && inbuf.is_empty() && outbuf.is_empty() {
            return Ok(());
        }

        tokio::select! {
            biased;

            result = stack.read(&mut read_buf), if !stack_half_closed && !blocked => {
                match result {
                    Ok(0) => {
                        stack_half_closed = true;
                        if state == FlowState::Accepted {
                            state = FlowState::Received;
                        }
                        if inbuf.is_empty() {
                            state = FlowState::Closing;
                        }
                    }
                    Ok(n) => {
                        state = FlowState::Received;
                        inbuf.extend_from_slice(&read_buf[..n]);
                    }
                    Err(e) => return Err(GatewayError::from(e)),
                }
            }

            result = proxy.read(&mut read_buf), if !proxy_half_closed && outbuf.len() < cap => {
                match result {
                    Ok(0) => {
                        proxy_half_closed = true;
                        if outbuf.is_empty() {
                            state = FlowState::Closing;
                        }
                    }
                    Ok(n) => {
                        outbuf.extend_from_slice(&read_buf[..n]);
                    }
                    Err(e) => return Err(GatewayError::from(e)),
                }
            }

            else => {}
        }

        if !inbuf.is_empty() {
            flush_to_proxy(proxy, &mut inbuf).await?;
            if inbuf.is_empty() && stack_half_closed {
                state = FlowState::Closing;
            }
        }

        if !outbuf.is_empty() {
            drain_outbuf_to_stack(stack, &mut outbuf).await?;
            blocked = outbuf.len() >= cap;
            if outbuf.is_empty() && proxy_half_closed {
                state = FlowState::Closing;
            }
        } else {
            blocked = false;
        }

        if stack_half_closed && proxy_half_closed && inbuf.is_empty() && outbuf.is_empty() {
            state = FlowState::Closing;
        }
    }
}

/// Write the full contents of `inbuf` to the proxy. A short write tears
/// the flow down rather than retrying the remainder — this mirrors the
/// original's own behavior (`tcp_raw_send` closes on anything but a full
/// `send()`), flagged as questionable but intentionally preserved.
async fn flush_to_proxy<P>(proxy: &mut P, inbuf: &mut BytesMut) -> Result<()>
where
    P: AsyncWrite + Unpin,
{
    let len = inbuf.len();
    let written = proxy.write(inbuf).await.map_err(GatewayError::from)?;
    if written != len {
        return Err(GatewayError::StackError(format!(
            "short write to proxy: {written}/{len}"
        )));
    }
    inbuf.clear();
    Ok(())
}

/// Write as much of `outbuf` to the stack as it will currently accept,
/// halving the attempted length on transient backpressure (the
/// `ERR_MEM`-retry loop in `send_data_lwip`) before giving up.
async fn drain_outbuf_to_stack<S>(stack: &mut S, outbuf: &mut BytesMut) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut attempt = outbuf.len();
    loop {
        match stack.write(&outbuf[..attempt]).await {
            Ok(written) => {
                let _ = outbuf.split_to(written);
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && attempt > 1 => {
                attempt /= 2;
            }
            Err(e) => return Err(GatewayError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    async fn mock_proxy_echo() -> (TcpStream, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let client = TcpStream::connect(addr).await.unwrap();
        (client, handle)
    }

    #[tokio::test]
    async fn echoes_data_round_trip_then_closes_cleanly() {
        let (mut proxy, server) = mock_proxy_echo().await;
        let (mut client_end, mut stack_end) = duplex(4096);

        let flow = tokio::spawn(async move { run_flow_with_proxy(&mut stack_end, &mut proxy, 8192).await });

        client_end.write_all(b"hello flow").await.unwrap();
        let mut got = vec![0u8; 10];
        client_end.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello flow");

        drop(client_end);
        flow.await.unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn backpressure_caps_outbuf_growth() {
        let (mut proxy_srv, mut proxy_cli) = duplex(1 << 20);
        let (mut client_end, mut stack_end) = duplex(8);

        let flow = tokio::spawn(async move { run_flow_with_proxy(&mut stack_end, &mut proxy_cli, 8).await });

        let payload = vec![b'x'; 64];
        proxy_srv.write_all(&payload).await.unwrap();

        // Stack side reads slowly; the flow must not buffer unboundedly
        // past `cap` bytes before applying backpressure on its own reads.
        let mut total = 0usize;
        let mut chunk = [0u8; 4];
        for _ in 0..16 {
            if let Ok(Ok(n)) =
                tokio::time::timeout(std::time::Duration::from_millis(50), client_end.read(&mut chunk)).await
            {
                total += n;
                if n == 0 {
                    break;
                }
            }
        }
        assert!(total > 0);

        drop(client_end);
        drop(proxy_srv);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), flow).await;
    }
}
