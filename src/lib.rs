//! Transparent SOCKS5 tunneling gateway.
//!
//! Redirected TCP/UDP traffic is terminated locally (by the kernel's
//! TPROXY/REDIRECT machinery, not by this crate) and relayed through a
//! SOCKS5 proxy, with DNS queries split between direct resolution and
//! proxied resolution per [`config::RoutingRule`].

pub mod config;
pub mod dns;
pub mod error;
#[cfg(target_os = "linux")]
pub mod listener;
pub mod socks5;
pub mod tcp_flow;
#[cfg(target_os = "linux")]
pub mod transparent;
pub mod udp_relay;

use config::Config;

/// Run the gateway until either listener task exits (which, barring a
/// bind failure, means the process is shutting down). The transparent
/// listeners depend on Linux-only TPROXY/`SO_ORIGINAL_DST` plumbing
/// (`transparent.rs`), so this is a Linux-only entry point.
#[cfg(target_os = "linux")]
pub async fn run(config: Config) -> anyhow::Result<()> {
    use std::sync::Arc;
    let config = Arc::new(config);

    let tcp = tokio::spawn(listener::serve_tcp(config.clone()));
    let udp = tokio::spawn(listener::serve_udp(config.clone()));

    tokio::select! {
        res = tcp => {
            res??;
        }
        res = udp => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub async fn run(_config: Config) -> anyhow::Result<()> {
    anyhow::bail!(
        "s5tun requires Linux (IP_TRANSPARENT/SO_ORIGINAL_DST are not available on this platform)"
    )
}
