use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// DNS redirection policy for queries that don't match a routing rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsMode {
    /// Redirect via a TCP-over-SOCKS5 query to `remote_dns_server`.
    Tcp,
    /// Redirect via SOCKS5 UDP-ASSOCIATE to `remote_dns_server`.
    Udp,
}

/// One routing rule: domains ending in `suffix` resolve directly via
/// `resolver_ip`, bypassing the proxy. `tag` is a human label only.
#[derive(Clone, Debug, Deserialize)]
pub struct RoutingRule {
    pub tag: String,
    pub suffix: String,
    pub resolver_ip: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub socks_server: Ipv4Addr,
    pub socks_port: u16,
    pub socks_username: Option<String>,
    pub socks_password: Option<String>,

    /// Address the transparent listeners bind to (the stack's "catch all"
    /// address).
    pub bind_addr: Ipv4Addr,
    pub tcp_listen_port: u16,
    pub local_dns_port: u16,

    pub dns_mode: DnsMode,
    pub remote_dns_server: Ipv4Addr,
    pub remote_dns_port: u16,

    pub routing_rules: Vec<RoutingRule>,

    /// High-water mark (bytes) gating the `blocked` backpressure flag on
    /// the proxy-facing read side.
    pub backpressure_cap: usize,

    /// Per-UDP-session deadline; resolves the "no timeout" open question
    /// in spec.md §9.
    pub udp_session_timeout_ms: u64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Precedence: process env > .env > routing-rules file > defaults.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> anyhow::Result<Self> {
        let socks_server: Ipv4Addr = env_string("S5GW_SOCKS_SERVER", "127.0.0.1")
            .parse()
            .context("parse S5GW_SOCKS_SERVER")?;
        let socks_port = env_u16("S5GW_SOCKS_PORT", 1080);
        let socks_username = env_opt_string("S5GW_SOCKS_USERNAME");
        let socks_password = env_opt_string("S5GW_SOCKS_PASSWORD");

        let bind_addr: Ipv4Addr = env_string("S5GW_BIND_ADDR", "0.0.0.0")
            .parse()
            .context("parse S5GW_BIND_ADDR")?;
        let tcp_listen_port = env_u16("S5GW_TCP_LISTEN_PORT", 12345);
        let local_dns_port = env_u16("S5GW_LOCAL_DNS_PORT", 53);

        let dns_mode = match env_string("S5GW_DNS_MODE", "tcp").as_str() {
            "tcp" => DnsMode::Tcp,
            "udp" => DnsMode::Udp,
            other => anyhow::bail!("invalid S5GW_DNS_MODE: {other} (expected tcp|udp)"),
        };
        let remote_dns_server: Ipv4Addr = env_string("S5GW_REMOTE_DNS_SERVER", "114.114.114.114")
            .parse()
            .context("parse S5GW_REMOTE_DNS_SERVER")?;
        let remote_dns_port = env_u16("S5GW_REMOTE_DNS_PORT", 53);

        let routing_rules = match env_opt_string("S5GW_ROUTING_RULES_FILE") {
            Some(path) => load_routing_rules(Path::new(&path))
                .with_context(|| format!("load routing rules from {path}"))?,
            None => Vec::new(),
        };

        let backpressure_cap = env_usize("S5GW_BACKPRESSURE_CAP", 64 * 1024);
        let udp_session_timeout_ms = env_u64("S5GW_UDP_SESSION_TIMEOUT_MS", 5_000);

        Ok(Self {
            socks_server,
            socks_port,
            socks_username,
            socks_password,
            bind_addr,
            tcp_listen_port,
            local_dns_port,
            dns_mode,
            remote_dns_server,
            remote_dns_port,
            routing_rules,
            backpressure_cap,
            udp_session_timeout_ms,
        })
    }
}

#[derive(Deserialize)]
struct RoutingRulesFile {
    #[serde(default)]
    domains: Vec<RoutingRule>,
}

fn load_routing_rules(path: &Path) -> anyhow::Result<Vec<RoutingRule>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let parsed: RoutingRulesFile =
        toml::from_str(&text).with_context(|| format!("parse toml {}", path.display()))?;
    Ok(parsed.domains)
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_routing_rules_toml() {
        let toml = r#"
            [[domains]]
            tag = "cn"
            suffix = "cn"
            resolver_ip = "223.5.5.5"

            [[domains]]
            tag = "lan"
            suffix = "lan"
            resolver_ip = "192.168.1.1"
        "#;
        let parsed: RoutingRulesFile = toml::from_str(toml).unwrap();
        assert_eq!(parsed.domains.len(), 2);
        assert_eq!(parsed.domains[0].tag, "cn");
        assert_eq!(parsed.domains[1].suffix, "lan");
    }
}
