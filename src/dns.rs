//! DNS split-routing (spec §4.2): pull the queried name out of a raw DNS
//! message and decide whether it should be answered directly, over a
//! SOCKS5 UDP-ASSOCIATE tunnel, or via a TCP-over-SOCKS5 query.

use std::net::Ipv4Addr;

use crate::config::{Config, DnsMode, RoutingRule};
use crate::error::{GatewayError, Result};

/// Where a DNS query should be sent, once routing rules are applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Answered by a plain UDP query to `resolver`, bypassing the proxy.
    Direct { resolver: Ipv4Addr },
    /// Answered by tunneling the query through the SOCKS5 proxy, using
    /// whichever transport `config.dns_mode` selects.
    ViaProxy,
}

/// Extract the first question-section QNAME from a raw DNS message.
///
/// Mirrors the contract of a length-prefixed-label qname walker: each
/// label is a 1-byte length followed by that many bytes, terminated by a
/// zero-length label. Compression pointers (top two bits set) are
/// rejected rather than followed, since a query's own QNAME is never
/// compressed in a well-formed request.
pub fn extract_domain(msg: &[u8]) -> Result<String> {
    const HEADER_LEN: usize = 12;
    if msg.len() <= HEADER_LEN {
        return Err(GatewayError::ProtocolError(
            "dns message shorter than header".into(),
        ));
    }

    let mut pos = HEADER_LEN;
    let mut labels: Vec<String> = Vec::new();

    loop {
        let len = *msg
            .get(pos)
            .ok_or_else(|| GatewayError::ProtocolError("dns qname: truncated".into()))?;

        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return Err(GatewayError::ProtocolError(
                "dns qname: unexpected compression pointer".into(),
            ));
        }

        pos += 1;
        let end = pos
            .checked_add(len as usize)
            .filter(|&e| e <= msg.len())
            .ok_or_else(|| GatewayError::ProtocolError("dns qname: label overruns message".into()))?;

        let label = std::str::from_utf8(&msg[pos..end])
            .map_err(|_| GatewayError::ProtocolError("dns qname: non-utf8 label".into()))?;
        labels.push(label.to_string());
        pos = end;

        if labels.len() > 127 {
            return Err(GatewayError::ProtocolError("dns qname: too many labels".into()));
        }
    }

    if labels.is_empty() {
        return Err(GatewayError::ProtocolError("dns qname: empty".into()));
    }
    Ok(labels.join("."))
}

fn has_suffix(domain: &str, suffix: &str) -> bool {
    domain.ends_with(suffix)
}

/// Find the first matching routing rule for `domain`, in declaration
/// order (first match wins, per the suffix table semantics).
pub fn match_rule<'a>(domain: &str, rules: &'a [RoutingRule]) -> Option<&'a RoutingRule> {
    rules.iter().find(|rule| has_suffix(domain, &rule.suffix))
}

/// Decide where a DNS query redirected to the gateway's local DNS port
/// should go: a matching routing rule always wins (direct UDP to its
/// resolver); otherwise it falls back to `config.dns_mode`'s tunnel.
pub fn select_route(domain: &str, config: &Config) -> Route {
    if let Some(rule) = match_rule(domain, &config.routing_rules) {
        tracing::debug!(domain, resolver = %rule.resolver_ip, tag = %rule.tag, "dns: direct route matched");
        return Route::Direct {
            resolver: rule.resolver_ip,
        };
    }
    tracing::debug!(domain, mode = ?config.dns_mode, "dns: no rule match, tunneling via proxy");
    Route::ViaProxy
}

/// True when the gateway should treat this destination port as a DNS
/// query subject to split routing, per the configured `dns_mode`.
pub fn is_redirected_dns_port(config: &Config, dst_port: u16) -> bool {
    match config.dns_mode {
        DnsMode::Tcp => dst_port == 53,
        DnsMode::Udp => dst_port == config.local_dns_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_for(name: &str) -> Vec<u8> {
        let mut msg = vec![0u8; 12];
        for label in name.split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // QTYPE A, QCLASS IN
        msg
    }

    #[test]
    fn extracts_simple_domain() {
        let msg = query_for("example.com");
        assert_eq!(extract_domain(&msg).unwrap(), "example.com");
    }

    #[test]
    fn rejects_truncated_message() {
        let err = extract_domain(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolError(_)));
    }

    #[test]
    fn rejects_compression_pointer() {
        let mut msg = vec![0u8; 12];
        msg.push(0xC0);
        msg.push(0x0C);
        let err = extract_domain(&msg).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolError(_)));
    }

    #[test]
    fn suffix_matching_is_plain_ends_with() {
        assert!(has_suffix("mail.example.cn", "cn"));
        assert!(!has_suffix("example.com", "cn"));
        // No label alignment: a suffix matching mid-label still counts.
        assert!(has_suffix("falcon", "con"));
        // Case-sensitive: no case folding.
        assert!(!has_suffix("example.CN", "cn"));
    }

    #[test]
    fn select_route_prefers_matching_rule() {
        let mut config = test_config();
        config.routing_rules.push(RoutingRule {
            tag: "cn".into(),
            suffix: "cn".into(),
            resolver_ip: Ipv4Addr::new(223, 5, 5, 5),
        });
        match select_route("baidu.cn", &config) {
            Route::Direct { resolver } => assert_eq!(resolver, Ipv4Addr::new(223, 5, 5, 5)),
            Route::ViaProxy => panic!("expected direct route"),
        }
        assert_eq!(select_route("google.com", &config), Route::ViaProxy);
    }

    fn test_config() -> Config {
        Config {
            socks_server: Ipv4Addr::new(127, 0, 0, 1),
            socks_port: 1080,
            socks_username: None,
            socks_password: None,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            tcp_listen_port: 12345,
            local_dns_port: 53,
            dns_mode: DnsMode::Tcp,
            remote_dns_server: Ipv4Addr::new(114, 114, 114, 114),
            remote_dns_port: 53,
            routing_rules: Vec::new(),
            backpressure_cap: 65536,
            udp_session_timeout_ms: 5000,
        }
    }
}
