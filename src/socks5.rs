//! SOCKS5 client helper (spec §4.1): open a TCP connection to the proxy,
//! run method negotiation, issue CONNECT or UDP-ASSOCIATE, and hand back
//! an authenticated byte-stream socket (or, for UDP, the relay endpoint).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::config::Config;
use crate::error::{GatewayError, Result};

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;

/// Which command this handshake requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

impl Command {
    fn code(self) -> u8 {
        match self {
            Command::Connect => CMD_CONNECT,
            Command::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

/// Credentials for RFC 1929 username/password auth, used when configured;
/// otherwise NO_AUTH is offered. These are the only two auth modes the
/// helper supports (spec §1 Non-goals).
#[derive(Clone, Debug)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

/// Open a TCP connection to the SOCKS5 proxy.
pub async fn connect(proxy_host: Ipv4Addr, proxy_port: u16) -> Result<TcpStream> {
    TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(GatewayError::Unreachable)
}

/// Run the method-selection + request/reply sequence on an already
/// connected socket. On success for `Command::Connect` the caller owns an
/// authenticated byte stream to the target; for `Command::UdpAssociate`
/// the returned `bnd_addr`/`bnd_port` is the proxy's UDP relay endpoint.
pub async fn authenticate(
    stream: &mut TcpStream,
    target_host: Ipv4Addr,
    target_port: u16,
    cmd: Command,
    auth: Option<&Auth>,
) -> Result<SocketAddrV4> {
    negotiate_method(stream, auth).await?;

    let mut req = Vec::with_capacity(10);
    req.push(SOCKS5_VERSION);
    req.push(cmd.code());
    req.push(0x00); // RSV
    req.push(ATYP_IPV4);
    req.extend_from_slice(&target_host.octets());
    req.extend_from_slice(&target_port.to_be_bytes());
    stream
        .write_all(&req)
        .await
        .map_err(GatewayError::LocalIO)?;

    let mut reply = [0u8; 10];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| io_to_protocol_or_local(e, "truncated socks5 reply"))?;

    if reply[0] != SOCKS5_VERSION {
        return Err(GatewayError::ProtocolError(format!(
            "bad reply version: {}",
            reply[0]
        )));
    }
    let rep = reply[1];
    if rep != 0x00 {
        return Err(GatewayError::AuthError(rep));
    }
    if reply[3] != ATYP_IPV4 {
        return Err(GatewayError::ProtocolError(format!(
            "unsupported reply ATYP: {}",
            reply[3]
        )));
    }

    let bnd_addr = Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    let bnd_port = u16::from_be_bytes([reply[8], reply[9]]);
    Ok(SocketAddrV4::new(bnd_addr, bnd_port))
}

async fn negotiate_method(stream: &mut TcpStream, auth: Option<&Auth>) -> Result<()> {
    let greeting: &[u8] = if auth.is_some() {
        &[SOCKS5_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USERPASS]
    } else {
        &[SOCKS5_VERSION, 0x01, METHOD_NO_AUTH]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(GatewayError::LocalIO)?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| io_to_protocol_or_local(e, "truncated method-select reply"))?;

    if choice[0] != SOCKS5_VERSION {
        return Err(GatewayError::ProtocolError(format!(
            "bad method-select version: {}",
            choice[0]
        )));
    }

    match (choice[1], auth) {
        (METHOD_NO_AUTH, _) => Ok(()),
        (METHOD_USERPASS, Some(creds)) => userpass_auth(stream, creds).await,
        (METHOD_NO_ACCEPTABLE, _) => {
            Err(GatewayError::ProtocolError("no acceptable auth methods".into()))
        }
        (other, _) => Err(GatewayError::ProtocolError(format!(
            "unsupported/unrequested auth method: {other:#04x}"
        ))),
    }
}

async fn userpass_auth(stream: &mut TcpStream, creds: &Auth) -> Result<()> {
    if creds.username.len() > 255 || creds.password.len() > 255 {
        return Err(GatewayError::ProtocolError(
            "username/password too long".into(),
        ));
    }
    let mut req = Vec::with_capacity(3 + creds.username.len() + creds.password.len());
    req.push(0x01); // auth sub-negotiation version
    req.push(creds.username.len() as u8);
    req.extend_from_slice(creds.username.as_bytes());
    req.push(creds.password.len() as u8);
    req.extend_from_slice(creds.password.as_bytes());
    stream
        .write_all(&req)
        .await
        .map_err(GatewayError::LocalIO)?;

    let mut resp = [0u8; 2];
    stream
        .read_exact(&mut resp)
        .await
        .map_err(|e| io_to_protocol_or_local(e, "truncated userpass reply"))?;
    if resp[1] != 0x00 {
        return Err(GatewayError::AuthError(resp[1]));
    }
    Ok(())
}

fn io_to_protocol_or_local(err: std::io::Error, context: &str) -> GatewayError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        GatewayError::ProtocolError(context.to_string())
    } else {
        GatewayError::LocalIO(err)
    }
}

fn auth_from_config(config: &Config) -> Option<Auth> {
    match (&config.socks_username, &config.socks_password) {
        (Some(u), Some(p)) => Some(Auth {
            username: u.clone(),
            password: p.clone(),
        }),
        _ => None,
    }
}

/// Convenience wrapper: connect + authenticate a CONNECT request using
/// `config`'s proxy and credentials. Used by the TCP flow engine.
pub async fn connect_and_authenticate(
    config: &Config,
    target_host: Ipv4Addr,
    target_port: u16,
) -> Result<TcpStream> {
    let mut stream = connect(config.socks_server, config.socks_port).await?;
    let auth = auth_from_config(config);
    authenticate(
        &mut stream,
        target_host,
        target_port,
        Command::Connect,
        auth.as_ref(),
    )
    .await?;
    Ok(stream)
}

/// A live SOCKS5 UDP-ASSOCIATE mapping (spec §4.1/§6). Keeps the TCP
/// control connection open so the proxy maintains the UDP mapping for the
/// lifetime of this handle, per RFC 1928 §7.
pub struct UdpAssociate {
    udp: UdpSocket,
    relay: SocketAddrV4,
    _control: TcpStream,
}

impl UdpAssociate {
    pub async fn establish(config: &Config) -> Result<Self> {
        let mut control = connect(config.socks_server, config.socks_port).await?;
        let auth = auth_from_config(config);
        let relay = authenticate(
            &mut control,
            Ipv4Addr::UNSPECIFIED,
            0,
            Command::UdpAssociate,
            auth.as_ref(),
        )
        .await?;

        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(GatewayError::LocalIO)?;

        Ok(Self {
            udp,
            relay,
            _control: control,
        })
    }

    pub fn relay_addr(&self) -> SocketAddrV4 {
        self.relay
    }

    /// Send `payload` to `target` through the proxy's UDP relay.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddrV4) -> Result<()> {
        let framed = encode_udp_request(target, payload);
        self.udp
            .send_to(&framed, SocketAddr::V4(self.relay))
            .await
            .map_err(GatewayError::LocalIO)?;
        Ok(())
    }

    /// Receive one reply, stripping the SOCKS5 UDP header (spec §6).
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _from) = self.udp.recv_from(buf).await.map_err(GatewayError::LocalIO)?;
        let body_start = decode_udp_reply_header_len(&buf[..n])?;
        if body_start > n {
            return Err(GatewayError::ProtocolError(
                "socks5 udp: invalid payload offset".into(),
            ));
        }
        let body_len = n - body_start;
        buf.copy_within(body_start..n, 0);
        Ok(body_len)
    }
}

/// `RSV(2) FRAG(1) ATYP(1) DST.ADDR(4) DST.PORT(2) DATA` (spec §6).
fn encode_udp_request(target: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + payload.len());
    out.extend_from_slice(&[0x00, 0x00, 0x00, ATYP_IPV4]);
    out.extend_from_slice(&target.ip().octets());
    out.extend_from_slice(&target.port().to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate the fixed 10-byte IPv4 SOCKS5 UDP header and return its length.
fn decode_udp_reply_header_len(pkt: &[u8]) -> Result<usize> {
    if pkt.len() < 10 {
        return Err(GatewayError::ProtocolError(
            "socks5 udp: reply too short".into(),
        ));
    }
    if pkt[0] != 0 || pkt[1] != 0 {
        return Err(GatewayError::ProtocolError("socks5 udp: non-zero RSV".into()));
    }
    if pkt[2] != 0 {
        return Err(GatewayError::ProtocolError(
            "socks5 udp: fragmentation not supported".into(),
        ));
    }
    if pkt[3] != ATYP_IPV4 {
        return Err(GatewayError::ProtocolError(
            "socks5 udp: unsupported ATYP in reply".into(),
        ));
    }
    Ok(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_udp_request_header() {
        let target = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 5353);
        let framed = encode_udp_request(target, b"payload");
        assert_eq!(&framed[..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&framed[4..8], &[198, 51, 100, 9]);
        assert_eq!(&framed[8..10], &5353u16.to_be_bytes());
        assert_eq!(&framed[10..], b"payload");
    }

    #[test]
    fn rejects_short_udp_reply() {
        let err = decode_udp_reply_header_len(&[0u8; 5]).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolError(_)));
    }

    #[test]
    fn rejects_fragmented_udp_reply() {
        let mut pkt = [0u8; 10];
        pkt[2] = 1; // FRAG != 0
        pkt[3] = ATYP_IPV4;
        let err = decode_udp_reply_header_len(&pkt).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn full_handshake_against_mock_server() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            sock.read_exact(&mut req).await.unwrap();
            assert_eq!(req[0], 0x05);
            assert_eq!(req[1], CMD_CONNECT);

            let mut reply = [0u8; 10];
            reply[0] = 0x05;
            reply[3] = ATYP_IPV4;
            sock.write_all(&reply).await.unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bnd = authenticate(
            &mut stream,
            Ipv4Addr::new(198, 51, 100, 7),
            80,
            Command::Connect,
            None,
        )
        .await
        .unwrap();
        assert_eq!(bnd, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_bad_method_selection() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[0x05, 0xff]).await.unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let err = authenticate(
            &mut stream,
            Ipv4Addr::new(198, 51, 100, 7),
            80,
            Command::Connect,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolError(_)));
        server.await.unwrap();
    }
}
