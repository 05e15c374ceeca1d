//! Linux transparent-proxy plumbing (backs C6): recovers the connection's
//! original destination, the piece of information the stack's callback
//! API got for free from `pcb->local_ip`/`pcb->remote_fake_ip`/
//! `pcb->remote_fake_port` but that a real socket never sees on its own.
//!
//! TCP uses `SO_ORIGINAL_DST` on a socket that received a REDIRECT'd
//! connection. UDP uses `IP_TRANSPARENT` plus the `IP_RECVORIGDSTADDR`
//! ancillary message on a socket bound with `IP_TRANSPARENT` set, which
//! requires `CAP_NET_ADMIN` (or root) and a matching `ip rule`/`iptables
//! TPROXY` setup outside this process.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::error::{GatewayError, Result};

const SOL_IP: libc::c_int = libc::SOL_IP;
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Bind a TCP listener suitable for receiving REDIRECT'd connections.
/// `SO_ORIGINAL_DST` needs no special socket flags at bind time — only
/// the iptables `REDIRECT`/`TPROXY` rule routing traffic here matters —
/// but `IP_TRANSPARENT` is set regardless so the same listener also
/// accepts genuinely transparent (non-NAT) TPROXY'd connections.
pub fn bind_tcp_listener(addr: Ipv4Addr, port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(GatewayError::LocalIO)?;
    socket.set_reuse_address(true).map_err(GatewayError::LocalIO)?;
    set_ip_transparent(&socket).map_err(GatewayError::LocalIO)?;
    socket
        .bind(&SockAddr::from(std::net::SocketAddr::V4(SocketAddrV4::new(addr, port))))
        .map_err(GatewayError::LocalIO)?;
    socket.listen(1024).map_err(GatewayError::LocalIO)?;
    socket.set_nonblocking(true).map_err(GatewayError::LocalIO)?;
    TcpListener::from_std(socket.into()).map_err(GatewayError::LocalIO)
}

/// Bind a UDP socket with `IP_TRANSPARENT` and `IP_RECVORIGDSTADDR` set,
/// so [`recv_with_orig_dst`] can recover each datagram's original
/// destination via ancillary data.
pub fn bind_udp_transparent(addr: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(GatewayError::LocalIO)?;
    socket.set_reuse_address(true).map_err(GatewayError::LocalIO)?;
    set_ip_transparent(&socket).map_err(GatewayError::LocalIO)?;
    set_recv_orig_dst_addr(&socket).map_err(GatewayError::LocalIO)?;
    socket
        .bind(&SockAddr::from(std::net::SocketAddr::V4(SocketAddrV4::new(addr, port))))
        .map_err(GatewayError::LocalIO)?;
    socket.set_nonblocking(true).map_err(GatewayError::LocalIO)?;
    UdpSocket::from_std(socket.into()).map_err(GatewayError::LocalIO)
}

/// Recover the original destination of a REDIRECT'd TCP connection.
pub fn original_dst(stream: &tokio::net::TcpStream) -> Result<SocketAddrV4> {
    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(GatewayError::LocalIO(io::Error::last_os_error()));
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port as u16);
    Ok(SocketAddrV4::new(ip, port))
}

/// Receive one datagram along with its original destination address, as
/// delivered via the `IP_RECVORIGDSTADDR` control message on a socket
/// bound by [`bind_udp_transparent`].
pub async fn recv_with_orig_dst(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> Result<(usize, std::net::SocketAddr, SocketAddrV4)> {
    loop {
        socket.readable().await.map_err(GatewayError::LocalIO)?;
        match try_recv_with_orig_dst(socket, buf) {
            Ok(result) => return Ok(result),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(GatewayError::LocalIO(e)),
        }
    }
}

fn try_recv_with_orig_dst(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, std::net::SocketAddr, SocketAddrV4)> {
    let fd = socket.as_raw_fd();

    let mut src: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    const CMSG_SPACE_LEN: usize = 128;
    let mut cmsg_buf: [MaybeUninit<u8>; CMSG_SPACE_LEN] = [MaybeUninit::uninit(); CMSG_SPACE_LEN];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = CMSG_SPACE_LEN as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let src_addr = std::net::SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr)),
        u16::from_be(src.sin_port as u16),
    ));

    let mut dst_addr = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let c = &*cmsg;
            if c.cmsg_level == SOL_IP && c.cmsg_type == libc::IP_RECVORIGDSTADDR {
                let data = libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in;
                let addr = *data;
                dst_addr = Some(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                    u16::from_be(addr.sin_port as u16),
                ));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let dst = dst_addr.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "original destination unavailable (missing IP_RECVORIGDSTADDR cmsg)",
        )
    })?;

    Ok((n as usize, src_addr, dst))
}

fn set_ip_transparent(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_IP,
            libc::IP_TRANSPARENT,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_recv_orig_dst_addr(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_IP,
            libc::IP_RECVORIGDSTADDR,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
