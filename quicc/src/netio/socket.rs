//! Client UDP socket setup.
//!
//! Sockets are created unbound with socket2, configured and bound to the
//! wildcard address of the peer's family at start time, then handed to tokio.
//! The same option set is applied to the primary and the happy-eyeballs
//! secondary socket.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::TransportSettings;

/// Create an unbound UDP socket matching the peer address family.
pub fn create_socket(peer: &SocketAddr) -> Result<Socket> {
    let domain = match peer {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")
}

/// Apply client socket options and bind to the family wildcard.
///
/// Client sockets never share a port: reuse-address stays off. PMTUD policy
/// and the error-queue opt-in follow the transport settings.
pub fn setup_socket(socket: &Socket, peer: &SocketAddr, settings: &TransportSettings) -> Result<()> {
    socket
        .set_reuse_address(false)
        .context("clearing SO_REUSEADDR")?;

    let wildcard: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    socket
        .bind(&wildcard.into())
        .with_context(|| format!("binding UDP socket to {wildcard}"))?;

    configure_pmtud(socket, peer, settings.turnoff_pmtud)?;

    if settings.enable_socket_err_msg_callback {
        configure_recverr(socket, peer)?;
    }

    if settings.connect_udp {
        socket
            .connect(&(*peer).into())
            .with_context(|| format!("connecting UDP socket to {peer}"))?;
    }
    Ok(())
}

/// Move a configured socket onto the tokio reactor.
pub fn into_tokio(socket: Socket) -> Result<tokio::net::UdpSocket> {
    socket
        .set_nonblocking(true)
        .context("setting O_NONBLOCK")?;
    tokio::net::UdpSocket::from_std(socket.into()).context("registering socket with tokio")
}

/// PMTUD policy: with `turnoff_pmtud` we ask the kernel to probe (never set
/// DF on fragments), otherwise we pin DF so the path MTU holds.
#[cfg(target_os = "linux")]
fn configure_pmtud(socket: &Socket, peer: &SocketAddr, turnoff_pmtud: bool) -> Result<()> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = if turnoff_pmtud {
        libc::IP_PMTUDISC_PROBE
    } else {
        libc::IP_PMTUDISC_DO
    };
    let (level, optname) = match peer {
        SocketAddr::V4(_) => (libc::IPPROTO_IP, libc::IP_MTU_DISCOVER),
        SocketAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER),
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            optname,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error()).context("setting MTU discover mode");
    }
    Ok(())
}

/// Portable fallback: no probing support, DF stays at the platform default.
#[cfg(not(target_os = "linux"))]
fn configure_pmtud(_socket: &Socket, _peer: &SocketAddr, turnoff_pmtud: bool) -> Result<()> {
    if turnoff_pmtud {
        tracing::warn!("PMTUD probing not available on this platform");
    }
    Ok(())
}

/// Ask the kernel to queue ICMP errors on the socket so sends surface them.
#[cfg(target_os = "linux")]
fn configure_recverr(socket: &Socket, peer: &SocketAddr) -> Result<()> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = 1;
    let (level, optname) = match peer {
        SocketAddr::V4(_) => (libc::IPPROTO_IP, libc::IP_RECVERR),
        SocketAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_RECVERR),
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            optname,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error()).context("setting IP_RECVERR");
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn configure_recverr(_socket: &Socket, _peer: &SocketAddr) -> Result<()> {
    tracing::warn!("socket error-queue reporting not available on this platform");
    Ok(())
}
