//! Shared low-level networking helpers used by both the UDP ingest source
//! and the heartbeat listener: `IP_PKTINFO` ancillary data and multicast
//! interface address resolution. Neither `tokio::net::UdpSocket` nor
//! `socket2::Socket` exposes a way to recover a multicast datagram's
//! original destination address, so both callers go through raw
//! `recvmsg(2)` via `libc`.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use crate::error::{RecError, Result};

/// Resolves the first IPv4 address assigned to network interface `name`,
/// used as the local interface for multicast group membership.
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    use nix::ifaddrs::getifaddrs;

    let addrs = getifaddrs().map_err(|e| RecError::Config(format!("getifaddrs: {}", e)))?;
    for iface in addrs {
        if iface.interface_name != name {
            continue;
        }
        if let Some(address) = iface.address {
            if let Some(sin) = address.as_sockaddr_in() {
                return Ok(Ipv4Addr::from(sin.ip()));
            }
        }
    }

    Err(RecError::Config(format!(
        "interface '{}' has no IPv4 address",
        name
    )))
}

/// Enables `IP_PKTINFO` on `fd` so that subsequent `recvmsg(2)` calls can
/// report each datagram's original destination address.
pub fn enable_pktinfo(fd: RawFd) -> std::io::Result<()> {
    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Reads one datagram via `recvmsg(2)`, returning its length, source
/// address, and (if present) the `IP_PKTINFO`-derived original destination
/// address — the multicast group the datagram was sent to.
pub fn recvmsg_with_pktinfo(
    fd: RawFd,
    buf: &mut [u8],
    oob: &mut [u8],
) -> std::io::Result<(usize, Ipv4Addr, Option<Ipv4Addr>)> {
    unsafe {
        let mut src_addr: libc::sockaddr_in = std::mem::zeroed();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_name = &mut src_addr as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as u32;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = oob.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = oob.len() as _;

        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let src = Ipv4Addr::from(u32::from_be(src_addr.sin_addr.s_addr));

        let mut dst = None;
        let mut cmsg_ptr = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg_ptr.is_null() {
            let cmsg = &*cmsg_ptr;
            if cmsg.cmsg_level == libc::IPPROTO_IP && cmsg.cmsg_type == libc::IP_PKTINFO {
                let pktinfo = &*(libc::CMSG_DATA(cmsg_ptr) as *const libc::in_pktinfo);
                dst = Some(Ipv4Addr::from(u32::from_be(pktinfo.ipi_addr.s_addr)));
            }
            cmsg_ptr = libc::CMSG_NXTHDR(&msg, cmsg_ptr);
        }

        Ok((n as usize, src, dst))
    }
}
