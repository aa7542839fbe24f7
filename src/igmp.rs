//! Periodic IGMPv2 membership report emission.
//!
//! Out of scope for spec.md's "interesting" core (§1), but named as a
//! required external contract in §6, so it is carried as a small
//! self-contained module. Grounded directly on
//! `examples/original_source/src/recstation/igmp.go`
//! (`IgmpMembership.SendMembershipReport`, `ChecksumRfc1071`,
//! `SendPeriodicIgmpMembershipReports`): builds an 8-byte IGMPv2 membership
//! report, prepends a hand-built IPv4 header, computes the RFC 1071
//! checksum, and re-sends it periodically per joined group so upstream
//! routers that expect periodic reports (rather than relying solely on the
//! kernel's own IGMP join machinery) keep forwarding traffic.
//!
//! The original uses `golang.org/x/net/ipv4.RawConn`, which builds the IPv4
//! header for the caller. Rust has no equivalent in this pack's dependency
//! set, so the header is built by hand here (20 bytes, no options) and sent
//! over an `IPPROTO_RAW`/`IP_HDRINCL` socket — the standard raw-socket
//! idiom for "I supply my own IP header".

use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use log::warn;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::time;

use crate::error::{RecError, Result};

const IGMP_V2_MEMBERSHIP_REPORT: u8 = 0x16;
const IGMP_PROTOCOL: i32 = 2;
const ONE_TENTH_SECOND: Duration = Duration::from_millis(100);
const MAX_RESPONSE_TIME: Duration = Duration::from_secs(1);
const GROUP_OFFSET: Duration = Duration::from_millis(250);
const SEND_PERIOD: Duration = Duration::from_secs(5);

/// Starts one periodic-report task per group in `groups`, each staggered by
/// `GROUP_OFFSET` so they don't all hit the wire at once. Runs until the
/// process exits; a send failure logs and stops that group's task (mirrors
/// the original `break`-out-of-loop-on-error behaviour).
pub fn spawn_periodic_reports(groups: Vec<Ipv4Addr>) -> Result<()> {
    for (i, group) in groups.into_iter().enumerate() {
        let socket = new_raw_socket()?;
        tokio::spawn(async move {
            time::sleep(GROUP_OFFSET * (i as u32 + 1)).await;

            let mut tick = time::interval(SEND_PERIOD);
            loop {
                tick.tick().await;
                if let Err(e) = send_membership_report(&socket, group) {
                    warn!("failed to send IGMP membership for {}: {}", group, e);
                    break;
                }
            }
        });
    }

    Ok(())
}

/// Sets `IP_HDRINCL` directly via `setsockopt(2)`, the same raw-fd approach
/// `netutil::enable_pktinfo` uses for `IP_PKTINFO` — `socket2`'s own
/// header-included helper has churned across versions, so this sidesteps it.
fn enable_hdrincl(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn new_raw_socket() -> Result<Socket> {
    let socket = Socket::new(
        Domain::IPV4,
        Type::RAW,
        Some(Protocol::from(IGMP_PROTOCOL)),
    )
    .map_err(|e| RecError::Config(format!("igmp raw socket: {}", e)))?;
    enable_hdrincl(socket.as_raw_fd())
        .map_err(|e| RecError::Config(format!("IP_HDRINCL: {}", e)))?;
    Ok(socket)
}

fn send_membership_report(socket: &Socket, group: Ipv4Addr) -> std::io::Result<()> {
    let packet = build_ipv4_igmp_packet(group);
    let dst = SockAddr::from(std::net::SocketAddrV4::new(group, 0));
    socket.send_to(&packet, &dst)?;
    Ok(())
}

/// Builds a 20-byte IPv4 header (no options) followed by the 8-byte IGMPv2
/// membership report, as `IgmpMembership.SendMembershipReport` does via
/// `ipv4.Header` + the hand-built `pkt` array.
fn build_ipv4_igmp_packet(group: Ipv4Addr) -> [u8; 28] {
    let max_response_time = (MAX_RESPONSE_TIME.as_millis() / ONE_TENTH_SECOND.as_millis()) as u8;

    let mut igmp = [0u8; 8];
    igmp[0] = IGMP_V2_MEMBERSHIP_REPORT;
    igmp[1] = max_response_time;
    igmp[4..8].copy_from_slice(&group.octets());
    let checksum = checksum_rfc1071(&igmp);
    igmp[2] = (checksum >> 8) as u8;
    igmp[3] = (checksum & 0xff) as u8;

    let total_len: u16 = 20 + 8;
    let mut pkt = [0u8; 28];
    pkt[0] = (4 << 4) | 5; // version 4, IHL 5 (20 bytes, no options)
    pkt[1] = 0xc0; // DSCP CS6, matching the original's ipv4.Header.TOS
    pkt[2..4].copy_from_slice(&total_len.to_be_bytes());
    pkt[8] = 10; // TTL
    pkt[9] = IGMP_PROTOCOL as u8;
    pkt[16..20].copy_from_slice(&group.octets()); // destination address
    let ip_checksum = checksum_rfc1071(&pkt[0..20]);
    pkt[10] = (ip_checksum >> 8) as u8;
    pkt[11] = (ip_checksum & 0xff) as u8;
    pkt[20..28].copy_from_slice(&igmp);

    pkt
}

/// RFC 1071 one's-complement checksum, identical in structure to the
/// original's `ChecksumRfc1071`.
fn checksum_rfc1071(buf: &[u8]) -> u16 {
    let mut checksum: u32 = 0;
    let mut i = 0;
    while i + 1 < buf.len() {
        checksum += ((buf[i] as u32) << 8) + buf[i + 1] as u32;
        i += 2;
    }
    if buf.len() % 2 == 1 {
        checksum += (buf[buf.len() - 1] as u32) << 8;
    }
    while checksum > 0xffff {
        checksum = (checksum & 0xffff) + (checksum >> 16);
    }
    !(checksum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_all_zero_buffer_is_all_ones() {
        let buf = [0u8; 8];
        assert_eq!(checksum_rfc1071(&buf), 0xffff);
    }

    #[test]
    fn checksum_handles_odd_length_buffers() {
        let buf = [0x01u8, 0x02, 0x03];
        let checksum = checksum_rfc1071(&buf);
        // not asserting an exact value beyond "it terminates and folds
        // into 16 bits" — the original's algorithm is reproduced verbatim.
        assert!(checksum <= 0xffff);
    }

    #[test]
    fn membership_report_carries_the_group_address() {
        let group = Ipv4Addr::new(239, 1, 1, 1);
        let pkt = build_ipv4_igmp_packet(group);
        assert_eq!(&pkt[20..24], &[IGMP_V2_MEMBERSHIP_REPORT, 10, pkt[22], pkt[23]]);
        assert_eq!(&pkt[24..28], &group.octets());
        assert_eq!(&pkt[16..20], &group.octets());
    }
}
