//! UDP multicast MPEG-TS ingest (spec.md §4.C).
//!
//! Grounded on `examples/original_source/udpsource.go` (`UdpSource`,
//! `RecvBuf`, `RunLoop`, `RecvLoop`). The receive-buffer pool, its two
//! bounded channels, and the two-actor split (`RecvLoop` does the blocking
//! read, `RunLoop` does everything else) carry over directly; what changes
//! is how a packet batch crosses the channel boundary to a sink.
//!
//! Go's `RunLoop` hands `sink.Packets` a `[]mpeg.TsBuffer` — slices that
//! borrow straight from `rx.Buf`, which is recycled to the ready pool
//! immediately after the send. That's a race even in the original (nothing
//! stops `RecvLoop` from overwriting `rx.Buf` while the sink is still
//! writing it out), tolerated there because Go's GC keeps the backing array
//! alive and the window is narrow. Rust can't tolerate that race at all, so
//! this implementation closes it instead of copying around it: a `RecvBuf`
//! that turns out to hold at least one valid packet has its *ownership*,
//! not a borrow of it, handed to the bound sink inside a [`PacketBatch`].
//! [`PacketBatch`] stores the validated packet start offsets
//! (`SmallVec<[u16; 16]>`) alongside the buffer and reconstructs
//! [`TsPacketView`]s from them on demand — no per-datagram allocation. The
//! buffer returns to the `Ready` pool when the batch is dropped, which in
//! practice means after the sink has finished its vectored write; until
//! then `recv_loop` simply works with a smaller pool, never with a stale
//! buffer.
//!
//! Multicast join/leave failures and socket listen errors are fatal
//! (spec.md §7: they reflect misconfiguration, not a transient condition).
//! `run_loop` reports these on the `RecError` channel returned by
//! [`UdpSource::bind`] and flips a shared `stopping` flag that `recv_loop`
//! checks on every dequeue from `Ready`, so it exits rather than spinning on
//! a broken socket; the caller (`bin/recstation.rs`) is expected to treat
//! receipt on that channel as fatal and terminate the process.

use std::collections::HashMap;
use std::io::IoSlice;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use smallvec::SmallVec;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{RecError, Result};
use crate::netutil::{enable_pktinfo, interface_ipv4, recvmsg_with_pktinfo};
use crate::preview::PreviewInput;
use crate::sink::SinkHandle;
use crate::ts::{TsPacketView, PID_PADDING, TS_PACKET_LEN};

/// Number of in-flight receive buffers kept cycling through the pool.
const NUM_INFLIGHT_PACKETS: usize = 2048;
/// Largest UDP datagram we'll accept; ~10 TS packets plus headroom.
const RAW_BUF_LEN: usize = 2048;
/// Ancillary (control message) buffer size, sized for one `IP_PKTINFO`.
const OOB_BUF_LEN: usize = 256;

/// A sink bound to a multicast group, plus its optional attached preview.
#[derive(Clone)]
pub struct SinkBinding {
    pub handle: SinkHandle,
    pub preview: Option<Arc<PreviewInput>>,
}

struct AddSinkMsg {
    group: Ipv4Addr,
    binding: SinkBinding,
}

enum ControlMsg {
    AddSink(AddSinkMsg),
    RemoveSink(Ipv4Addr),
    LeaveGroup(Ipv4Addr),
    ListenError(String),
    Shutdown,
}

/// Handle to a running UDP multicast source.
#[derive(Clone)]
pub struct UdpSource {
    control_tx: mpsc::Sender<ControlMsg>,
}

impl UdpSource {
    /// Binds a UDP socket on `listen_addr`, enables `IP_PKTINFO` so each
    /// datagram's original destination (multicast group) address can be
    /// recovered, and starts the `RecvLoop`/`RunLoop` actor pair.
    ///
    /// Returns the source handle alongside a receiver that yields exactly
    /// once, with the error that made the source give up (a failed
    /// multicast join/leave, or a broken listen socket) — the caller is
    /// expected to treat receipt on it as fatal.
    pub fn bind(iface_name: &str, listen_addr: SocketAddr) -> Result<(Self, mpsc::Receiver<RecError>)> {
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

        let std_socket: std::net::UdpSocket = socket.into();
        let udp = UdpSocket::from_std(std_socket)
            .map_err(|e| RecError::Config(format!("UdpSocket::from_std: {}", e)))?;
        let udp = Arc::new(udp);

        let iface_addr = interface_ipv4(iface_name)?;

        let (control_tx, control_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = mpsc::channel(NUM_INFLIGHT_PACKETS);
        let (pending_tx, pending_rx) = mpsc::channel(NUM_INFLIGHT_PACKETS);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let stopping = Arc::new(AtomicBool::new(false));

        for _ in 0..NUM_INFLIGHT_PACKETS {
            let _ = ready_tx.try_send(RecvBuf::new());
        }

        tokio::spawn(recv_loop(
            udp.clone(),
            ready_rx,
            pending_tx,
            control_tx.clone(),
            stopping.clone(),
        ));
        tokio::spawn(run_loop(
            udp, iface_addr, control_rx, pending_rx, ready_tx, fatal_tx, stopping,
        ));

        Ok((UdpSource { control_tx }, fatal_rx))
    }

    /// Joins `group`'s multicast membership on the bound interface and
    /// binds `binding` to receive its packets.
    pub async fn add_sink(&self, group: Ipv4Addr, binding: SinkBinding) {
        let _ = self
            .control_tx
            .send(ControlMsg::AddSink(AddSinkMsg { group, binding }))
            .await;
    }

    /// Unbinds whatever sink is currently receiving `group`'s packets,
    /// without leaving the multicast membership.
    pub async fn remove_sink(&self, group: Ipv4Addr) {
        let _ = self.control_tx.send(ControlMsg::RemoveSink(group)).await;
    }

    /// Leaves `group`'s multicast membership on the bound interface.
    pub async fn leave_group(&self, group: Ipv4Addr) {
        let _ = self.control_tx.send(ControlMsg::LeaveGroup(group)).await;
    }

    /// Requests a controlled shutdown of the receive-buffer pool (spec.md
    /// §4.C): flips the shared `stopping` flag, which `recv_loop` observes
    /// on its next dequeue from `Ready` and exits instead of reading the
    /// socket again.
    pub async fn shutdown(&self) {
        let _ = self.control_tx.send(ControlMsg::Shutdown).await;
    }
}

struct RecvBuf {
    raw: Box<[u8; RAW_BUF_LEN]>,
    len: usize,
    src: Option<Ipv4Addr>,
    dst: Option<Ipv4Addr>,
    error: Option<std::io::Error>,
}

impl RecvBuf {
    fn new() -> Self {
        RecvBuf {
            raw: Box::new([0u8; RAW_BUF_LEN]),
            len: 0,
            src: None,
            dst: None,
            error: None,
        }
    }
}

/// A batch of validated TS packets, still backed by the receive buffer that
/// owned the original datagram. Holds that buffer by value — no copy, no
/// refcount — so the steady-state ingest path allocates nothing; the
/// buffer is returned to the `Ready` pool when the batch is dropped.
pub struct PacketBatch {
    buf: Option<RecvBuf>,
    offsets: SmallVec<[u16; 16]>,
    release: mpsc::Sender<RecvBuf>,
}

impl PacketBatch {
    /// Builds a batch directly from whole 188-byte packets, for sink tests
    /// that don't need a real receive buffer behind them.
    #[cfg(test)]
    pub(crate) fn for_test(packets: &[Vec<u8>]) -> Self {
        let mut buf = RecvBuf::new();
        let mut offsets: SmallVec<[u16; 16]> = SmallVec::new();
        let mut off = 0usize;
        for pkt in packets {
            assert_eq!(pkt.len(), TS_PACKET_LEN);
            buf.raw[off..off + TS_PACKET_LEN].copy_from_slice(pkt);
            offsets.push(off as u16);
            off += TS_PACKET_LEN;
        }
        buf.len = off;
        let (release, _rx) = mpsc::channel(packets.len().max(1));
        PacketBatch {
            buf: Some(buf),
            offsets,
            release,
        }
    }

    fn buf(&self) -> &RecvBuf {
        self.buf
            .as_ref()
            .expect("PacketBatch buffer taken before batch was dropped")
    }

    /// `true` iff the batch carries no validated packets.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Total bytes across every packet in the batch.
    pub fn total_bytes(&self) -> usize {
        self.offsets.len() * TS_PACKET_LEN
    }

    /// Zero-copy views of each validated packet, in arrival order.
    pub fn packets(&self) -> impl Iterator<Item = TsPacketView<'_>> + '_ {
        let buf = self.buf();
        self.offsets.iter().map(move |&off| {
            let off = off as usize;
            TsPacketView::new(&buf.raw[off..off + TS_PACKET_LEN])
        })
    }

    /// `IoSlice`s for a single vectored write of the whole batch, in
    /// arrival order.
    pub fn io_slices(&self) -> SmallVec<[IoSlice<'_>; 16]> {
        let buf = self.buf();
        self.offsets
            .iter()
            .map(|&off| IoSlice::new(&buf.raw[off as usize..off as usize + TS_PACKET_LEN]))
            .collect()
    }
}

impl Drop for PacketBatch {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            // `Ready`'s capacity equals the pool size and every buffer is
            // accounted for in exactly one place at a time, so this should
            // never actually find the channel full; if it somehow does,
            // the buffer is simply not recycled rather than blocking a
            // synchronous `Drop` on an async send.
            if self.release.try_send(buf).is_err() {
                warn!("packet batch buffer could not be returned to the pool");
            }
        }
    }
}

async fn recv_loop(
    udp: Arc<UdpSocket>,
    mut ready_rx: mpsc::Receiver<RecvBuf>,
    pending_tx: mpsc::Sender<RecvBuf>,
    control_tx: mpsc::Sender<ControlMsg>,
    stopping: Arc<AtomicBool>,
) {
    let mut oob = [0u8; OOB_BUF_LEN];

    while let Some(mut rx) = ready_rx.recv().await {
        if stopping.load(Ordering::Acquire) {
            break;
        }

        let mut fatal_message = None;

        loop {
            let fd = udp.as_raw_fd();
            let result = udp
                .async_io(tokio::io::Interest::READABLE, || {
                    recvmsg_with_pktinfo(fd, &mut rx.raw[..], &mut oob[..])
                })
                .await;

            match result {
                Ok((0, _, _)) => continue,
                Ok((n, src, dst)) => {
                    rx.len = n;
                    rx.src = Some(src);
                    rx.dst = dst;
                    rx.error = None;
                    break;
                }
                Err(e) => {
                    fatal_message = Some(e.to_string());
                    rx.error = Some(e);
                    break;
                }
            }
        }

        if pending_tx.send(rx).await.is_err() {
            break;
        }

        if let Some(message) = fatal_message {
            let _ = control_tx.send(ControlMsg::ListenError(message)).await;
            break;
        }
    }
}

async fn run_loop(
    udp: Arc<UdpSocket>,
    iface_addr: Ipv4Addr,
    mut control_rx: mpsc::Receiver<ControlMsg>,
    mut pending_rx: mpsc::Receiver<RecvBuf>,
    ready_tx: mpsc::Sender<RecvBuf>,
    fatal_tx: mpsc::Sender<RecError>,
    stopping: Arc<AtomicBool>,
) {
    let mut sinks: HashMap<Ipv4Addr, SinkBinding> = HashMap::new();

    loop {
        tokio::select! {
            msg = control_rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    ControlMsg::AddSink(add) => {
                        info!("joining multicast group {}", add.group);
                        if let Err(e) = join_group(&udp, add.group, iface_addr) {
                            error!("failed to join {}: {}", add.group, e);
                            let _ = fatal_tx.send(e).await;
                            stopping.store(true, Ordering::Release);
                            break;
                        }
                        sinks.insert(add.group, add.binding);
                    }
                    ControlMsg::RemoveSink(group) => {
                        info!("removing sink for {}", group);
                        sinks.remove(&group);
                    }
                    ControlMsg::LeaveGroup(group) => {
                        if let Err(e) = leave_group(&udp, group, iface_addr) {
                            error!("failed to leave {}: {}", group, e);
                            let _ = fatal_tx.send(e).await;
                            stopping.store(true, Ordering::Release);
                            break;
                        }
                    }
                    ControlMsg::ListenError(message) => {
                        error!("udp listen error: {}", message);
                        let _ = fatal_tx
                            .send(RecError::Config(format!("udp listen error: {}", message)))
                            .await;
                        stopping.store(true, Ordering::Release);
                        break;
                    }
                    ControlMsg::Shutdown => {
                        stopping.store(true, Ordering::Release);
                        break;
                    }
                }
            }
            rx = pending_rx.recv() => {
                let Some(rx) = rx else { break };
                dispatch(rx, &sinks, &ready_tx).await;
            }
        }
    }
}

async fn dispatch(rx: RecvBuf, sinks: &HashMap<Ipv4Addr, SinkBinding>, ready_tx: &mpsc::Sender<RecvBuf>) {
    if let Some(e) = &rx.error {
        warn!("udp recv error: {}", e);
        let _ = ready_tx.send(rx).await;
        return;
    }

    let Some(dst) = rx.dst else {
        let _ = ready_tx.send(rx).await;
        return;
    };

    let mut offsets: SmallVec<[u16; 16]> = SmallVec::new();
    let mut off = 0usize;
    while off + TS_PACKET_LEN <= rx.len {
        let view = TsPacketView::new(&rx.raw[off..off + TS_PACKET_LEN]);
        if view.is_valid() && view.pid() != PID_PADDING {
            offsets.push(off as u16);
        }
        off += TS_PACKET_LEN;
    }

    if offsets.is_empty() {
        let _ = ready_tx.send(rx).await;
        return;
    }

    let Some(binding) = sinks.get(&dst) else {
        let _ = ready_tx.send(rx).await;
        return;
    };

    if let Some(preview) = &binding.preview {
        let slices: SmallVec<[IoSlice<'_>; 16]> = offsets
            .iter()
            .map(|&o| IoSlice::new(&rx.raw[o as usize..o as usize + TS_PACKET_LEN]))
            .collect();
        preview.write_vectored(&slices).await;
    }

    let batch = PacketBatch {
        buf: Some(rx),
        offsets,
        release: ready_tx.clone(),
    };
    binding.handle.packets(batch).await;
}

fn join_group(udp: &UdpSocket, group: Ipv4Addr, iface_addr: Ipv4Addr) -> Result<()> {
    udp.join_multicast_v4(group, iface_addr)
        .map_err(|e| RecError::Config(format!("join_multicast_v4 {}: {}", group, e)))
}

fn leave_group(udp: &UdpSocket, group: Ipv4Addr, iface_addr: Ipv4Addr) -> Result<()> {
    udp.leave_multicast_v4(group, iface_addr)
        .map_err(|e| RecError::Config(format!("leave_multicast_v4 {}: {}", group, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ts_packet(pid: u16, valid: bool) -> Vec<u8> {
        let mut pkt = vec![0u8; TS_PACKET_LEN];
        pkt[0] = if valid { 0x47 } else { 0x00 };
        pkt[1] = ((pid >> 8) as u8) & 0x1F;
        pkt[2] = (pid & 0xFF) as u8;
        pkt
    }

    #[tokio::test]
    async fn dispatch_drops_invalid_and_padding_packets() {
        let mut raw = vec![0u8; RAW_BUF_LEN];
        let packets = [
            build_ts_packet(0x100, true),
            build_ts_packet(0, false),
            build_ts_packet(PID_PADDING, true),
            build_ts_packet(0x101, true),
        ];
        let mut offset = 0;
        for pkt in &packets {
            raw[offset..offset + TS_PACKET_LEN].copy_from_slice(pkt);
            offset += TS_PACKET_LEN;
        }

        let rx = RecvBuf {
            raw: Box::new(raw.try_into().unwrap()),
            len: offset,
            src: Some(Ipv4Addr::new(10, 0, 0, 1)),
            dst: Some(Ipv4Addr::new(239, 1, 1, 1)),
            error: None,
        };

        let sink = crate::sink::spawn("test", |_| String::new());
        let binding = SinkBinding { handle: sink.clone(), preview: None };
        let mut sinks = HashMap::new();
        sinks.insert(Ipv4Addr::new(239, 1, 1, 1), binding);

        let (ready_tx, _ready_rx) = mpsc::channel(4);
        dispatch(rx, &sinks, &ready_tx).await;

        sink.open_file().await;
        let status = sink.status().await.unwrap();
        // two of the four packets (0x100, 0x101) are valid and non-padding.
        assert_eq!(status.bytes_in, 2 * TS_PACKET_LEN as u64);
    }

    #[tokio::test]
    async fn dispatch_recycles_a_buffer_with_no_destination_immediately() {
        let rx = RecvBuf::new();
        let sinks = HashMap::new();
        let (ready_tx, mut ready_rx) = mpsc::channel(1);

        dispatch(rx, &sinks, &ready_tx).await;

        assert!(ready_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn dispatch_recycles_a_buffer_dropped_by_sink_once_packets_are_written() {
        let mut raw = vec![0u8; RAW_BUF_LEN];
        let pkt = build_ts_packet(0x100, true);
        raw[..TS_PACKET_LEN].copy_from_slice(&pkt);

        let rx = RecvBuf {
            raw: Box::new(raw.try_into().unwrap()),
            len: TS_PACKET_LEN,
            src: Some(Ipv4Addr::new(10, 0, 0, 1)),
            dst: Some(Ipv4Addr::new(239, 1, 1, 1)),
            error: None,
        };

        let sink = crate::sink::spawn("test", |_| String::new());
        let binding = SinkBinding { handle: sink.clone(), preview: None };
        let mut sinks = HashMap::new();
        sinks.insert(Ipv4Addr::new(239, 1, 1, 1), binding);

        let (ready_tx, mut ready_rx) = mpsc::channel(NUM_INFLIGHT_PACKETS);
        dispatch(rx, &sinks, &ready_tx).await;

        // the sink processes `Packets` before any later message, so by the
        // time `status()`'s round trip completes the batch (and with it
        // the buffer) has already been dropped and recycled.
        sink.status().await.unwrap();
        assert!(ready_rx.recv().await.is_some());
    }

    #[test]
    fn recv_buf_raw_array_is_sized_for_ten_ts_packets() {
        assert!(RAW_BUF_LEN >= 10 * TS_PACKET_LEN);
    }

    #[tokio::test]
    async fn recv_loop_exits_when_stopping_flag_is_set() {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp = Arc::new(socket);
        let (control_tx, _control_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (pending_tx, mut pending_rx) = mpsc::channel(1);
        let stopping = Arc::new(AtomicBool::new(true));

        ready_tx.send(RecvBuf::new()).await.unwrap();
        drop(ready_tx);

        recv_loop(udp, ready_rx, pending_tx, control_tx, stopping).await;

        assert!(pending_rx.recv().await.is_none());
    }
}
