//! Stream sources: UDP multicast ingest and subprocess audio capture.

/// UDP multicast MPEG-TS ingest (spec.md §4.C).
pub mod udp;

/// Subprocess-based audio capture (spec.md §4.E).
pub mod audio;

pub use udp::UdpSource;
