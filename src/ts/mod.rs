//! # MPEG Transport Stream packet view & PAT parsing
//!
//! Zero-copy accessors over the 188-byte TS packets that flow through the
//! ingest pipeline, plus a PAT (Program Association Table) parser with
//! CRC-32 validation. Neither module allocates on the hot path.

/// Zero-copy TS packet header accessors/mutators.
pub mod packet;

/// PAT section parsing.
pub mod pat;

pub use packet::{TsPacketView, TsPacketViewMut, PID_PADDING, PID_PAT, TS_PACKET_LEN};
pub use pat::{parse_pat, Pat, PatEntry, PatError};
