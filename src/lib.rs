#![doc(html_root_url = "https://docs.rs/recstation/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # recstation
//!
//! A multi-stream recording station for MPEG transport-stream video
//! delivered over IPv4 multicast, augmented with a locally captured audio
//! stream. `recstation` joins a configured set of multicast groups, tracks
//! the liveness of remote senders via a heartbeat protocol, and for each
//! live group opens a dedicated recording sink that writes validated
//! MPEG-TS packets to a rotated file on disk. A local audio device is
//! captured, re-encoded to MPEG-TS/AAC, and recorded through the same sink
//! machinery. An HTTP control surface exposes start/stop/status and
//! per-sink JPEG preview frames.
//!
//! ## Module overview
//!
//! - [`ts`] — zero-copy TS packet views and PAT parsing with CRC-32
//!   validation.
//! - [`proc`] — subprocess pipe wiring and exit reporting, shared by the
//!   audio source and preview.
//! - [`source`] — multicast UDP ingest and subprocess audio capture.
//! - [`sink`] — per-stream file recording state machine.
//! - [`heartbeat`] — per-sender liveness watchdogs, ONLINE/OFFLINE events.
//! - [`coordinator`] — owns the sink map, drives RECORD/STOP/STATUS/PREVIEW
//!   and file rotation.
//! - [`preview`] — per-sink JPEG snapshot serving.
//! - [`config`] — JSON configuration and CLI parsing.
//! - [`filename`] — `{{key}}` output filename template expansion.
//! - [`igmp`] — periodic IGMPv2 membership report emission.
//! - [`http`] — the `/api/v1/*` control surface.
//! - [`error`] — the crate's error type.

/// Crate-wide error type.
pub mod error;

/// Configuration file and CLI parsing.
pub mod config;

/// Shared low-level networking helpers (`IP_PKTINFO`, interface lookup).
pub mod netutil;

/// Zero-copy TS packet view and PAT parsing.
pub mod ts;

/// CRC-32 and other small shared utilities.
pub mod utils;

/// Subprocess pipe wiring and exit reporting.
pub mod proc;

/// Per-stream recording sink.
pub mod sink;

/// Stream sources: UDP multicast ingest and subprocess audio capture.
pub mod source;

/// Heartbeat-driven sink liveness tracking.
pub mod heartbeat;

/// Per-sink JPEG preview.
pub mod preview;

/// Output filename template expansion.
pub mod filename;

/// Periodic IGMPv2 membership report emission.
pub mod igmp;

/// Central event coordinator.
pub mod coordinator;

/// HTTP control surface.
pub mod http;

pub use error::{RecError, Result};
