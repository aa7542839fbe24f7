//! # Utility Functions and Types
//!
//! Common helpers shared across the crate. Currently just CRC-32
//! calculation for PSI table validation — the crate's other bit-level needs
//! (TS header fields) are handled directly with masks in [`crate::ts`]
//! rather than through a general bitstream reader, since nothing here parses
//! a bitstream that isn't byte-aligned.
//!
//! ```rust
//! use recstation::utils::Crc32Mpeg2;
//!
//! let crc = Crc32Mpeg2::new();
//! let data = b"Hello, world!";
//! println!("CRC32: {:08x}", crc.calculate(data));
//! ```

/// CRC calculation implementations.
pub mod crc;

pub use crc::Crc32Mpeg2;
