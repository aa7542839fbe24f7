//! PAT (Program Association Table) parsing with CRC-32 validation.
//!
//! Grounded on `examples/original_source/mpeg/pat.go` and
//! `examples/original_source/mpeg/tables.go` (`ParseTable`/`ParsePAT`),
//! adapted to borrow from the packet view rather than Go's shared-buffer
//! struct fields. Reuses the teacher's [`crate::utils::Crc32Mpeg2`] for the
//! section CRC, as its non-reflected ISO/IEC 13818-1 polynomial table and
//! `calculate` signature are exactly what a PSI section CRC needs (the
//! retrieved Go snapshot instead calls Go's built-in reflected
//! `crc32.IEEETable`, left commented out in favour of hand-picked
//! polynomial constants that were never wired in — evidently unfinished;
//! this implementation uses the mathematically correct table instead, the
//! same call made for the `SetPid` fix in `ts::packet`).

use smallvec::SmallVec;

use crate::ts::packet::{TsPacketView, PID_PAT};
use crate::utils::Crc32Mpeg2;

const TABLE_HEADER_LEN: usize = 3;
const LONG_SUBHEADER_LEN: usize = 5;
const CRC_LEN: usize = 4;
const ENTRY_LEN: usize = 4;

const PROGRAM_NUMBER_UNUSED: u16 = 0xFFFF;

/// A single PAT entry, after the `program_number == 0xFFFF` filler has been
/// skipped (spec.md §3, Testable Property #10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEntry {
    /// Program number this entry describes.
    pub program_number: u16,
    /// `Some(pid)` when `program_number == 0` (network PID entry).
    pub network_pid: Option<u16>,
    /// `Some(pid)` when `program_number != 0` (program map PID entry).
    pub program_map_pid: Option<u16>,
}

/// A parsed Program Association Table section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pat {
    /// Transport stream identifier from the long-form subheader.
    pub transport_stream_id: u16,
    /// PSI version number.
    pub version_number: u8,
    /// `current_next_indicator` flag.
    pub current_next: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
    /// Parsed entries, in section order, `0xFFFF` fillers already skipped.
    pub entries: SmallVec<[PatEntry; 16]>,
}

impl Pat {
    /// The first program map PID named by this table, if any. This is the
    /// value the sink caches as its "current PMT PID" per spec.md §4.D.
    pub fn first_program_map_pid(&self) -> Option<u16> {
        self.entries.iter().find_map(|e| e.program_map_pid)
    }
}

/// A PAT CRC mismatch, reported with both values so the caller can log them
/// (spec.md §4.A: "the actual and declared CRC must both be reported").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcMismatch {
    /// CRC declared in the section trailer.
    pub declared: u32,
    /// CRC computed over the section bytes.
    pub actual: u32,
}

/// Reasons a PAT parse can fail. None of these are fatal to a caller; per
/// spec.md §7 the caller logs and drops the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatError {
    /// The packet's PID was not 0.
    WrongPid,
    /// Remaining payload was shorter than a required header.
    TooShort,
    /// The declared section length exceeds the remaining payload.
    SectionTooLong,
    /// The section claimed a CRC and it didn't match.
    Crc(CrcMismatch),
}

/// Parses a PAT section out of a single TS packet.
///
/// Does not reassemble sections split across multiple packets; PAT sections
/// fit in one packet in every stream this crate has been asked to record
/// (spec.md's own PAT description assumes the same single-packet shape).
pub fn parse_pat(view: TsPacketView<'_>) -> Result<Pat, PatError> {
    if view.pid() != PID_PAT {
        return Err(PatError::WrongPid);
    }

    let payload = view.payload();
    let mut offs = 0usize;

    if view.pusi() {
        if payload.is_empty() {
            return Err(PatError::TooShort);
        }
        let pointer_field = payload[0] as usize;
        offs += 1;
        if payload.len() < offs + pointer_field {
            return Err(PatError::TooShort);
        }
        offs += pointer_field;
    }

    let remaining = &payload[offs..];
    if remaining.len() < TABLE_HEADER_LEN {
        return Err(PatError::TooShort);
    }

    let b0 = remaining[0];
    let b1 = remaining[1];
    let b2 = remaining[2];

    let private_indicator = (b1 & 0x40) != 0;
    let section_length = (((b1 & 0x0F) as usize) << 8) | b2 as usize;

    let after_header = &remaining[TABLE_HEADER_LEN..];
    if section_length > after_header.len() {
        return Err(PatError::SectionTooLong);
    }

    let (body_len, has_crc) = if private_indicator {
        if section_length < CRC_LEN {
            return Err(PatError::TooShort);
        }
        (section_length - CRC_LEN, true)
    } else {
        (section_length, false)
    };

    let body = &after_header[..body_len];

    if has_crc {
        let declared_bytes = &after_header[body_len..body_len + CRC_LEN];
        let declared = u32::from_be_bytes([
            declared_bytes[0],
            declared_bytes[1],
            declared_bytes[2],
            declared_bytes[3],
        ]);

        let crc_input_len = TABLE_HEADER_LEN + body_len;
        let crc_input = &remaining[..crc_input_len];
        let actual = Crc32Mpeg2::new().calculate(crc_input);

        if actual != declared {
            return Err(PatError::Crc(CrcMismatch { declared, actual }));
        }
    }

    if body.len() < LONG_SUBHEADER_LEN {
        return Err(PatError::TooShort);
    }

    let transport_stream_id = ((body[0] as u16) << 8) | body[1] as u16;
    let version_number = (body[2] & 0x3E) >> 1;
    let current_next = (body[2] & 0x01) != 0;
    let section_number = body[3];
    let last_section_number = body[4];

    let mut entries = SmallVec::new();
    let mut rest = &body[LONG_SUBHEADER_LEN..];
    while rest.len() >= ENTRY_LEN {
        let e0 = rest[0];
        let e1 = rest[1];
        let e2 = rest[2];
        let e3 = rest[3];
        rest = &rest[ENTRY_LEN..];

        let program_number = ((e0 as u16) << 8) | e1 as u16;
        if program_number == PROGRAM_NUMBER_UNUSED {
            continue;
        }

        let pid = (((e2 & 0x1F) as u16) << 8) | e3 as u16;

        entries.push(if program_number == 0 {
            PatEntry {
                program_number,
                network_pid: Some(pid),
                program_map_pid: None,
            }
        } else {
            PatEntry {
                program_number,
                network_pid: None,
                program_map_pid: Some(pid),
            }
        });
    }

    let _ = b0; // table_id, unused beyond the CRC input window

    Ok(Pat {
        transport_stream_id,
        version_number,
        current_next,
        section_number,
        last_section_number,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::packet::{TsPacketViewMut, TS_PACKET_LEN};

    fn build_pat_packet(entries: &[(u16, u16)], with_pointer: bool) -> [u8; TS_PACKET_LEN] {
        let mut section = Vec::new();
        section.push(0x00); // table_id
        section.push(0x00); // placeholder for flags/len high, filled below
        section.push(0x00); // placeholder for len low

        let mut body = Vec::new();
        body.push(0x00); // transport_stream_id hi
        body.push(0x01); // transport_stream_id lo
        body.push(0xC1); // version=0, current_next=1
        body.push(0x00); // section_number
        body.push(0x00); // last_section_number
        for &(program_number, pid) in entries {
            body.push((program_number >> 8) as u8);
            body.push((program_number & 0xFF) as u8);
            body.push(0xE0 | ((pid >> 8) as u8 & 0x1F));
            body.push((pid & 0xFF) as u8);
        }

        let section_length = body.len() + 4; // + CRC
        section[1] = 0xC0 | (((section_length >> 8) as u8) & 0x0F); // syntax+private indicator set
        section[2] = (section_length & 0xFF) as u8;
        section.extend_from_slice(&body);

        let crc = Crc32Mpeg2::new().calculate(&section);
        section.extend_from_slice(&crc.to_be_bytes());

        let mut buf = [0u8; TS_PACKET_LEN];
        buf[0] = 0x47;
        let mut offset = 4usize;
        {
            let mut view = TsPacketViewMut::new(&mut buf);
            view.set_pid(0);
            view.set_pusi(true);
            view.set_afc(crate::ts::packet::AFC_PAYLOAD_ONLY);
        }
        if with_pointer {
            buf[4] = 0x00;
            offset += 1;
        }
        buf[offset..offset + section.len()].copy_from_slice(&section);
        buf
    }

    #[test]
    fn parses_single_program_pat() {
        let buf = build_pat_packet(&[(1, 0x100)], true);
        let pat = parse_pat(TsPacketView::new(&buf)).expect("pat should parse");
        assert_eq!(pat.entries.len(), 1);
        assert_eq!(pat.first_program_map_pid(), Some(0x100));
        assert_eq!(pat.transport_stream_id, 1);
    }

    #[test]
    fn skips_unused_program_number_filler() {
        let buf = build_pat_packet(&[(0xFFFF, 0x1FF), (2, 0x200)], true);
        let pat = parse_pat(TsPacketView::new(&buf)).unwrap();
        assert_eq!(pat.entries.len(), 1);
        assert_eq!(pat.entries[0].program_number, 2);
        assert_eq!(pat.first_program_map_pid(), Some(0x200));
    }

    #[test]
    fn rejects_wrong_pid() {
        let mut buf = build_pat_packet(&[(1, 0x100)], true);
        {
            let mut view = TsPacketViewMut::new(&mut buf);
            view.set_pid(0x20);
        }
        assert_eq!(parse_pat(TsPacketView::new(&buf)), Err(PatError::WrongPid));
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut buf = build_pat_packet(&[(1, 0x100)], true);
        let last = buf.iter().rposition(|&b| b != 0).unwrap();
        buf[last] ^= 0xFF;
        match parse_pat(TsPacketView::new(&buf)) {
            Err(PatError::Crc(mismatch)) => assert_ne!(mismatch.declared, mismatch.actual),
            other => panic!("expected CRC mismatch, got {:?}", other),
        }
    }
}
