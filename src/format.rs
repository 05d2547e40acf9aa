// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The on-disk experience file format.
//!
//! An experience file is a leading ASCII signature identifying the format
//! version, followed immediately (no terminator) by a flat sequence of
//! fixed-size 24-byte records. The record size is an invariant used to
//! validate files: a file matches a version only if its length minus the
//! signature length divides evenly into records.
//!
//! Two versions exist. The current version 2 record is
//! `key(8) | move(4) | value(4) | depth(4) | count(2) | 00 00`; the legacy
//! version 1 record has the same leading fields but no counter, padding the
//! tail with `00 FF 00 FF`. All fields are little-endian on disk regardless
//! of host byte order. Version 1 files are readable but never written;
//! loading one upgrades the file in place.

use thiserror::Error;

use crate::entry::ExperienceEntry;

/// Signature of the current (version 2) format.
pub const SIGNATURE_V2: &[u8] = b"SugaR Experience version 2";

/// Signature of the legacy (version 1) format.
pub const SIGNATURE_V1: &[u8] = b"SugaR";

/// Size of a single record on disk, both versions.
pub const ENTRY_SIZE: usize = 24;

/// Size of the write buffer used when streaming records to disk.
pub(crate) const WRITE_CHUNK: usize = if cfg!(debug_assertions) {
    1 << 10
} else {
    16 << 20
};

/// An on-disk format version.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    V1,
    V2,
}

impl Format {
    pub fn version(self) -> u32 {
        match self {
            Format::V1 => 1,
            Format::V2 => 2,
        }
    }

    pub fn signature(self) -> &'static [u8] {
        match self {
            Format::V1 => SIGNATURE_V1,
            Format::V2 => SIGNATURE_V2,
        }
    }

    pub fn is_current(self) -> bool {
        self == Format::V2
    }
}

/// Ways a file can fail to parse as an experience file.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("file is empty")]
    Empty,
    #[error("no experience signature matches a file of {0} bytes")]
    UnknownSignature(u64),
}

/// Identifies the format of a file from its length and leading bytes,
/// returning the matched version and the number of records that follow the
/// signature. Newer versions are tried first.
///
/// `header` must hold the first `min(len, SIGNATURE_V2.len())` bytes of the
/// file.
pub fn detect(header: &[u8], len: u64) -> Result<(Format, usize), FormatError> {
    if len == 0 {
        return Err(FormatError::Empty);
    }
    for format in [Format::V2, Format::V1] {
        let signature = format.signature();
        if len < signature.len() as u64 {
            continue;
        }
        let body = len - signature.len() as u64;
        if body % ENTRY_SIZE as u64 != 0 {
            continue;
        }
        if header.len() >= signature.len() && &header[..signature.len()] == signature {
            return Ok((format, (body / ENTRY_SIZE as u64) as usize));
        }
    }
    Err(FormatError::UnknownSignature(len))
}

/// Decodes one record in the given format.
pub fn decode(format: Format, raw: &[u8; ENTRY_SIZE]) -> ExperienceEntry {
    let key = u64::from_le_bytes(raw[0..8].try_into().unwrap());
    let mv = u32::from_le_bytes(raw[8..12].try_into().unwrap());
    let value = i32::from_le_bytes(raw[12..16].try_into().unwrap());
    let depth = i32::from_le_bytes(raw[16..20].try_into().unwrap());
    let count = match format {
        Format::V2 => u16::from_le_bytes(raw[20..22].try_into().unwrap()),
        // Version 1 had no counter; every record is a single observation.
        Format::V1 => 1,
    };
    ExperienceEntry {
        key,
        mv,
        value,
        depth,
        count,
    }
}

/// Encodes one record in the current format.
pub fn encode(entry: &ExperienceEntry) -> [u8; ENTRY_SIZE] {
    let mut raw = [0u8; ENTRY_SIZE];
    raw[0..8].copy_from_slice(&entry.key.to_le_bytes());
    raw[8..12].copy_from_slice(&entry.mv.to_le_bytes());
    raw[12..16].copy_from_slice(&entry.value.to_le_bytes());
    raw[16..20].copy_from_slice(&entry.depth.to_le_bytes());
    raw[20..22].copy_from_slice(&entry.count.to_le_bytes());
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_lengths() {
        assert_eq!(SIGNATURE_V2.len(), 26);
        assert_eq!(SIGNATURE_V1.len(), 5);
    }

    #[test]
    fn detect_prefers_v2() {
        let len = SIGNATURE_V2.len() as u64 + 2 * ENTRY_SIZE as u64;
        let (format, records) = detect(SIGNATURE_V2, len).unwrap();
        assert_eq!(format, Format::V2);
        assert_eq!(records, 2);
    }

    #[test]
    fn detect_v1() {
        let len = SIGNATURE_V1.len() as u64 + 3 * ENTRY_SIZE as u64;
        let (format, records) = detect(SIGNATURE_V1, len).unwrap();
        assert_eq!(format, Format::V1);
        assert_eq!(records, 3);
    }

    #[test]
    fn detect_rejects_partial_trailing_record() {
        let len = SIGNATURE_V2.len() as u64 + ENTRY_SIZE as u64 + 7;
        assert_eq!(
            detect(SIGNATURE_V2, len),
            Err(FormatError::UnknownSignature(len))
        );
    }

    #[test]
    fn detect_rejects_empty() {
        assert_eq!(detect(&[], 0), Err(FormatError::Empty));
    }

    #[test]
    fn detect_rejects_foreign_signature() {
        let header = b"PolyglotBook definitely no";
        let len = header.len() as u64 + ENTRY_SIZE as u64;
        assert!(detect(header, len).is_err());
    }

    #[test]
    fn record_round_trip() {
        let entry = ExperienceEntry {
            key: 0x1122_3344_5566_7788,
            mv: 0xABCD,
            value: -450,
            depth: 17,
            count: 9,
        };
        let raw = encode(&entry);
        assert_eq!(decode(Format::V2, &raw), entry);
        // Pad bytes are zero.
        assert_eq!(&raw[22..], &[0, 0]);
    }

    #[test]
    fn v1_records_default_to_one_observation() {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..8].copy_from_slice(&7u64.to_le_bytes());
        raw[8..12].copy_from_slice(&9u32.to_le_bytes());
        raw[12..16].copy_from_slice(&(-20i32).to_le_bytes());
        raw[16..20].copy_from_slice(&8i32.to_le_bytes());
        raw[20..24].copy_from_slice(&[0x00, 0xFF, 0x00, 0xFF]);
        let entry = decode(Format::V1, &raw);
        assert_eq!(entry.key, 7);
        assert_eq!(entry.mv, 9);
        assert_eq!(entry.value, -20);
        assert_eq!(entry.depth, 8);
        assert_eq!(entry.count, 1);
    }
}
