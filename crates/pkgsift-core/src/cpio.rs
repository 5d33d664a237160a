//! "New ASCII" cpio archive unpacking.
//!
//! Payload archives use the newc (`070701`) or crc (`070702`) variant:
//! a 110-byte header of fixed-width hexadecimal ASCII fields, the
//! NUL-terminated entry name, then the body, with header+name and body
//! each padded to a 4-byte boundary. The archive's total length is not
//! always known up front, so iteration simply stops at the trailer
//! record, end of stream, or an unreadable header — none of which are
//! errors.

use std::collections::BTreeMap;
use std::io::Read;

use crate::error::ExtractError;

/// Magic for the newc (SVR4, no checksum) variant.
pub const NEWC_MAGIC: &[u8; 6] = b"070701";

/// Magic for the crc (SVR4 with checksum) variant.
pub const CRC_MAGIC: &[u8; 6] = b"070702";

/// Name of the terminating trailer record.
pub const TRAILER: &str = "TRAILER!!!";

/// Fixed header length: magic plus thirteen 8-digit hex fields.
const HEADER_SIZE: usize = 110;

/// What the payload bytes turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadContents {
    /// A recognized archive, unpacked to a path → bytes map.
    Archive(BTreeMap<String, Vec<u8>>),
    /// Not an archive at all; the raw decompressed bytes, kept verbatim.
    /// Some payload variants ship pre-extracted content.
    Flat(Vec<u8>),
}

/// Unpack a payload stream.
///
/// Probes the first record's magic: without it the remaining bytes are
/// returned as [`PayloadContents::Flat`] rather than an error. Regular
/// files land in the map with `./` prefixes stripped; directories,
/// symlinks, and other special entries are skipped.
///
/// # Errors
///
/// Only genuine I/O failures from the underlying reader are propagated;
/// truncation is a normal terminal condition.
pub fn unpack<R: Read>(mut reader: R) -> Result<PayloadContents, ExtractError> {
    let mut magic = [0u8; 6];
    let got = read_up_to(&mut reader, &mut magic)?;
    if got < magic.len() || (&magic != NEWC_MAGIC && &magic != CRC_MAGIC) {
        let mut flat = magic[..got].to_vec();
        reader.read_to_end(&mut flat).map_err(position_error(0))?;
        tracing::debug!(len = flat.len(), "payload is not a cpio archive, storing verbatim");
        return Ok(PayloadContents::Flat(flat));
    }

    let mut files = BTreeMap::new();
    let mut record: u64 = 0;
    loop {
        let Some(header) = read_header(&mut reader, record)? else {
            break;
        };
        if header.name == TRAILER {
            break;
        }

        let mut body = vec![0u8; header.filesize as usize];
        if read_up_to(&mut reader, &mut body).map_err(position_error(record))? < body.len() {
            // Truncated body: keep what unpacked so far.
            break;
        }
        skip(&mut reader, pad4(header.filesize as usize)).map_err(position_error(record))?;

        if header.is_file() {
            let name = header
                .name
                .trim_start_matches("./")
                .trim_start_matches('/');
            if !name.is_empty() && name != "." {
                files.insert(name.to_string(), body);
            }
        }
        record += 1;

        let mut next_magic = [0u8; 6];
        if read_up_to(&mut reader, &mut next_magic)? < next_magic.len()
            || (&next_magic != NEWC_MAGIC && &next_magic != CRC_MAGIC)
        {
            break;
        }
    }
    Ok(PayloadContents::Archive(files))
}

struct RecordHeader {
    mode: u32,
    filesize: u32,
    name: String,
}

impl RecordHeader {
    fn is_file(&self) -> bool {
        (self.mode & 0o170_000) == 0o100_000
    }
}

/// Read one record header (magic already consumed). Returns `None` on a
/// truncated or unparseable header, the normal terminal condition.
fn read_header<R: Read>(reader: &mut R, record: u64) -> Result<Option<RecordHeader>, ExtractError> {
    let mut fields = [0u8; HEADER_SIZE - 6];
    if read_up_to(reader, &mut fields).map_err(position_error(record))? < fields.len() {
        return Ok(None);
    }

    let Some(mode) = hex_field(&fields, 1) else {
        return Ok(None);
    };
    let Some(filesize) = hex_field(&fields, 6) else {
        return Ok(None);
    };
    let Some(namesize) = hex_field(&fields, 11) else {
        return Ok(None);
    };

    let mut name_buf = vec![0u8; namesize as usize];
    if read_up_to(reader, &mut name_buf).map_err(position_error(record))? < name_buf.len() {
        return Ok(None);
    }
    // Header plus name is padded to a 4-byte boundary.
    skip(reader, pad4(HEADER_SIZE + namesize as usize)).map_err(position_error(record))?;

    let name = String::from_utf8_lossy(
        name_buf.strip_suffix(&[0]).unwrap_or(&name_buf),
    )
    .into_owned();
    Ok(Some(RecordHeader {
        mode,
        filesize,
        name,
    }))
}

/// Decode the `n`-th 8-digit hexadecimal field after the magic.
fn hex_field(fields: &[u8], n: usize) -> Option<u32> {
    let raw = fields.get(n * 8..(n + 1) * 8)?;
    let text = std::str::from_utf8(raw).ok()?;
    u32::from_str_radix(text, 16).ok()
}

fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn skip<R: Read>(reader: &mut R, n: usize) -> std::io::Result<()> {
    std::io::copy(&mut reader.take(n as u64), &mut std::io::sink())?;
    Ok(())
}

/// Read until the buffer is full or the stream ends; returns the byte
/// count so callers can distinguish truncation from success.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ExtractError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn position_error<E: Into<ExtractError>>(record: u64) -> impl FnOnce(E) -> ExtractError {
    move |e| match e.into() {
        ExtractError::Io(io) => ExtractError::Io(std::io::Error::other(format!(
            "archive record {record}: {io}"
        ))),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a newc archive from (name, body, mode) records plus trailer.
    pub(crate) fn build_archive(records: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, body, mode) in records {
            push_record(&mut out, name, body, *mode);
        }
        push_record(&mut out, TRAILER, b"", 0);
        out
    }

    fn push_record(out: &mut Vec<u8>, name: &str, body: &[u8], mode: u32) {
        let namesize = name.len() + 1;
        out.extend_from_slice(NEWC_MAGIC);
        for field in [
            0,                 // ino
            mode,              // mode
            0,                 // uid
            0,                 // gid
            1,                 // nlink
            0,                 // mtime
            body.len() as u32, // filesize
            0,                 // devmajor
            0,                 // devminor
            0,                 // rdevmajor
            0,                 // rdevminor
            namesize as u32,   // namesize
            0,                 // check
        ] {
            out.extend_from_slice(format!("{field:08x}").as_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.resize(out.len() + pad4(HEADER_SIZE + namesize), 0);
        out.extend_from_slice(body);
        out.resize(out.len() + pad4(body.len()), 0);
    }

    #[test]
    fn test_two_records_preserve_exact_lengths() {
        let a = vec![1u8; 50];
        let b = vec![2u8; 30];
        let archive = build_archive(&[
            ("a/Info.plist", &a, 0o100_644),
            ("b/Info.plist", &b, 0o100_644),
        ]);

        let PayloadContents::Archive(files) = unpack(&archive[..]).unwrap() else {
            panic!("expected archive");
        };
        assert_eq!(files.len(), 2);
        assert_eq!(files["a/Info.plist"].len(), 50);
        assert_eq!(files["b/Info.plist"].len(), 30);
        assert_eq!(files["a/Info.plist"], a);
        assert_eq!(files["b/Info.plist"], b);
    }

    #[test]
    fn test_directories_and_symlinks_skipped() {
        let archive = build_archive(&[
            ("./usr", b"", 0o040_755),
            ("./usr/bin/tool", b"#!/bin/sh\n", 0o100_755),
            ("./usr/bin/alias", b"tool", 0o120_777),
        ]);

        let PayloadContents::Archive(files) = unpack(&archive[..]).unwrap() else {
            panic!("expected archive");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files["usr/bin/tool"], b"#!/bin/sh\n");
    }

    #[test]
    fn test_non_archive_payload_is_flat() {
        let data = b"just some pre-extracted bytes";
        assert_eq!(
            unpack(&data[..]).unwrap(),
            PayloadContents::Flat(data.to_vec())
        );
    }

    #[test]
    fn test_empty_input_is_flat() {
        assert_eq!(unpack(&[][..]).unwrap(), PayloadContents::Flat(Vec::new()));
    }

    #[test]
    fn test_truncated_header_is_normal_termination() {
        let mut archive = build_archive(&[("kept", b"data", 0o100_644)]);
        // Second record's header cut off mid-way; the trailer vanishes too.
        archive.truncate(archive.len() - 40);
        let mut second = Vec::new();
        push_record(&mut second, "lost", b"xxxx", 0o100_644);
        archive.extend_from_slice(&second[..30]);

        let PayloadContents::Archive(files) = unpack(&archive[..]).unwrap() else {
            panic!("expected archive");
        };
        assert!(files.contains_key("kept"));
    }

    /// Serves its bytes then fails with a real I/O error, unlike plain
    /// truncation which just reports end of stream.
    struct DyingReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for DyingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(std::io::Error::other("device disconnected"));
            }
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_io_failure_carries_record_position() {
        // First record plus the second record's magic, then the reader
        // dies while the second header is being read.
        let mut data = Vec::new();
        push_record(&mut data, "kept", b"data", 0o100_644);
        data.extend_from_slice(NEWC_MAGIC);

        let result = unpack(DyingReader { data, pos: 0 });
        match result {
            Err(ExtractError::Io(e)) => {
                assert!(e.to_string().contains("archive record 1"), "{e}");
            }
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn test_crc_variant_accepted() {
        let mut archive = build_archive(&[("f", b"x", 0o100_644)]);
        archive[..6].copy_from_slice(CRC_MAGIC);

        let PayloadContents::Archive(files) = unpack(&archive[..]).unwrap() else {
            panic!("expected archive");
        };
        assert_eq!(files["f"], b"x");
    }
}
