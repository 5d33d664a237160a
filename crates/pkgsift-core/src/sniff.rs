//! Content-sniffing of payload encodings.
//!
//! All behavior downstream of the container reader is derived from the
//! bytes themselves, never from file names or configuration.

/// Magic bytes opening a chunked payload stream.
pub const PBZX_MAGIC: [u8; 4] = *b"pbzx";

/// Magic bytes opening a gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Magic bytes opening a bzip2 stream.
pub const BZIP2_MAGIC: [u8; 3] = *b"BZh";

/// The encoding of a byte blob, as classified by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Apple's chunked compression stream (`pbzx` magic).
    Pbzx,
    /// A gzip stream.
    Gzip,
    /// A bzip2 stream.
    Bzip2,
    /// A raw zlib stream.
    Zlib,
    /// No recognized framing; the bytes are used as-is.
    Raw,
}

/// Classify a blob by its magic-byte prefix.
///
/// Unknown prefixes classify as [`Encoding::Raw`], which is a deliberate
/// pass-through fallback rather than an error: some payloads arrive
/// already decompressed by an outer layer.
pub fn sniff(data: &[u8]) -> Encoding {
    if data.len() >= 4 && data[..4] == PBZX_MAGIC {
        return Encoding::Pbzx;
    }
    if data.len() >= 2 && data[..2] == GZIP_MAGIC {
        return Encoding::Gzip;
    }
    if data.len() >= 3 && data[..3] == BZIP2_MAGIC {
        return Encoding::Bzip2;
    }
    // zlib: CMF byte 0x78 (deflate, 32K window) and a valid FCHECK,
    // i.e. the first two bytes as a big-endian value divide by 31.
    if data.len() >= 2
        && data[0] == 0x78
        && ((u16::from(data[0]) << 8) | u16::from(data[1])) % 31 == 0
    {
        return Encoding::Zlib;
    }
    Encoding::Raw
}
