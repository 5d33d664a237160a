//! xar container reader.
//!
//! A xar archive is a fixed big-endian header, a zlib-compressed XML
//! table of contents, and a heap of per-entry data regions. Each entry
//! names its own encoding in the TOC; the chunked stream handled by
//! [`crate::pbzx`] only ever appears *inside* the Payload entry's bytes,
//! never as a per-entry encoding.

use std::io::{Read, Seek, SeekFrom};

use quick_xml::events::Event;

use crate::error::ExtractError;
use crate::sniff::{self, Encoding};

/// Magic bytes opening a xar archive: `xar!`.
pub const XAR_MAGIC: [u8; 4] = *b"xar!";

/// Size of the fixed portion of the xar header.
const HEADER_SIZE: usize = 28;

/// TOC encoding label meaning "no compression".
const ENCODING_NONE: &str = "application/octet-stream";

/// TOC encoding label for zlib-framed data. Historical: xar calls the
/// zlib framing "gzip", and some writers emit true gzip under the same
/// label, so [`XarArchive::read_entry`] accepts either framing here.
const ENCODING_GZIP: &str = "application/x-gzip";

/// TOC encoding label for bzip2 data.
const ENCODING_BZIP2: &str = "application/x-bzip2";

/// Parsed xar fixed header.
#[derive(Debug, Clone, Copy)]
pub struct XarHeader {
    /// Size of the on-disk header; the TOC follows immediately after.
    pub header_size: u16,
    /// Format version (1 for every archive in the wild).
    pub version: u16,
    /// Compressed length of the TOC.
    pub toc_length_compressed: u64,
    /// Uncompressed length of the TOC.
    pub toc_length_uncompressed: u64,
    /// Checksum algorithm identifier (unused by this reader).
    pub checksum_alg: u32,
}

/// One file entry from the table of contents.
///
/// Created once during TOC parse and immutable thereafter.
#[derive(Debug, Clone)]
pub struct XarEntry {
    /// Entry identifier, unique within the container.
    pub id: u64,
    /// Archive-relative path (nested `<file>` elements joined by `/`).
    pub path: String,
    /// Declared size after decompression.
    pub size: u64,
    /// On-heap (compressed) length.
    pub length: u64,
    /// Byte offset within the heap.
    pub offset: u64,
    /// Per-entry encoding label from the TOC.
    pub encoding: String,
    /// Whether the entry carries a data region (directories do not).
    pub has_data: bool,
}

/// A parsed xar archive over a seekable byte source.
pub struct XarArchive<R> {
    reader: R,
    header: XarHeader,
    entries: Vec<XarEntry>,
    heap_offset: u64,
}

impl<R> std::fmt::Debug for XarArchive<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XarArchive")
            .field("header", &self.header)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<R: Read + Seek> XarArchive<R> {
    /// Open a xar archive and parse its header and table of contents.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::MalformedContainer`] if the magic
    /// signature does not match or the TOC cannot be parsed.
    pub fn open(mut reader: R) -> Result<Self, ExtractError> {
        let header = parse_header(&mut reader)?;

        let mut compressed = vec![0u8; header.toc_length_compressed as usize];
        reader.seek(SeekFrom::Start(u64::from(header.header_size)))?;
        reader.read_exact(&mut compressed).map_err(|e| {
            ExtractError::MalformedContainer(format!("truncated table of contents: {e}"))
        })?;

        let mut toc_xml = Vec::with_capacity(header.toc_length_uncompressed as usize);
        flate2::read::ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut toc_xml)
            .map_err(|e| {
                ExtractError::MalformedContainer(format!("table of contents inflate failed: {e}"))
            })?;
        if toc_xml.len() as u64 != header.toc_length_uncompressed {
            return Err(ExtractError::MalformedContainer(format!(
                "table of contents inflated to {} bytes, header declares {}",
                toc_xml.len(),
                header.toc_length_uncompressed
            )));
        }

        let entries = parse_toc(&toc_xml)?;
        tracing::debug!(entries = entries.len(), "parsed container table of contents");

        let heap_offset = u64::from(header.header_size) + header.toc_length_compressed;
        Ok(Self {
            reader,
            header,
            entries,
            heap_offset,
        })
    }

    /// The parsed fixed header.
    pub fn header(&self) -> &XarHeader {
        &self.header
    }

    /// All entries, in TOC order.
    pub fn entries(&self) -> &[XarEntry] {
        &self.entries
    }

    /// Find an entry by exact archive-relative path.
    pub fn find(&self, path: &str) -> Option<&XarEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Find an entry by its TOC identifier.
    pub fn find_by_id(&self, id: u64) -> Option<&XarEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Find all entries whose path matches a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Pattern`] if the pattern is invalid.
    pub fn find_glob(&self, pattern: &str) -> Result<Vec<&XarEntry>, ExtractError> {
        let pattern = glob::Pattern::new(pattern)?;
        Ok(self
            .entries
            .iter()
            .filter(|e| pattern.matches(&e.path))
            .collect())
    }

    /// Materialize one entry's decompressed bytes, applying the
    /// per-entry encoding named in the TOC.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::UnsupportedEncoding`] for encoding labels
    /// this reader does not recognize, and
    /// [`ExtractError::MalformedContainer`] if the decoded size does not
    /// match the TOC declaration.
    pub fn read_entry(&mut self, entry: &XarEntry) -> Result<Vec<u8>, ExtractError> {
        let mut raw = vec![0u8; entry.length as usize];
        self.reader
            .seek(SeekFrom::Start(self.heap_offset + entry.offset))?;
        self.reader.read_exact(&mut raw).map_err(|e| {
            ExtractError::MalformedContainer(format!(
                "entry `{}`: truncated heap region at offset {}: {e}",
                entry.path, entry.offset
            ))
        })?;

        // Cap decoders one byte past the TOC-declared size so an entry
        // that inflates beyond its declaration is rejected without
        // materializing the excess. A zero declaration means unknown.
        let cap = if entry.size == 0 {
            u64::MAX
        } else {
            entry.size.saturating_add(1)
        };
        let decoded = match entry.encoding.as_str() {
            "" | ENCODING_NONE => raw,
            ENCODING_GZIP => {
                // The label covers both zlib and true gzip framing.
                let mut out = Vec::with_capacity(entry.size as usize);
                let result = if sniff::sniff(&raw) == Encoding::Gzip {
                    flate2::read::GzDecoder::new(&raw[..])
                        .take(cap)
                        .read_to_end(&mut out)
                } else {
                    flate2::read::ZlibDecoder::new(&raw[..])
                        .take(cap)
                        .read_to_end(&mut out)
                };
                result.map_err(|e| {
                    ExtractError::MalformedContainer(format!(
                        "entry `{}`: inflate failed: {e}",
                        entry.path
                    ))
                })?;
                out
            }
            ENCODING_BZIP2 => {
                let mut out = Vec::with_capacity(entry.size as usize);
                bzip2::read::BzDecoder::new(&raw[..])
                    .take(cap)
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        ExtractError::MalformedContainer(format!(
                            "entry `{}`: bzip2 decode failed: {e}",
                            entry.path
                        ))
                    })?;
                out
            }
            other => {
                return Err(ExtractError::UnsupportedEncoding {
                    entry: entry.path.clone(),
                    encoding: other.to_string(),
                });
            }
        };

        if entry.size != 0 && decoded.len() as u64 != entry.size {
            return Err(ExtractError::MalformedContainer(format!(
                "entry `{}`: decoded to {} bytes, TOC declares {}",
                entry.path,
                decoded.len(),
                entry.size
            )));
        }
        Ok(decoded)
    }
}

fn parse_header<R: Read>(reader: &mut R) -> Result<XarHeader, ExtractError> {
    let mut buf = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut buf)
        .map_err(|e| ExtractError::MalformedContainer(format!("short header: {e}")))?;

    if buf[..4] != XAR_MAGIC {
        return Err(ExtractError::MalformedContainer(
            "bad magic signature, not a xar archive".to_string(),
        ));
    }

    let header = XarHeader {
        header_size: u16::from_be_bytes([buf[4], buf[5]]),
        version: u16::from_be_bytes([buf[6], buf[7]]),
        toc_length_compressed: u64::from_be_bytes(buf[8..16].try_into().unwrap_or_default()),
        toc_length_uncompressed: u64::from_be_bytes(buf[16..24].try_into().unwrap_or_default()),
        checksum_alg: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
    };

    if usize::from(header.header_size) < HEADER_SIZE {
        return Err(ExtractError::MalformedContainer(format!(
            "header size {} below fixed minimum",
            header.header_size
        )));
    }
    Ok(header)
}

/// Partially-parsed `<file>` element, held on a stack while nested
/// children are read.
#[derive(Default)]
struct PendingFile {
    id: u64,
    name: String,
    offset: u64,
    length: u64,
    size: u64,
    encoding: String,
    has_data: bool,
    in_data: bool,
}

fn toc_error(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::MalformedContainer(format!("table of contents parse failed: {e}"))
}

fn parse_toc(xml: &[u8]) -> Result<Vec<XarEntry>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut stack: Vec<PendingFile> = Vec::new();
    let mut leaf: Option<Vec<u8>> = None;
    let mut buf = Vec::new();
    let mut saw_toc = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(toc_error)? {
            Event::Start(ref start) => {
                match start.local_name().as_ref() {
                    b"toc" => saw_toc = true,
                    b"file" => {
                        let mut pending = PendingFile::default();
                        for attr in start.attributes() {
                            let attr = attr.map_err(toc_error)?;
                            if attr.key.as_ref() == b"id" {
                                let value = attr.unescape_value().map_err(toc_error)?;
                                pending.id = value.parse().map_err(toc_error)?;
                            }
                        }
                        stack.push(pending);
                    }
                    b"data" => {
                        if let Some(top) = stack.last_mut() {
                            top.in_data = true;
                            top.has_data = true;
                        }
                    }
                    name => {
                        if stack.last().is_some() {
                            leaf = Some(name.to_vec());
                        }
                    }
                }
            }
            Event::Empty(ref start) => {
                if start.local_name().as_ref() == b"encoding" {
                    if let Some(top) = stack.last_mut() {
                        if top.in_data {
                            for attr in start.attributes() {
                                let attr = attr.map_err(toc_error)?;
                                if attr.key.as_ref() == b"style" {
                                    top.encoding =
                                        attr.unescape_value().map_err(toc_error)?.into_owned();
                                }
                            }
                        }
                    }
                }
            }
            Event::Text(ref text) => {
                let Some(element) = leaf.as_deref() else {
                    continue;
                };
                let Some(top) = stack.last_mut() else {
                    continue;
                };
                let value = text.unescape().map_err(toc_error)?;
                if top.in_data {
                    match element {
                        b"offset" => top.offset = value.parse().map_err(toc_error)?,
                        b"length" => top.length = value.parse().map_err(toc_error)?,
                        b"size" => top.size = value.parse().map_err(toc_error)?,
                        _ => {}
                    }
                } else if element == b"name" {
                    top.name = value.into_owned();
                }
            }
            Event::End(ref end) => match end.local_name().as_ref() {
                b"data" => {
                    if let Some(top) = stack.last_mut() {
                        top.in_data = false;
                    }
                }
                b"file" => {
                    let done = stack.pop().ok_or_else(|| {
                        toc_error("unbalanced file element".to_string())
                    })?;
                    let path = stack
                        .iter()
                        .map(|f| f.name.as_str())
                        .chain(std::iter::once(done.name.as_str()))
                        .collect::<Vec<_>>()
                        .join("/");
                    entries.push(XarEntry {
                        id: done.id,
                        path,
                        size: done.size,
                        length: done.length,
                        offset: done.offset,
                        encoding: done.encoding,
                        has_data: done.has_data,
                    });
                }
                _ => leaf = None,
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_toc {
        return Err(ExtractError::MalformedContainer(
            "table of contents missing <toc> element".to_string(),
        ));
    }
    Ok(entries)
}
