//! Extraction entry points.
//!
//! Control flow: open the container and parse its table of contents,
//! locate the Payload entry, sniff its encoding, run the chunked-stream
//! pipeline (or a whole-stream decoder) into the archive unpacker, then
//! assemble metadata from the union of container entries and unpacked
//! payload files. No behavior is configured externally; everything is
//! derived from the bytes.

use std::collections::BTreeMap;
use std::io::Read;
use std::io::Seek;
use std::path::Path;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::cpio::{self, PayloadContents};
use crate::error::ExtractError;
use crate::metadata::{self, InstallerMetadata, PackageRef, PayloadDescriptor};
use crate::pbzx;
use crate::sniff::{self, Encoding};
use crate::xar::{XarArchive, XarEntry};

/// Sentinel key under which a non-archive payload's raw bytes are kept.
pub const FLAT_PAYLOAD_KEY: &str = "Payload";

/// Extract installer metadata from a seekable byte source.
///
/// # Errors
///
/// Returns a single classified [`ExtractError`]; partial results are
/// never produced alongside an error.
pub async fn extract<R>(source: R) -> Result<InstallerMetadata, ExtractError>
where
    R: Read + Seek + Send + 'static,
{
    let (meta, _) = extract_with_contents(source).await?;
    Ok(meta)
}

/// Extract metadata together with the payload's unpacked contents.
///
/// # Errors
///
/// Same classification as [`extract`].
pub async fn extract_with_contents<R>(
    source: R,
) -> Result<(InstallerMetadata, PayloadDescriptor), ExtractError>
where
    R: Read + Seek + Send + 'static,
{
    let opened = open_container(source).await?;
    let Some((entry, raw)) = opened.payload else {
        return Err(ExtractError::MissingContent(
            "no Payload entry found in container".to_string(),
        ));
    };

    let encoding = sniff::sniff(&raw);
    let compressed_size = entry.length;
    tracing::debug!(
        entry = %entry.path,
        ?encoding,
        compressed = compressed_size,
        "unpacking payload"
    );
    let (chunked, contents) = unpack_payload(raw, &entry).await?;

    let mut files = match contents {
        PayloadContents::Archive(map) => map,
        PayloadContents::Flat(raw) => {
            BTreeMap::from([(FLAT_PAYLOAD_KEY.to_string(), raw)])
        }
    };
    // Union with descriptor files stored directly in the container;
    // payload entries win on a name collision.
    for (name, data) in opened.container_descriptors {
        files.entry(name).or_insert(data);
    }

    let meta = metadata::assemble(&opened.refs, &files, entry.size)?;
    let descriptor = PayloadDescriptor {
        entry_id: entry.id,
        path: entry.path,
        size: entry.size,
        compressed_size,
        encoding: entry.encoding,
        chunked,
        files,
    };
    Ok((meta, descriptor))
}

/// Extract installer metadata from a package file on disk.
///
/// # Errors
///
/// Same classification as [`extract`], plus I/O errors opening the file.
pub async fn extract_path(path: impl AsRef<Path>) -> Result<InstallerMetadata, ExtractError> {
    let file = std::fs::File::open(path.as_ref())?;
    extract(file).await
}

/// Download a remote package to a temporary file and extract it.
///
/// The temporary file is removed unconditionally when this returns.
///
/// # Errors
///
/// Same classification as [`extract`], plus HTTP failures.
pub async fn extract_url(url: &str) -> Result<InstallerMetadata, ExtractError> {
    let temp = tempfile::NamedTempFile::new()?;
    let mut file = tokio::fs::File::from_std(temp.reopen()?);

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
        .send()
        .await?
        .error_for_status()?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    extract_path(temp.path()).await
}

/// Everything pulled out of the container before payload unpacking.
struct Opened {
    /// The Payload entry and its (per-entry-decoded) raw bytes.
    payload: Option<(XarEntry, Bytes)>,
    /// Package references from `Distribution` / `PackageInfo` entries.
    refs: Vec<PackageRef>,
    /// Bundle descriptor files stored at container level.
    container_descriptors: BTreeMap<String, Vec<u8>>,
}

async fn open_container<R>(source: R) -> Result<Opened, ExtractError>
where
    R: Read + Seek + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut archive = XarArchive::open(source)?;

        // A product archive can hold several sub-packages; the largest
        // Payload is the one carrying the application bundle.
        let mut payload_entries: Vec<XarEntry> = archive
            .entries()
            .iter()
            .filter(|e| e.has_data && (e.path == "Payload" || e.path.ends_with("/Payload")))
            .cloned()
            .collect();
        payload_entries.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
        let payload = match payload_entries.first() {
            Some(entry) => {
                let data = archive.read_entry(entry)?;
                Some((entry.clone(), Bytes::from(data)))
            }
            None => None,
        };

        let mut refs: Vec<PackageRef> = Vec::new();
        let descriptor_entries: Vec<XarEntry> = archive
            .entries()
            .iter()
            .filter(|e| {
                e.has_data
                    && (e.path == "Distribution"
                        || e.path == "PackageInfo"
                        || e.path.ends_with("/PackageInfo"))
            })
            .cloned()
            .collect();
        for entry in descriptor_entries {
            let data = archive.read_entry(&entry)?;
            match metadata::parse_package_refs(&data) {
                Ok(parsed) => merge_refs(&mut refs, parsed),
                Err(e) => {
                    tracing::warn!(entry = %entry.path, "unparseable package descriptor: {e}");
                }
            }
        }

        let mut container_descriptors = BTreeMap::new();
        let plist_entries: Vec<XarEntry> = archive
            .entries()
            .iter()
            .filter(|e| e.has_data && e.path.rsplit('/').next() == Some("Info.plist"))
            .cloned()
            .collect();
        for entry in plist_entries {
            let data = archive.read_entry(&entry)?;
            container_descriptors.insert(entry.path, data);
        }

        Ok(Opened {
            payload,
            refs,
            container_descriptors,
        })
    })
    .await
    .map_err(|e| ExtractError::Io(std::io::Error::other(e)))?
}

/// Merge package references parsed from multiple descriptor entries,
/// keeping first-seen order and filling gaps on duplicates.
fn merge_refs(refs: &mut Vec<PackageRef>, parsed: Vec<PackageRef>) {
    for package in parsed {
        if let Some(existing) = refs.iter_mut().find(|r| r.identifier == package.identifier) {
            existing.version = existing.version.take().or(package.version);
            existing.install_location = existing
                .install_location
                .take()
                .or(package.install_location);
            existing.install_kbytes = existing.install_kbytes.take().or(package.install_kbytes);
        } else {
            refs.push(package);
        }
    }
}

/// Decompress and unpack the Payload entry's bytes. Returns whether the
/// payload was independently chunk-compressed along with its contents.
async fn unpack_payload(
    raw: Bytes,
    entry: &XarEntry,
) -> Result<(bool, PayloadContents), ExtractError> {
    match sniff::sniff(&raw) {
        Encoding::Pbzx => {
            let (reader, driver) = pbzx::spawn(raw)?.into_parts();
            let unpack = tokio::task::spawn_blocking(move || cpio::unpack(reader));
            let (unpacked, driven) = tokio::join!(unpack, driver);
            // The pipeline's first error wins: an unpack failure behind
            // a broken stream is a consequence, not the cause.
            driven.map_err(|e| ExtractError::Io(std::io::Error::other(e)))??;
            let contents = unpacked.map_err(|e| ExtractError::Io(std::io::Error::other(e)))??;
            Ok((true, contents))
        }
        encoding @ (Encoding::Gzip | Encoding::Zlib | Encoding::Bzip2) => {
            let path = entry.path.clone();
            let contents = tokio::task::spawn_blocking(move || {
                let mut decoded = Vec::new();
                let result = match encoding {
                    Encoding::Gzip => {
                        flate2::read::GzDecoder::new(raw.as_ref()).read_to_end(&mut decoded)
                    }
                    Encoding::Zlib => {
                        flate2::read::ZlibDecoder::new(raw.as_ref()).read_to_end(&mut decoded)
                    }
                    _ => bzip2::read::BzDecoder::new(raw.as_ref()).read_to_end(&mut decoded),
                };
                result.map_err(|e| {
                    ExtractError::MalformedContainer(format!(
                        "entry `{path}`: payload inflate failed: {e}"
                    ))
                })?;
                cpio::unpack(&decoded[..])
            })
            .await
            .map_err(|e| ExtractError::Io(std::io::Error::other(e)))??;
            Ok((false, contents))
        }
        Encoding::Raw => {
            let contents =
                tokio::task::spawn_blocking(move || cpio::unpack(raw.as_ref()))
                    .await
                    .map_err(|e| ExtractError::Io(std::io::Error::other(e)))??;
            Ok((false, contents))
        }
    }
}
