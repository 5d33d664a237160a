//! Installer-package decoding: container parsing, chunked-stream
//! decompression, payload unpacking, and metadata assembly.

pub mod cpio;
pub mod error;
pub mod extract;
pub mod metadata;
pub mod pbzx;
pub mod sniff;
pub mod xar;

pub use cpio::PayloadContents;
pub use error::ExtractError;
pub use extract::{extract, extract_path, extract_url, extract_with_contents};
pub use metadata::{IncludedBundle, InstallerMetadata, PayloadDescriptor};
pub use sniff::Encoding;
pub use xar::{XarArchive, XarEntry};

/// User Agent string for remote package downloads
pub const USER_AGENT: &str = concat!("pkgsift-core/", env!("CARGO_PKG_VERSION"));
