//! Installer metadata assembly.
//!
//! Walks the union of container entries and unpacked payload files,
//! parses bundle descriptors (`Info.plist`) and package descriptors
//! (`PackageInfo` / `Distribution`), and builds the final
//! [`InstallerMetadata`] value.

use std::collections::BTreeMap;

use quick_xml::events::Event;
use serde::Serialize;

use crate::error::ExtractError;

/// Descriptor file name recognized inside payloads.
const DESCRIPTOR_NAME: &str = "Info.plist";

/// Aggregate metadata extracted from one installer package.
///
/// Constructed once per extraction and returned by value; extraction is
/// deterministic, so equal inputs produce equal values.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstallerMetadata {
    /// Bundle identifier of the primary application bundle.
    pub bundle_id: String,
    /// Short version string of the primary bundle.
    pub version: String,
    /// Declared install location (defaults to `/`).
    pub install_location: String,
    /// Bundles included beyond the primary one, in path order.
    pub included_bundles: Vec<IncludedBundle>,
    /// Top-level package identifiers, in descriptor order.
    pub package_ids: Vec<String>,
    /// Distinct declared install paths, in descriptor order.
    pub install_paths: Vec<String>,
    /// Minimum OS version required by the primary bundle, if declared.
    pub min_os_version: Option<String>,
    /// Declared install size in bytes.
    pub size: u64,
}

/// One nested bundle discovered inside the payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IncludedBundle {
    /// The bundle's identifier.
    pub bundle_id: String,
    /// The bundle's short version string.
    pub version: String,
    /// Bundle directory path within the payload.
    pub path: String,
    /// Internal build version (`CFBundleVersion`), if declared.
    pub build_version: Option<String>,
}

/// The Payload container entry together with its unpacked contents.
#[derive(Debug, Clone)]
pub struct PayloadDescriptor {
    /// Identifier of the owning container entry.
    pub entry_id: u64,
    /// Archive-relative path of the entry.
    pub path: String,
    /// Declared size after decompression.
    pub size: u64,
    /// On-heap (compressed) length.
    pub compressed_size: u64,
    /// Per-entry encoding label from the table of contents.
    pub encoding: String,
    /// Whether the entry's bytes were an independently chunk-compressed
    /// stream (as opposed to plain or whole-stream compression).
    pub chunked: bool,
    /// Extracted file path → content. For non-archive payloads this
    /// holds the raw bytes under the sentinel `Payload` key.
    pub files: BTreeMap<String, Vec<u8>>,
}

/// One `pkg-info` / `pkg-ref` descriptor from a container entry.
#[derive(Debug, Clone, Default)]
pub struct PackageRef {
    /// Package identifier.
    pub identifier: String,
    /// Package version, if declared.
    pub version: Option<String>,
    /// Declared install location, if any.
    pub install_location: Option<String>,
    /// Declared install size in kilobytes, if any.
    pub install_kbytes: Option<u64>,
}

/// Parsed keys of one bundle descriptor.
#[derive(Debug, Default)]
struct BundleDescriptor {
    bundle_id: Option<String>,
    short_version: Option<String>,
    build_version: Option<String>,
    min_os_version: Option<String>,
}

/// Parse a `PackageInfo` or `Distribution` XML document into package
/// references: `pkg-info` elements (component packages) and `pkg-ref`
/// elements carrying an identifier (product archives). The declared
/// install size lives on the `<payload installKBytes="..">` child of a
/// `pkg-info` element, not on the element itself.
pub(crate) fn parse_package_refs(data: &[u8]) -> Result<Vec<PackageRef>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut refs: Vec<PackageRef> = Vec::new();
    // Index of the ref whose pkg-info element is currently open.
    let mut open: Option<usize> = None;
    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            ExtractError::MalformedContainer(format!("package descriptor parse failed: {e}"))
        })?;
        match event {
            Event::Start(ref start) | Event::Empty(ref start) => {
                let has_children = matches!(event, Event::Start(_));
                match start.local_name().as_ref() {
                    name @ (b"pkg-info" | b"pkg-ref") => {
                        let mut package = PackageRef::default();
                        for attr in start.attributes() {
                            let Ok(attr) = attr else { continue };
                            let Ok(value) = attr.unescape_value() else {
                                continue;
                            };
                            match attr.key.as_ref() {
                                b"identifier" | b"id" => package.identifier = value.into_owned(),
                                b"version" => package.version = Some(value.into_owned()),
                                b"install-location" => {
                                    package.install_location = Some(value.into_owned());
                                }
                                b"installKBytes" => {
                                    package.install_kbytes = value.parse().ok();
                                }
                                _ => {}
                            }
                        }
                        if package.identifier.is_empty() {
                            buf.clear();
                            continue;
                        }
                        // pkg-ref elements repeat; merge by identifier so
                        // later occurrences fill in missing attributes.
                        let idx = if let Some(pos) =
                            refs.iter().position(|r| r.identifier == package.identifier)
                        {
                            let existing = &mut refs[pos];
                            existing.version = existing.version.take().or(package.version);
                            existing.install_location =
                                existing.install_location.take().or(package.install_location);
                            existing.install_kbytes =
                                existing.install_kbytes.take().or(package.install_kbytes);
                            pos
                        } else {
                            refs.push(package);
                            refs.len() - 1
                        };
                        if has_children && name == b"pkg-info" {
                            open = Some(idx);
                        }
                    }
                    b"payload" => {
                        let Some(idx) = open else {
                            buf.clear();
                            continue;
                        };
                        for attr in start.attributes() {
                            let Ok(attr) = attr else { continue };
                            if attr.key.as_ref() == b"installKBytes" {
                                if let Ok(value) = attr.unescape_value() {
                                    refs[idx].install_kbytes =
                                        refs[idx].install_kbytes.take().or(value.parse().ok());
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref end) => {
                if end.local_name().as_ref() == b"pkg-info" {
                    open = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(refs)
}

fn parse_descriptor(data: &[u8]) -> Result<BundleDescriptor, plist::Error> {
    let value = plist::Value::from_reader(std::io::Cursor::new(data))?;
    let mut descriptor = BundleDescriptor::default();
    if let Some(dict) = value.as_dictionary() {
        let get = |key: &str| dict.get(key).and_then(|v| v.as_string()).map(String::from);
        descriptor.bundle_id = get("CFBundleIdentifier");
        descriptor.short_version = get("CFBundleShortVersionString");
        descriptor.build_version = get("CFBundleVersion");
        descriptor.min_os_version = get("LSMinimumSystemVersion");
    }
    Ok(descriptor)
}

/// Whether a payload path names a bundle descriptor, and if so, the
/// bundle directory it belongs to. The innermost `.app` or `.framework`
/// component owns the descriptor, so a framework nested inside an app
/// attributes to the framework.
fn bundle_root(path: &str) -> Option<(&str, bool)> {
    // The exact file name, not a suffix: `FooInfo.plist` is not a
    // bundle descriptor.
    if path.rsplit('/').next() != Some(DESCRIPTOR_NAME) {
        return None;
    }
    let mut found: Option<(usize, bool)> = None;
    let mut end = 0;
    for (i, component) in path.split('/').enumerate() {
        if i > 0 {
            end += 1;
        }
        end += component.len();
        if component.ends_with(".app") {
            found = Some((end, true));
        } else if component.ends_with(".framework") {
            found = Some((end, false));
        }
    }
    found.map(|(end, is_app)| (&path[..end], is_app))
}

/// Assemble the final metadata from package references and the unpacked
/// payload contents.
///
/// The primary descriptor is the shallowest `.app` bundle descriptor;
/// ties break lexicographically so repeated extractions of the same
/// bytes are equal. When the payload holds no bundle descriptors at all
/// (for example a flat payload), identity falls back to the first
/// package reference.
///
/// # Errors
///
/// Returns [`ExtractError::MissingContent`] when no primary identity can
/// be established, or when the primary descriptor lacks a required key.
pub(crate) fn assemble(
    refs: &[PackageRef],
    files: &BTreeMap<String, Vec<u8>>,
    payload_size: u64,
) -> Result<InstallerMetadata, ExtractError> {
    // (bundle directory, descriptor path, is .app bundle)
    let mut candidates: Vec<(String, String, bool)> = files
        .keys()
        .filter_map(|path| {
            bundle_root(path).map(|(root, is_app)| (root.to_string(), path.clone(), is_app))
        })
        .collect();
    candidates.sort_by(|a, b| {
        let depth_a = a.0.matches('/').count();
        let depth_b = b.0.matches('/').count();
        depth_a.cmp(&depth_b).then_with(|| a.0.cmp(&b.0))
    });

    let primary_position = candidates.iter().position(|(_, _, is_app)| *is_app);

    let (bundle_id, version, min_os_version) = if let Some(pos) = primary_position {
        let (root, path, _) = &candidates[pos];
        let descriptor = parse_descriptor(&files[path]).map_err(|e| {
            ExtractError::MalformedContainer(format!(
                "primary descriptor `{path}` unreadable: {e}"
            ))
        })?;
        let bundle_id = descriptor.bundle_id.ok_or_else(|| {
            ExtractError::MissingContent(format!(
                "primary descriptor `{path}` missing CFBundleIdentifier"
            ))
        })?;
        let version = descriptor.short_version.ok_or_else(|| {
            ExtractError::MissingContent(format!(
                "primary descriptor `{path}` missing CFBundleShortVersionString"
            ))
        })?;
        tracing::debug!(bundle = %root, id = %bundle_id, "primary bundle descriptor");
        (bundle_id, version, descriptor.min_os_version)
    } else if let Some(first) = refs.first() {
        // Flat or app-less payloads still identify via their package
        // descriptor entries.
        (
            first.identifier.clone(),
            first.version.clone().unwrap_or_default(),
            None,
        )
    } else {
        return Err(ExtractError::MissingContent(
            "no recognizable primary descriptor in container or payload".to_string(),
        ));
    };

    let mut included_bundles = Vec::new();
    for (i, (root, path, _)) in candidates.iter().enumerate() {
        if Some(i) == primary_position {
            continue;
        }
        let descriptor = match parse_descriptor(&files[path]) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(bundle = %root, "skipping unreadable descriptor: {e}");
                continue;
            }
        };
        let (Some(id), Some(version)) = (descriptor.bundle_id, descriptor.short_version) else {
            tracing::warn!(bundle = %root, "skipping bundle descriptor with missing keys");
            continue;
        };
        included_bundles.push(IncludedBundle {
            bundle_id: id,
            version,
            path: root.clone(),
            build_version: descriptor.build_version,
        });
    }

    let package_ids: Vec<String> = refs.iter().map(|r| r.identifier.clone()).collect();
    let mut install_paths: Vec<String> = Vec::new();
    for location in refs.iter().filter_map(|r| r.install_location.as_deref()) {
        if !install_paths.iter().any(|p| p == location) {
            install_paths.push(location.to_string());
        }
    }
    let install_location = install_paths.first().cloned().unwrap_or_else(|| "/".to_string());

    let declared_kbytes: u64 = refs.iter().filter_map(|r| r.install_kbytes).sum();
    let size = if declared_kbytes > 0 {
        declared_kbytes * 1024
    } else {
        payload_size
    };

    Ok(InstallerMetadata {
        bundle_id,
        version,
        install_location,
        included_bundles,
        package_ids,
        install_paths,
        min_os_version,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn plist_xml(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut body = String::new();
        for (key, value) in pairs {
            body.push_str(&format!("<key>{key}</key><string>{value}</string>"));
        }
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
             \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\
             <plist version=\"1.0\"><dict>{body}</dict></plist>"
        )
        .into_bytes()
    }

    fn app_files(pairs: &[(&str, &[(&str, &str)])]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(path, keys)| ((*path).to_string(), plist_xml(keys)))
            .collect()
    }

    #[test]
    fn test_parse_package_info_element() {
        let xml = br#"<?xml version="1.0"?>
            <pkg-info format-version="2" identifier="com.example.tool"
                      version="3.1.4" install-location="/Applications" auth="root">
              <payload installKBytes="2048" numberOfFiles="42"/>
            </pkg-info>"#;
        let refs = parse_package_refs(xml).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].identifier, "com.example.tool");
        assert_eq!(refs[0].version.as_deref(), Some("3.1.4"));
        assert_eq!(refs[0].install_location.as_deref(), Some("/Applications"));
        assert_eq!(refs[0].install_kbytes, Some(2048));
    }

    #[test]
    fn test_parse_distribution_merges_pkg_refs() {
        let xml = br#"<?xml version="1.0"?>
            <installer-gui-script minSpecVersion="1">
              <pkg-ref id="com.example.app"/>
              <pkg-ref id="com.example.app" version="2.0" installKBytes="512"/>
              <pkg-ref id="com.example.helper" version="1.0"/>
            </installer-gui-script>"#;
        let refs = parse_package_refs(xml).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].identifier, "com.example.app");
        assert_eq!(refs[0].version.as_deref(), Some("2.0"));
        assert_eq!(refs[0].install_kbytes, Some(512));
        assert_eq!(refs[1].identifier, "com.example.helper");
    }

    #[test]
    fn test_payload_size_outside_pkg_info_is_ignored() {
        let xml = br#"<?xml version="1.0"?>
            <installer-gui-script minSpecVersion="1">
              <pkg-ref id="com.example.app" version="2.0"/>
              <payload installKBytes="9999"/>
            </installer-gui-script>"#;
        let refs = parse_package_refs(xml).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].install_kbytes, None);
    }

    #[test]
    fn test_assemble_primary_and_included() {
        let files = app_files(&[
            (
                "Tool.app/Contents/Info.plist",
                &[
                    ("CFBundleIdentifier", "com.example.tool"),
                    ("CFBundleShortVersionString", "3.1.4"),
                    ("CFBundleVersion", "314"),
                    ("LSMinimumSystemVersion", "11.0"),
                ],
            ),
            (
                "Tool.app/Contents/Frameworks/Helper.framework/Resources/Info.plist",
                &[
                    ("CFBundleIdentifier", "com.example.helper"),
                    ("CFBundleShortVersionString", "1.2"),
                ],
            ),
        ]);

        let meta = assemble(&[], &files, 1000).unwrap();
        assert_eq!(meta.bundle_id, "com.example.tool");
        assert_eq!(meta.version, "3.1.4");
        assert_eq!(meta.min_os_version.as_deref(), Some("11.0"));
        assert_eq!(meta.included_bundles.len(), 1);
        assert_eq!(meta.included_bundles[0].bundle_id, "com.example.helper");
        assert_eq!(
            meta.included_bundles[0].path,
            "Tool.app/Contents/Frameworks/Helper.framework"
        );
        assert_eq!(meta.size, 1000);
    }

    #[test]
    fn test_primary_missing_bundle_id_is_fatal() {
        let files = app_files(&[(
            "Tool.app/Contents/Info.plist",
            &[("CFBundleShortVersionString", "1.0")],
        )]);
        let result = assemble(&[], &files, 0);
        assert!(matches!(result, Err(ExtractError::MissingContent(_))));
    }

    #[test]
    fn test_secondary_missing_key_is_skipped_not_fatal() {
        let files = app_files(&[
            (
                "Tool.app/Contents/Info.plist",
                &[
                    ("CFBundleIdentifier", "com.example.tool"),
                    ("CFBundleShortVersionString", "1.0"),
                ],
            ),
            (
                "Tool.app/Contents/Frameworks/Bad.framework/Resources/Info.plist",
                &[("CFBundleShortVersionString", "9.9")],
            ),
        ]);

        let meta = assemble(&[], &files, 0).unwrap();
        assert_eq!(meta.bundle_id, "com.example.tool");
        assert!(meta.included_bundles.is_empty());
    }

    #[test]
    fn test_flat_payload_falls_back_to_package_ref() {
        let refs = vec![PackageRef {
            identifier: "com.example.flat".to_string(),
            version: Some("5.0".to_string()),
            install_location: Some("/usr/local".to_string()),
            install_kbytes: Some(4),
        }];
        let files = BTreeMap::from([("Payload".to_string(), vec![0u8; 16])]);

        let meta = assemble(&refs, &files, 16).unwrap();
        assert_eq!(meta.bundle_id, "com.example.flat");
        assert_eq!(meta.version, "5.0");
        assert_eq!(meta.install_location, "/usr/local");
        assert_eq!(meta.package_ids, vec!["com.example.flat"]);
        assert_eq!(meta.size, 4096);
    }

    #[test]
    fn test_lookalike_descriptor_names_are_not_descriptors() {
        // Valid plist content under a name that merely ends in the
        // descriptor's characters must not establish identity.
        let files = app_files(&[(
            "Tool.app/Contents/FooInfo.plist",
            &[
                ("CFBundleIdentifier", "com.example.foo"),
                ("CFBundleShortVersionString", "1.0"),
            ],
        )]);
        let result = assemble(&[], &files, 0);
        assert!(matches!(result, Err(ExtractError::MissingContent(_))));
    }

    #[test]
    fn test_no_descriptors_anywhere_is_missing_content() {
        let files = BTreeMap::from([("readme.txt".to_string(), b"hi".to_vec())]);
        let result = assemble(&[], &files, 0);
        assert!(matches!(result, Err(ExtractError::MissingContent(_))));
    }

    #[test]
    fn test_shallowest_app_wins_with_lexicographic_tie_break() {
        let files = app_files(&[
            (
                "Beta.app/Contents/Info.plist",
                &[
                    ("CFBundleIdentifier", "com.example.beta"),
                    ("CFBundleShortVersionString", "1.0"),
                ],
            ),
            (
                "Alpha.app/Contents/Info.plist",
                &[
                    ("CFBundleIdentifier", "com.example.alpha"),
                    ("CFBundleShortVersionString", "1.0"),
                ],
            ),
        ]);

        let meta = assemble(&[], &files, 0).unwrap();
        assert_eq!(meta.bundle_id, "com.example.alpha");
        assert_eq!(meta.included_bundles.len(), 1);
        assert_eq!(meta.included_bundles[0].bundle_id, "com.example.beta");
    }
}
