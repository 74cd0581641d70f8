//! Install manifest parser.
//!
//! The install manifest lists the files a product installs, each with
//! a content hash, a size and a set of tags (platform, language,
//! architecture) expressed as per-tag bit vectors over the entries.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use tracing::debug;

use crate::error::{Error, Result};
use crate::utils::read_cstring_from;

/// Magic bytes: "IN".
const INSTALL_MAGIC: [u8; 2] = *b"IN";

/// Only 16-byte (MD5) content hashes are in use.
const EXPECTED_HASH_SIZE: u8 = 16;

#[derive(Debug, Clone)]
pub struct InstallHeader {
    pub version: u8,
    pub hash_size: u8,
    pub tag_count: u16,
    pub entry_count: u32,
}

#[derive(Debug, Clone)]
pub struct InstallTag {
    pub name: String,
    pub tag_type: u16,
    files_mask: Vec<bool>,
}

/// One installable file.
#[derive(Debug, Clone)]
pub struct InstallEntry {
    pub path: String,
    pub content_hash: [u8; 16],
    pub size: u32,
    /// Tags rendered as `"<type>=<name>"`.
    pub tags: Vec<String>,
}

impl InstallEntry {
    /// True when every filter string appears in this entry's tags.
    /// Filters match either the full `type=name` form or the bare name.
    pub fn matches_filters(&self, filters: &[String]) -> bool {
        filters.iter().all(|filter| {
            self.tags
                .iter()
                .any(|tag| tag == filter || tag.split('=').nth(1) == Some(filter.as_str()))
        })
    }
}

/// Parsed install manifest.
pub struct InstallManifest {
    pub header: InstallHeader,
    pub tags: Vec<InstallTag>,
    pub entries: Vec<InstallEntry>,
}

impl InstallManifest {
    /// Parse a (BLTE-decompressed) install manifest.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = Self::parse_header(&mut cursor)?;
        debug!(
            "install header: version={}, tags={}, entries={}",
            header.version, header.tag_count, header.entry_count
        );

        let bytes_per_tag = (header.entry_count as usize).div_ceil(8);

        let mut tags = Vec::with_capacity(header.tag_count as usize);
        for _ in 0..header.tag_count {
            let name = read_cstring_from(&mut cursor)?;
            let tag_type = cursor.read_u16::<BigEndian>()?;

            let mut mask_bytes = vec![0u8; bytes_per_tag];
            cursor.read_exact(&mut mask_bytes)?;

            let mut files_mask = Vec::with_capacity(header.entry_count as usize);
            for byte in mask_bytes {
                for bit in (0..8).rev() {
                    if files_mask.len() < header.entry_count as usize {
                        files_mask.push((byte >> bit) & 1 != 0);
                    }
                }
            }

            tags.push(InstallTag {
                name,
                tag_type,
                files_mask,
            });
        }

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for i in 0..header.entry_count as usize {
            let path = read_cstring_from(&mut cursor)?;
            let mut content_hash = [0u8; 16];
            cursor.read_exact(&mut content_hash)?;
            let size = cursor.read_u32::<BigEndian>()?;

            let entry_tags = tags
                .iter()
                .filter(|tag| tag.files_mask[i])
                .map(|tag| format!("{}={}", tag.tag_type, tag.name))
                .collect();

            entries.push(InstallEntry {
                path,
                content_hash,
                size,
                tags: entry_tags,
            });
        }

        debug!("parsed {} install entries", entries.len());
        Ok(Self {
            header,
            tags,
            entries,
        })
    }

    fn parse_header<R: Read>(reader: &mut R) -> Result<InstallHeader> {
        let mut magic = [0u8; 2];
        reader.read_exact(&mut magic)?;
        if magic != INSTALL_MAGIC {
            return Err(Error::BadMagic);
        }

        let version = reader.read_u8()?;
        let hash_size = reader.read_u8()?;
        if hash_size != EXPECTED_HASH_SIZE {
            return Err(Error::UnsupportedHashSize(hash_size));
        }
        let tag_count = reader.read_u16::<BigEndian>()?;
        let entry_count = reader.read_u32::<BigEndian>()?;

        Ok(InstallHeader {
            version,
            hash_size,
            tag_count,
            entry_count,
        })
    }

    /// Entries passing all of `filters` (empty filters pass everything).
    pub fn filtered_entries(&self, filters: &[String]) -> Vec<&InstallEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.matches_filters(filters))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manifest(tag_specs: &[(&str, u16, u8)], entries: &[(&str, [u8; 16], u32)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&INSTALL_MAGIC);
        data.push(1);
        data.push(16);
        data.extend_from_slice(&(tag_specs.len() as u16).to_be_bytes());
        data.extend_from_slice(&(entries.len() as u32).to_be_bytes());

        for (name, tag_type, mask) in tag_specs {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            data.extend_from_slice(&tag_type.to_be_bytes());
            data.push(*mask);
        }
        for (path, hash, size) in entries {
            data.extend_from_slice(path.as_bytes());
            data.push(0);
            data.extend_from_slice(hash);
            data.extend_from_slice(&size.to_be_bytes());
        }
        data
    }

    #[test]
    fn parses_empty_manifest() {
        let data = manifest(&[], &[]);
        let parsed = InstallManifest::parse(&data).unwrap();
        assert_eq!(parsed.header.version, 1);
        assert!(parsed.entries.is_empty());
    }

    #[test]
    fn bad_magic_rejected() {
        assert!(matches!(
            InstallManifest::parse(&[0xFF, 0xFF, 1, 16, 0, 0, 0, 0, 0, 0]),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn non_md5_hash_size_rejected() {
        let mut data = manifest(&[], &[]);
        data[3] = 8;
        assert!(matches!(
            InstallManifest::parse(&data),
            Err(Error::UnsupportedHashSize(8))
        ));
    }

    #[test]
    fn tags_render_as_type_equals_name() {
        // Mask 0b1000_0000: only the first entry carries the tag.
        let data = manifest(
            &[("Windows", 2, 0b1000_0000), ("enUS", 3, 0b0100_0000)],
            &[
                ("game.exe", [1u8; 16], 1000),
                ("data.mac", [2u8; 16], 2000),
            ],
        );
        let parsed = InstallManifest::parse(&data).unwrap();

        assert_eq!(parsed.entries[0].tags, vec!["2=Windows".to_string()]);
        assert_eq!(parsed.entries[1].tags, vec!["3=enUS".to_string()]);
    }

    #[test]
    fn filters_match_full_form_and_bare_name() {
        let data = manifest(
            &[("Windows", 2, 0b1000_0000)],
            &[("game.exe", [1u8; 16], 1000)],
        );
        let parsed = InstallManifest::parse(&data).unwrap();

        assert_eq!(parsed.filtered_entries(&["Windows".to_string()]).len(), 1);
        assert_eq!(parsed.filtered_entries(&["2=Windows".to_string()]).len(), 1);
        assert_eq!(parsed.filtered_entries(&["OSX".to_string()]).len(), 0);
        assert_eq!(parsed.filtered_entries(&[]).len(), 1);
    }

    #[test]
    fn entry_fields_round_trip() {
        let hash = [7u8; 16];
        let data = manifest(&[], &[("wow/data.001", hash, 123456)]);
        let parsed = InstallManifest::parse(&data).unwrap();
        let entry = &parsed.entries[0];
        assert_eq!(entry.path, "wow/data.001");
        assert_eq!(entry.content_hash, hash);
        assert_eq!(entry.size, 123456);
        assert!(entry.tags.is_empty());
    }
}
