//! Archive index (`.index`) parser.
//!
//! Each CDN archive ships a catalogue mapping encoding keys to byte
//! ranges inside the archive. The file is a sequence of fixed-size
//! records packed into pages, followed by a 28-byte footer:
//!
//! ```text
//! toc_hash      8 bytes
//! version       8 bytes
//! unknown       3 bytes
//! block_size_kb u8
//! offset_bytes  u8
//! size_bytes    u8
//! key_size      u8
//! checksum_size u8
//! num_elements  u32 big-endian
//! ```
//!
//! Records are `{key, size, offset}` with the widths the footer
//! declares (in that order; the size field precedes the offset field)
//! and never straddle a page boundary.

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::utils::read_be_uint;

const FOOTER_SIZE: usize = 28;

/// Footer metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIndexFooter {
    pub toc_hash: [u8; 8],
    pub version: [u8; 8],
    pub block_size_kb: u8,
    pub offset_bytes: u8,
    pub size_bytes: u8,
    pub key_size: u8,
    pub checksum_size: u8,
    pub num_elements: u32,
}

impl ArchiveIndexFooter {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(Error::TruncatedData {
                expected: FOOTER_SIZE,
                actual: data.len(),
            });
        }
        let footer = &data[data.len() - FOOTER_SIZE..];

        let mut toc_hash = [0u8; 8];
        toc_hash.copy_from_slice(&footer[0..8]);
        let mut version = [0u8; 8];
        version.copy_from_slice(&footer[8..16]);

        // footer[16..19] unknown
        let block_size_kb = footer[19];
        let offset_bytes = footer[20];
        let size_bytes = footer[21];
        let key_size = footer[22];
        let checksum_size = footer[23];
        let num_elements =
            u32::from_be_bytes([footer[24], footer[25], footer[26], footer[27]]);

        if key_size == 0 || usize::from(key_size) > 16 {
            return Err(Error::UnsupportedHashSize(key_size));
        }
        if usize::from(offset_bytes) > 8 || usize::from(size_bytes) > 8 {
            return Err(Error::TruncatedData {
                expected: 8,
                actual: usize::from(offset_bytes.max(size_bytes)),
            });
        }

        Ok(Self {
            toc_hash,
            version,
            block_size_kb,
            offset_bytes,
            size_bytes,
            key_size,
            checksum_size,
            num_elements,
        })
    }

    /// Page size in bytes; a zero field means the default 4 KiB.
    pub fn block_size(&self) -> usize {
        if self.block_size_kb == 0 {
            4096
        } else {
            usize::from(self.block_size_kb) * 1024
        }
    }

    pub fn entry_length(&self) -> usize {
        usize::from(self.key_size) + usize::from(self.size_bytes) + usize::from(self.offset_bytes)
    }
}

/// One archive index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIndexEntry {
    pub ekey: Vec<u8>,
    pub offset: u64,
    pub size: u64,
}

/// A parsed `.index` file.
#[derive(Debug)]
pub struct ArchiveIndex {
    pub footer: ArchiveIndexFooter,
    pub entries: Vec<ArchiveIndexEntry>,
}

impl ArchiveIndex {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let footer = ArchiveIndexFooter::parse(data)?;
        let body = &data[..data.len() - FOOTER_SIZE];

        let entry_len = footer.entry_length();
        let block_size = footer.block_size();
        let entries_per_page = block_size / entry_len;

        let mut entries = Vec::with_capacity(footer.num_elements as usize);
        let mut page_start = 0usize;
        let mut in_page = 0usize;
        let mut offset = 0usize;

        while entries.len() < footer.num_elements as usize {
            // Records never straddle pages; skip trailing padding.
            if in_page == entries_per_page {
                page_start += block_size;
                offset = page_start;
                in_page = 0;
            }
            if offset + entry_len > body.len() {
                return Err(Error::TruncatedData {
                    expected: offset + entry_len,
                    actual: body.len(),
                });
            }

            let record = &body[offset..offset + entry_len];
            let key_len = usize::from(footer.key_size);
            let size_len = usize::from(footer.size_bytes);

            let ekey = record[..key_len].to_vec();
            let size = read_be_uint(&record[key_len..key_len + size_len]);
            let entry_offset = read_be_uint(&record[key_len + size_len..]);

            trace!(
                "index entry {}: key={}, offset={entry_offset:#x}, size={size:#x}",
                entries.len(),
                hex::encode(&ekey)
            );
            entries.push(ArchiveIndexEntry {
                ekey,
                offset: entry_offset,
                size,
            });

            offset += entry_len;
            in_page += 1;
        }

        debug!("parsed archive index: {} entries", entries.len());
        Ok(Self { footer, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn footer_bytes(num_elements: u32) -> Vec<u8> {
        let mut footer = Vec::new();
        footer.extend_from_slice(&[0xAA; 8]); // toc hash
        footer.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]); // version
        footer.extend_from_slice(&[0, 0, 0]); // unknown
        footer.push(4); // block size kb
        footer.push(4); // offset bytes
        footer.push(4); // size bytes
        footer.push(16); // key size
        footer.push(8); // checksum size
        footer.extend_from_slice(&num_elements.to_be_bytes());
        footer
    }

    fn record(key: [u8; 16], size: u32, offset: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&key);
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&offset.to_be_bytes());
        out
    }

    #[test]
    fn single_record_reference_vector() {
        // One record: zero key, size 0x10, offset 0x1000.
        let mut data = record([0u8; 16], 0x0000_0010, 0x0000_1000);
        data.resize(4096, 0); // page padding
        data.extend_from_slice(&footer_bytes(1));

        let index = ArchiveIndex::parse(&data).unwrap();
        assert_eq!(index.entries.len(), 1);
        let entry = &index.entries[0];
        assert_eq!(entry.ekey, vec![0u8; 16]);
        assert_eq!(entry.offset, 0x1000);
        assert_eq!(entry.size, 0x10);
    }

    #[test]
    fn records_do_not_straddle_pages() {
        // 4096 / 24 = 170 records per page with 16 bytes of padding.
        let per_page = 4096 / 24;
        let total = per_page + 3;

        let mut data = Vec::new();
        for i in 0..per_page {
            let mut key = [0u8; 16];
            key[0] = (i % 251) as u8;
            key[1] = (i / 251) as u8;
            data.extend_from_slice(&record(key, i as u32, (i * 2) as u32));
        }
        data.resize(4096, 0); // pad page 1
        for i in per_page..total {
            let mut key = [0u8; 16];
            key[0] = (i % 251) as u8;
            key[1] = (i / 251) as u8;
            data.extend_from_slice(&record(key, i as u32, (i * 2) as u32));
        }
        data.resize(8192, 0);
        data.extend_from_slice(&footer_bytes(total as u32));

        let index = ArchiveIndex::parse(&data).unwrap();
        assert_eq!(index.entries.len(), total);
        // First record of page two parsed from the page boundary.
        let boundary = &index.entries[per_page];
        assert_eq!(boundary.size, per_page as u64);
        assert_eq!(boundary.offset, (per_page * 2) as u64);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut data = record([1u8; 16], 1, 2);
        data.truncate(10);
        data.extend_from_slice(&footer_bytes(1));
        assert!(matches!(
            ArchiveIndex::parse(&data),
            Err(Error::TruncatedData { .. })
        ));
    }

    #[test]
    fn too_short_for_footer_is_an_error() {
        assert!(matches!(
            ArchiveIndex::parse(&[0u8; 10]),
            Err(Error::TruncatedData { .. })
        ));
    }

    #[test]
    fn footer_fields_parse() {
        let mut data = Vec::new();
        data.resize(4096, 0);
        data.extend_from_slice(&footer_bytes(0));
        let index = ArchiveIndex::parse(&data).unwrap();
        assert_eq!(index.footer.block_size(), 4096);
        assert_eq!(index.footer.entry_length(), 24);
        assert_eq!(index.footer.num_elements, 0);
        assert!(index.entries.is_empty());
    }
}
