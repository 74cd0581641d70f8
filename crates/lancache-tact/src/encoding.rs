//! Encoding table parser.
//!
//! Maps content keys (what the install manifest references) to
//! encoding keys (what archives store). Big-endian throughout. Pages
//! are fixed-size; entries within a page terminate at a zero key
//! count, and the string block between header and page table may be
//! empty even when the header advertises page fields.

use byteorder::{BigEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::utils::read_uint40;

/// Magic bytes: "EN".
const ENCODING_MAGIC: [u8; 2] = *b"EN";

#[derive(Debug, Clone)]
pub struct EncodingHeader {
    pub version: u8,
    pub ckey_hash_size: u8,
    pub ekey_hash_size: u8,
    pub ckey_page_size_kb: u16,
    pub ekey_page_size_kb: u16,
    pub ckey_page_count: u32,
    pub ekey_page_count: u32,
    pub string_block_size: u32,
}

/// One content-key row.
#[derive(Debug, Clone)]
pub struct EncodingEntry {
    pub content_key: Vec<u8>,
    pub encoding_keys: Vec<Vec<u8>>,
    /// 40-bit big-endian file size.
    pub size: u64,
}

/// Parsed encoding table with both lookup directions.
pub struct EncodingFile {
    pub header: EncodingHeader,
    ckey_entries: HashMap<Vec<u8>, EncodingEntry>,
    ekey_to_ckey: HashMap<Vec<u8>, Vec<u8>>,
}

impl EncodingFile {
    /// Parse a (BLTE-decompressed) encoding table.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = Self::parse_header(&mut cursor)?;
        debug!(
            "encoding header: version={}, ckey_pages={}, string_block={}",
            header.version, header.ckey_page_count, header.string_block_size
        );

        // The string block may legitimately be zero-length.
        cursor.seek(SeekFrom::Current(i64::from(header.string_block_size)))?;

        // CKey page table: first key + page MD5 per page.
        let mut page_checksums = Vec::with_capacity(header.ckey_page_count as usize);
        for _ in 0..header.ckey_page_count {
            let mut first_key = vec![0u8; header.ckey_hash_size as usize];
            cursor.read_exact(&mut first_key)?;
            let mut checksum = [0u8; 16];
            cursor.read_exact(&mut checksum)?;
            page_checksums.push(checksum);
        }

        let page_size = header.ckey_page_size_kb as usize * 1024;
        let mut ckey_entries = HashMap::new();
        for (index, expected) in page_checksums.iter().enumerate() {
            let mut page = vec![0u8; page_size];
            cursor.read_exact(&mut page)?;

            let actual = md5::compute(&page).0;
            if actual != *expected {
                warn!("encoding page {index} checksum mismatch, parsing anyway");
            }

            Self::parse_ckey_page(
                &page,
                header.ckey_hash_size as usize,
                header.ekey_hash_size as usize,
                &mut ckey_entries,
            )?;
        }

        let mut ekey_to_ckey = HashMap::new();
        for entry in ckey_entries.values() {
            for ekey in &entry.encoding_keys {
                ekey_to_ckey.insert(ekey.clone(), entry.content_key.clone());
            }
        }

        debug!(
            "encoding table: {} ckeys, {} ekeys",
            ckey_entries.len(),
            ekey_to_ckey.len()
        );
        Ok(Self {
            header,
            ckey_entries,
            ekey_to_ckey,
        })
    }

    fn parse_header<R: Read>(reader: &mut R) -> Result<EncodingHeader> {
        let mut magic = [0u8; 2];
        reader.read_exact(&mut magic)?;
        if magic != ENCODING_MAGIC {
            return Err(Error::BadMagic);
        }

        let version = reader.read_u8()?;
        let ckey_hash_size = reader.read_u8()?;
        let ekey_hash_size = reader.read_u8()?;
        let ckey_page_size_kb = reader.read_u16::<BigEndian>()?;
        let ekey_page_size_kb = reader.read_u16::<BigEndian>()?;
        let ckey_page_count = reader.read_u32::<BigEndian>()?;
        let ekey_page_count = reader.read_u32::<BigEndian>()?;
        let _unk = reader.read_u8()?;
        let string_block_size = reader.read_u32::<BigEndian>()?;

        Ok(EncodingHeader {
            version,
            ckey_hash_size,
            ekey_hash_size,
            ckey_page_size_kb,
            ekey_page_size_kb,
            ckey_page_count,
            ekey_page_count,
            string_block_size,
        })
    }

    /// Entries: `{key_count u8, size u40BE, ckey, ekey × key_count}`,
    /// terminated by a zero key count (page padding).
    fn parse_ckey_page(
        page: &[u8],
        ckey_size: usize,
        ekey_size: usize,
        entries: &mut HashMap<Vec<u8>, EncodingEntry>,
    ) -> Result<()> {
        let mut offset = 0;

        while offset < page.len() {
            let key_count = page[offset];
            if key_count == 0 {
                break;
            }
            offset += 1;

            if offset + 5 > page.len() {
                break;
            }
            let size = read_uint40(&page[offset..offset + 5])?;
            offset += 5;

            if offset + ckey_size > page.len() {
                break;
            }
            let ckey = page[offset..offset + ckey_size].to_vec();
            offset += ckey_size;

            let mut ekeys = Vec::with_capacity(key_count as usize);
            for _ in 0..key_count {
                if offset + ekey_size > page.len() {
                    break;
                }
                ekeys.push(page[offset..offset + ekey_size].to_vec());
                offset += ekey_size;
            }

            entries.insert(
                ckey.clone(),
                EncodingEntry {
                    content_key: ckey,
                    encoding_keys: ekeys,
                    size,
                },
            );
        }

        Ok(())
    }

    pub fn lookup_by_ckey(&self, ckey: &[u8]) -> Option<&EncodingEntry> {
        self.ckey_entries.get(ckey)
    }

    pub fn lookup_by_ekey(&self, ekey: &[u8]) -> Option<&[u8]> {
        self.ekey_to_ckey.get(ekey).map(Vec::as_slice)
    }

    /// First encoding key for a content key, the one archives index.
    pub fn ekey_for_ckey(&self, ckey: &[u8]) -> Option<&[u8]> {
        self.ckey_entries
            .get(ckey)
            .and_then(|entry| entry.encoding_keys.first())
            .map(Vec::as_slice)
    }

    pub fn ckey_count(&self) -> usize {
        self.ckey_entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header_bytes(
        ckey_pages: u32,
        page_size_kb: u16,
        string_block: &[u8],
    ) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&ENCODING_MAGIC);
        data.push(1);
        data.push(16); // ckey hash size
        data.push(16); // ekey hash size
        data.extend_from_slice(&page_size_kb.to_be_bytes());
        data.extend_from_slice(&page_size_kb.to_be_bytes());
        data.extend_from_slice(&ckey_pages.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes()); // ekey pages
        data.push(0);
        data.extend_from_slice(&(string_block.len() as u32).to_be_bytes());
        data.extend_from_slice(string_block);
        data
    }

    fn entry_bytes(key_count: u8, size: u64, ckey: [u8; 16], ekeys: &[[u8; 16]]) -> Vec<u8> {
        let mut out = vec![key_count];
        out.extend_from_slice(&size.to_be_bytes()[3..8]); // 40-bit BE
        out.extend_from_slice(&ckey);
        for ekey in ekeys {
            out.extend_from_slice(ekey);
        }
        out
    }

    #[test]
    fn empty_table_parses() {
        let data = header_bytes(0, 0, &[]);
        let parsed = EncodingFile::parse(&data).unwrap();
        assert_eq!(parsed.ckey_count(), 0);
    }

    #[test]
    fn zero_length_string_block_tolerated() {
        // One 1 KiB page holding a single entry, no string block.
        let ckey = [0x11u8; 16];
        let ekey = [0x22u8; 16];

        let mut page = entry_bytes(1, 4096, ckey, &[ekey]);
        page.resize(1024, 0);

        let mut data = header_bytes(1, 1, &[]);
        data.extend_from_slice(&ckey); // page table first key
        data.extend_from_slice(&md5::compute(&page).0);
        data.extend_from_slice(&page);

        let parsed = EncodingFile::parse(&data).unwrap();
        assert_eq!(parsed.ckey_count(), 1);
        let entry = parsed.lookup_by_ckey(&ckey).unwrap();
        assert_eq!(entry.size, 4096);
        assert_eq!(parsed.ekey_for_ckey(&ckey), Some(&ekey[..]));
        assert_eq!(parsed.lookup_by_ekey(&ekey), Some(&ckey[..]));
    }

    #[test]
    fn string_block_is_skipped() {
        let ckey = [0x11u8; 16];
        let ekey = [0x22u8; 16];

        let mut page = entry_bytes(1, 100, ckey, &[ekey]);
        page.resize(1024, 0);

        let mut data = header_bytes(1, 1, b"z\0zlib:9\0");
        data.extend_from_slice(&ckey);
        data.extend_from_slice(&md5::compute(&page).0);
        data.extend_from_slice(&page);

        let parsed = EncodingFile::parse(&data).unwrap();
        assert_eq!(parsed.ckey_count(), 1);
    }

    #[test]
    fn multiple_ekeys_per_ckey() {
        let ckey = [0x11u8; 16];
        let ekeys = [[0x22u8; 16], [0x33u8; 16]];

        let mut page = entry_bytes(2, 7, ckey, &ekeys);
        page.resize(1024, 0);

        let mut data = header_bytes(1, 1, &[]);
        data.extend_from_slice(&ckey);
        data.extend_from_slice(&md5::compute(&page).0);
        data.extend_from_slice(&page);

        let parsed = EncodingFile::parse(&data).unwrap();
        let entry = parsed.lookup_by_ckey(&ckey).unwrap();
        assert_eq!(entry.encoding_keys.len(), 2);
        // The first ekey is the archive-indexed one.
        assert_eq!(parsed.ekey_for_ckey(&ckey), Some(&ekeys[0][..]));
    }

    #[test]
    fn bad_magic_rejected() {
        assert!(matches!(
            EncodingFile::parse(&[0xFF, 0xFF, 1]),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn forty_bit_sizes_survive() {
        let ckey = [0x44u8; 16];
        let big = (1u64 << 40) - 2;

        let mut page = entry_bytes(1, big, ckey, &[[0x55u8; 16]]);
        page.resize(1024, 0);

        let mut data = header_bytes(1, 1, &[]);
        data.extend_from_slice(&ckey);
        data.extend_from_slice(&md5::compute(&page).0);
        data.extend_from_slice(&page);

        let parsed = EncodingFile::parse(&data).unwrap();
        assert_eq!(parsed.lookup_by_ckey(&ckey).unwrap().size, big);
    }
}
