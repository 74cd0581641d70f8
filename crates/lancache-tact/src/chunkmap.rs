//! The attribution pipeline and its product: the chunk map.
//!
//! `build_chunk_map` walks the TACT metadata chain for a product
//! (versions → cdns → configs → install → encoding → archive indexes)
//! and produces a [`ChunkMap`] answering the one question the cache
//! side needs: *which game file lives at `(archive, byte_offset)`*.
//!
//! Individual archive failures are logged and skipped; the map is
//! still useful with partial coverage. The map lives only for the
//! duration of an attribution pass.

use std::collections::{BTreeMap, HashMap};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::ArchiveIndex;
use crate::blte::decompress_blte;
use crate::cdn::CdnClient;
use crate::config::{BuildConfig, CdnConfig};
use crate::encoding::EncodingFile;
use crate::error::{Error, Result};
use crate::install::InstallManifest;
use crate::tsv::{CdnsInfo, PipeTable, VersionsInfo};

/// A game file resolved from the install manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameFileInfo {
    pub name: String,
    pub size: u64,
    pub content_hash: [u8; 16],
    pub tags: Vec<String>,
}

/// Byte ranges per archive, resolvable to game files.
#[derive(Debug, Default)]
pub struct ChunkMap {
    /// Archive hashes by archive index.
    pub archives: Vec<String>,
    files: Vec<GameFileInfo>,
    /// Per archive: offset → (size, file index).
    ranges: HashMap<u16, BTreeMap<u64, (u64, usize)>>,
}

impl ChunkMap {
    /// The file whose archive range contains `byte_offset`, if any.
    pub fn find_file(&self, archive_index: u16, byte_offset: u64) -> Option<&GameFileInfo> {
        let ranges = self.ranges.get(&archive_index)?;
        let (offset, (size, file_index)) = ranges.range(..=byte_offset).next_back()?;
        if byte_offset < offset + size {
            self.files.get(*file_index)
        } else {
            None
        }
    }

    /// Index of an archive hash as referenced in cache URLs.
    pub fn archive_index_of(&self, archive_hash: &str) -> Option<u16> {
        self.archives
            .iter()
            .position(|a| a.eq_ignore_ascii_case(archive_hash))
            .map(|i| i as u16)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn located_chunks(&self) -> usize {
        self.ranges.values().map(BTreeMap::len).sum()
    }

    fn insert(&mut self, archive_index: u16, offset: u64, size: u64, file: GameFileInfo) {
        let file_index = self.files.len();
        self.files.push(file);
        self.ranges
            .entry(archive_index)
            .or_default()
            .insert(offset, (size, file_index));
    }
}

/// Language/platform filters and the region to resolve against.
#[derive(Debug, Clone, Default)]
pub struct AttributorOptions {
    /// Patch endpoint region (defaults to `us`).
    pub region: Option<String>,
    /// Install-tag filters, e.g. `enUS` or `4=Windows`.
    pub tag_filters: Vec<String>,
    /// CDN host override (tests and air-gapped mirrors).
    pub host_override: Option<String>,
}

/// Drives the metadata chain for one product.
pub struct BlizzardAttributor {
    client: CdnClient,
}

impl BlizzardAttributor {
    pub fn new(client: CdnClient) -> Self {
        Self { client }
    }

    /// Build the chunk map for `product` (`wow`, `pro`, `d4`, ...).
    pub async fn build_chunk_map(
        &self,
        product: &str,
        options: &AttributorOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkMap> {
        let region = options.region.as_deref().unwrap_or("us");

        // 1. versions: the most recent row names both configs.
        let versions_text = self.client.fetch_versions(region, product).await?;
        let versions = VersionsInfo::from_table(&PipeTable::parse(&versions_text)?)?;
        info!(
            product,
            build = versions.versions_name.as_deref().unwrap_or("?"),
            "resolved version"
        );

        // 2. cdns: pick host and path.
        let cdns_text = self.client.fetch_cdns(region, product).await?;
        let cdns = CdnsInfo::from_table(&PipeTable::parse(&cdns_text)?)?;
        let host = match &options.host_override {
            Some(host) => host.clone(),
            None => cdns.preferred_host()?.to_string(),
        };
        let path = cdns.path.clone();
        debug!(host, path, "resolved CDN");

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // 3. build + cdn config.
        let build_text = self
            .client
            .fetch_config(&host, &path, &versions.build_config)
            .await?;
        let build = BuildConfig::parse(&build_text)?;

        let cdn_config_text = self
            .client
            .fetch_config(&host, &path, &versions.cdn_config)
            .await?;
        let cdn_config = CdnConfig::parse(&cdn_config_text)?;

        // 4. install manifest (BLTE-wrapped).
        let install_hash = build
            .install_fetch_hash()
            .ok_or_else(|| Error::MissingField("install".to_string()))?;
        let install_raw = self.client.fetch_data(&host, &path, install_hash).await?;
        let install = InstallManifest::parse(&decompress_blte(&install_raw)?)?;
        let wanted = install.filtered_entries(&options.tag_filters);
        info!(
            total = install.entries.len(),
            filtered = wanted.len(),
            "parsed install manifest"
        );

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // 5. encoding table (BLTE-wrapped).
        let encoding_hash = build
            .encoding_fetch_hash()
            .ok_or_else(|| Error::MissingField("encoding".to_string()))?;
        let encoding_raw = self.client.fetch_data(&host, &path, encoding_hash).await?;
        let encoding = EncodingFile::parse(&decompress_blte(&encoding_raw)?)?;
        debug!(ckeys = encoding.ckey_count(), "parsed encoding table");

        // 6. archive indexes. Failures skip the archive, never abort.
        let archives: Vec<String> = cdn_config.archives().iter().map(|s| s.to_string()).collect();
        let mut ekey_to_location: HashMap<Vec<u8>, (u16, u64, u64)> = HashMap::new();
        for (archive_index, archive_hash) in archives.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let index_data = match self.client.fetch_index(&host, &path, archive_hash).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(archive = %archive_hash, "skipping archive index fetch: {e}");
                    continue;
                }
            };
            let index = match ArchiveIndex::parse(&index_data) {
                Ok(index) => index,
                Err(e) => {
                    warn!(archive = %archive_hash, "skipping unparseable archive index: {e}");
                    continue;
                }
            };
            for entry in index.entries {
                ekey_to_location.insert(
                    entry.ekey,
                    (archive_index as u16, entry.offset, entry.size),
                );
            }
        }
        info!(
            archives = archives.len(),
            chunks = ekey_to_location.len(),
            "indexed archives"
        );

        // 7. install entry → ckey → ekey → archive location.
        let mut map = ChunkMap {
            archives,
            ..ChunkMap::default()
        };
        let mut unresolved = 0usize;
        for entry in wanted {
            let Some(ekey) = encoding.ekey_for_ckey(&entry.content_hash) else {
                unresolved += 1;
                continue;
            };
            let Some((archive_index, offset, size)) = ekey_to_location.get(ekey) else {
                unresolved += 1;
                continue;
            };
            map.insert(
                *archive_index,
                *offset,
                *size,
                GameFileInfo {
                    name: entry.path.clone(),
                    size: u64::from(entry.size),
                    content_hash: entry.content_hash,
                    tags: entry.tags.clone(),
                },
            );
        }
        if unresolved > 0 {
            debug!(unresolved, "install entries without archive locations");
        }
        info!(
            files = map.file_count(),
            chunks = map.located_chunks(),
            "chunk map built"
        );
        Ok(map)
    }
}
