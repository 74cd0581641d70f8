//! TACT content attribution for Blizzard downloads.
//!
//! The cache stores Blizzard archives as opaque byte ranges; to tell
//! which game files a client actually pulled, this crate rebuilds the
//! `(archive, offset) → file` mapping from the product's TACT
//! metadata:
//!
//! - [`tsv`]: the pipe-separated `versions`/`cdns` manifests
//! - [`config`]: `key = value` build and CDN configuration files
//! - [`blte`]: the BLTE container wrapping manifest payloads
//! - [`install`]: the install manifest (file names, hashes, tags)
//! - [`encoding`]: the content-key → encoding-key table
//! - [`archive`]: per-archive `.index` catalogues
//! - [`cdn`]: the HTTP client with timeout, retry and backoff
//! - [`chunkmap`]: the assembled lookup plus the pipeline driver
//!
//! All binary formats are read with explicit big-endian readers; none
//! of the parsers trust length fields without bounds checks.

pub mod archive;
pub mod blte;
pub mod cdn;
pub mod chunkmap;
pub mod config;
pub mod encoding;
pub mod error;
pub mod install;
pub mod tsv;
mod utils;

pub use archive::{ArchiveIndex, ArchiveIndexEntry};
pub use blte::decompress_blte;
pub use cdn::CdnClient;
pub use chunkmap::{BlizzardAttributor, AttributorOptions, ChunkMap, GameFileInfo};
pub use config::{BuildConfig, CdnConfig, ConfigFile};
pub use encoding::EncodingFile;
pub use error::{Error, Result};
pub use install::InstallManifest;
pub use tsv::{CdnsInfo, PipeTable, VersionsInfo};
