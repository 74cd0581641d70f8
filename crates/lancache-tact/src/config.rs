//! Build and CDN configuration files.
//!
//! Newline-separated `key = value` pairs with `#` comments. Several
//! values are hash lists (`<content-hash> <encoded-hash>`); the
//! encoded hash, when present, is the one addressable on the CDN.

use std::collections::HashMap;

use tracing::trace;

use crate::error::Result;

/// Generic `key = value` configuration file.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    values: HashMap<String, String>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(eq) = line.find('=') else {
                continue;
            };
            let key = line[..eq].trim();
            let value = line[eq + 1..].trim();
            if key.is_empty() {
                continue;
            }
            trace!("config entry: '{key}' = '{value}'");
            values.insert(key.to_string(), value.to_string());
        }

        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whitespace-separated components of a value.
    pub fn get_list(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// First component of a hash-list value (the content hash).
    pub fn content_hash(&self, key: &str) -> Option<&str> {
        self.get_list(key).first().copied()
    }

    /// The CDN-addressable hash of a hash-list value: the second
    /// component when present, otherwise the first.
    pub fn fetch_hash(&self, key: &str) -> Option<&str> {
        let list = self.get_list(key);
        list.get(1).or_else(|| list.first()).copied()
    }
}

/// Keys used from build configuration files.
pub mod build_keys {
    pub const DOWNLOAD: &str = "download";
    pub const INSTALL: &str = "install";
    pub const INSTALL_SIZE: &str = "install-size";
    pub const ENCODING: &str = "encoding";
    pub const ENCODING_SIZE: &str = "encoding-size";
    pub const BUILD_NAME: &str = "build-name";
}

/// Keys used from CDN configuration files.
pub mod cdn_keys {
    pub const ARCHIVES: &str = "archives";
    pub const FILE_INDEX: &str = "file-index";
}

/// Typed view over a build configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub config: ConfigFile,
}

impl BuildConfig {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            config: ConfigFile::parse(text)?,
        })
    }

    pub fn build_name(&self) -> Option<&str> {
        self.config.get(build_keys::BUILD_NAME)
    }

    pub fn install_fetch_hash(&self) -> Option<&str> {
        self.config.fetch_hash(build_keys::INSTALL)
    }

    pub fn install_size(&self) -> Option<u64> {
        self.config
            .get_list(build_keys::INSTALL_SIZE)
            .first()
            .and_then(|v| v.parse().ok())
    }

    pub fn encoding_content_hash(&self) -> Option<&str> {
        self.config.content_hash(build_keys::ENCODING)
    }

    pub fn encoding_fetch_hash(&self) -> Option<&str> {
        self.config.fetch_hash(build_keys::ENCODING)
    }

    pub fn encoding_size(&self) -> Option<u64> {
        // encoding-size lists decoded then encoded size.
        self.config
            .get_list(build_keys::ENCODING_SIZE)
            .first()
            .and_then(|v| v.parse().ok())
    }

    pub fn download_hash(&self) -> Option<&str> {
        self.config.fetch_hash(build_keys::DOWNLOAD)
    }
}

/// Typed view over a CDN configuration.
#[derive(Debug, Clone)]
pub struct CdnConfig {
    pub config: ConfigFile,
}

impl CdnConfig {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            config: ConfigFile::parse(text)?,
        })
    }

    /// Archive hashes, in manifest order; each has an `.index` on the
    /// CDN.
    pub fn archives(&self) -> Vec<&str> {
        self.config.get_list(cdn_keys::ARCHIVES)
    }

    pub fn file_index(&self) -> Option<&str> {
        self.config.content_hash(cdn_keys::FILE_INDEX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_key_values_and_comments() {
        let text = "# Build Configuration\n\
                    root = abc123\n\
                    install = 11aa 22bb\n\
                    install-size = 22968 22972\n\
                    encoding = 33cc 44dd\n\
                    encoding-size = 11174 11189\n\
                    build-name = WOW-53040patch10.2.5\n";
        let build = BuildConfig::parse(text).unwrap();

        assert_eq!(build.build_name(), Some("WOW-53040patch10.2.5"));
        assert_eq!(build.install_fetch_hash(), Some("22bb"));
        assert_eq!(build.install_size(), Some(22968));
        assert_eq!(build.encoding_content_hash(), Some("33cc"));
        assert_eq!(build.encoding_fetch_hash(), Some("44dd"));
        assert_eq!(build.encoding_size(), Some(11174));
    }

    #[test]
    fn single_hash_values_fetch_directly() {
        let build = BuildConfig::parse("install = feedface\n").unwrap();
        assert_eq!(build.install_fetch_hash(), Some("feedface"));
    }

    #[test]
    fn archives_split_on_whitespace() {
        let cdn = CdnConfig::parse(
            "archives = aaa bbb ccc\narchive-group = ddd\nfile-index = eee\n",
        )
        .unwrap();
        assert_eq!(cdn.archives(), vec!["aaa", "bbb", "ccc"]);
        assert_eq!(cdn.file_index(), Some("eee"));
    }

    #[test]
    fn missing_keys_are_none() {
        let build = BuildConfig::parse("").unwrap();
        assert_eq!(build.install_fetch_hash(), None);
        assert_eq!(build.build_name(), None);
        assert!(CdnConfig::parse("").unwrap().archives().is_empty());
    }
}
