//! Pipe-separated version manifests.
//!
//! The `versions` and `cdns` endpoints return a pipe-delimited table
//! whose header fields carry `!TYPE:SIZE` suffixes:
//!
//! ```text
//! Region!STRING:0|BuildConfig!HEX:16|CDNConfig!HEX:16
//! ## seqn = 12345
//! us|abc…|def…
//! ```
//!
//! The suffixes are stripped on parse and headers are located by name
//! regardless of column order. Rows after the header are data; the
//! manifest's most recent row is the last one.

use tracing::trace;

use crate::error::{Error, Result};

/// A parsed pipe-separated table.
#[derive(Debug, Clone)]
pub struct PipeTable {
    fields: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl PipeTable {
    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines();

        let header = loop {
            match lines.next() {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => break line,
                None => return Err(Error::EmptyManifest),
            }
        };

        let fields: Vec<String> = header
            .split('|')
            .map(|field| {
                field
                    .split('!')
                    .next()
                    .unwrap_or(field)
                    .trim()
                    .to_string()
            })
            .collect();

        let mut rows = Vec::new();
        for line in lines {
            let trimmed = line.trim();
            // Sequence-number and comment lines are metadata.
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let values: Vec<String> = trimmed.split('|').map(str::to_string).collect();
            rows.push(values);
        }

        trace!("parsed pipe table: {} fields, {} rows", fields.len(), rows.len());
        Ok(Self { fields, rows })
    }

    /// Case-insensitive field lookup.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.eq_ignore_ascii_case(name))
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn last_row(&self) -> Option<&[String]> {
        self.rows.last().map(Vec::as_slice)
    }

    /// Value of `field` within `row`, empty-string-is-None.
    pub fn get<'a>(&self, row: &'a [String], field: &str) -> Option<&'a str> {
        let index = self.field_index(field)?;
        let value = row.get(index)?.as_str();
        if value.is_empty() { None } else { Some(value) }
    }
}

/// The fields the attributor needs from a `versions` manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionsInfo {
    pub build_config: String,
    pub cdn_config: String,
    pub product_config: Option<String>,
    pub versions_name: Option<String>,
    pub build_id: Option<u32>,
}

impl VersionsInfo {
    /// Take the most recent (last) data row.
    pub fn from_table(table: &PipeTable) -> Result<Self> {
        let row = table.last_row().ok_or(Error::EmptyManifest)?;
        let required = |field: &str| -> Result<String> {
            table
                .get(row, field)
                .map(str::to_string)
                .ok_or_else(|| Error::MissingField(field.to_string()))
        };

        Ok(Self {
            build_config: required("BuildConfig")?,
            cdn_config: required("CDNConfig")?,
            product_config: table.get(row, "ProductConfig").map(str::to_string),
            versions_name: table.get(row, "VersionsName").map(str::to_string),
            build_id: table.get(row, "BuildId").and_then(|v| v.parse().ok()),
        })
    }
}

/// The fields the attributor needs from a `cdns` manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnsInfo {
    pub hosts: Vec<String>,
    pub path: String,
}

/// Hosts preferred when resolving the CDN.
const PREFERRED_HOSTS: &[&str] = &[
    "us.cdn.blizzard.com",
    "eu.cdn.blizzard.com",
    "kr.cdn.blizzard.com",
];

impl CdnsInfo {
    pub fn from_table(table: &PipeTable) -> Result<Self> {
        let row = table.last_row().ok_or(Error::EmptyManifest)?;
        let hosts = table
            .get(row, "Hosts")
            .ok_or_else(|| Error::MissingField("Hosts".to_string()))?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let path = table
            .get(row, "Path")
            .ok_or_else(|| Error::MissingField("Path".to_string()))?
            .to_string();
        Ok(Self { hosts, path })
    }

    /// Pick the fetch host: a well-known Blizzard edge when present,
    /// otherwise the first host not run by level3.
    pub fn preferred_host(&self) -> Result<&str> {
        if let Some(preferred) = self
            .hosts
            .iter()
            .find(|h| PREFERRED_HOSTS.contains(&h.as_str()))
        {
            return Ok(preferred);
        }
        self.hosts
            .iter()
            .find(|h| !h.contains("level3"))
            .or_else(|| self.hosts.first())
            .map(String::as_str)
            .ok_or(Error::NoUsableHost)
    }
}
