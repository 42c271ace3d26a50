use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::crc32::{format_crc32, parse_crc32};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Malformed catalog JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate catalog id: {0}")]
    DuplicateId(String),

    #[error("Invalid crc32 '{value}' for catalog entry {id}")]
    InvalidCrc32 { id: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Ips,
    Bps,
    Ups,
    Xdelta,
}

impl PatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchType::Ips => "ips",
            PatchType::Bps => "bps",
            PatchType::Ups => "ups",
            PatchType::Xdelta => "xdelta",
        }
    }
}

impl std::fmt::Display for PatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Descriptive metadata for a hack. Every field is optional in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HackMeta {
    pub base_rom: Option<String>,
    pub system: Option<String>,
    pub author: Option<String>,
    pub status: Option<String>,
    pub difficulty: Option<String>,
    pub tags: Vec<String>,
    /// Accepts a JSON array or a comma-separated string.
    #[serde(deserialize_with = "list_or_csv")]
    pub mechanics: Vec<String>,
    pub rating: Option<f64>,
    pub fakemons: Option<String>,
    pub graphics: Option<String>,
    pub story: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
}

impl HackMeta {
    /// Rating bucket used for filtering, e.g. `4.5` -> `4 Stars`. Zero counts as unrated.
    pub fn rating_bucket(&self) -> Option<String> {
        self.rating
            .filter(|r| r.is_finite() && *r != 0.0)
            .map(|r| format!("{} Stars", r.floor() as i64))
    }
}

fn list_or_csv<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match Option::<ListOrCsv>::deserialize(deserializer)? {
        Some(ListOrCsv::List(items)) => items,
        Some(ListOrCsv::Csv(text)) => text
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchCatalogEntry {
    pub id: String,
    #[serde(alias = "name")]
    pub title: String,
    /// Location of the patch bytes, relative to the catalog.
    pub file: String,
    #[serde(rename = "type")]
    pub patch_type: PatchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
    #[serde(default)]
    pub meta: HackMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    /// Older manifests carry the base ROM at the top level.
    #[serde(default, skip_serializing)]
    base_rom: Option<String>,
}

impl PatchCatalogEntry {
    #[cfg(test)]
    pub fn new(id: &str, title: &str, file: &str, patch_type: PatchType) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            file: file.to_string(),
            patch_type,
            crc32: None,
            meta: HackMeta::default(),
            changelog: None,
            base_rom: None,
        }
    }

    pub fn base_rom(&self) -> Option<&str> {
        self.meta.base_rom.as_deref().or(self.base_rom.as_deref())
    }

    /// Declared input checksum, if present and well formed.
    pub fn expected_crc32(&self) -> Option<u32> {
        self.crc32.as_deref().and_then(parse_crc32)
    }
}

/// Read-only list of patches, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<PatchCatalogEntry>,
}

impl Catalog {
    pub fn from_json(data: &[u8]) -> Result<Self, CatalogError> {
        let entries: Vec<PatchCatalogEntry> = serde_json::from_slice(data)?;
        Self::from_entries(entries)
    }

    pub fn from_entries(mut entries: Vec<PatchCatalogEntry>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for entry in entries.iter_mut() {
            if !seen.insert(entry.id.clone()) {
                return Err(CatalogError::DuplicateId(entry.id.clone()));
            }
            if let Some(value) = &entry.crc32 {
                let parsed = parse_crc32(value).ok_or_else(|| CatalogError::InvalidCrc32 {
                    id: entry.id.clone(),
                    value: value.clone(),
                })?;
                entry.crc32 = Some(format_crc32(parsed));
            }
            if entry.meta.base_rom.is_none() {
                entry.meta.base_rom = entry.base_rom.take();
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, id: &str) -> Option<&PatchCatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchCatalogEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[PatchCatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose declared base ROM checksum equals `crc`.
    pub fn find_by_crc32(&self, crc: u32) -> Vec<&PatchCatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.expected_crc32() == Some(crc))
            .collect()
    }
}
