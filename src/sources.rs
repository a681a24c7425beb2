//! Feed catalogue: which feeds exist and how to read fields out of them.
//!
//! A catalogue is a JSON array of sources:
//!
//! ```json
//! [{
//!   "id": "12",
//!   "url": "https://example.com/feed.xml",
//!   "traversal": "forward",
//!   "paths": {
//!     "parents": ["realty-feed", "offer"],
//!     "flat_id": {"tags": [], "attrs": {"name": "internal-id"}},
//!     "price":   {"tags": ["price", "value"], "attrs": {}, "number": 0}
//!   }
//! }]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

use crate::error::FeedError;
use crate::utils::lenient_string;

/// How tag lists are walked. Chosen per source, passed to every extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Traversal {
    /// Descend only; supports attribute filters and attribute extraction.
    #[default]
    Forward,
    /// Descend or climb with `..` markers; always extracts text.
    Relative,
}

impl Traversal {
    /// Relative paths may climb out of the offer, so the parser has to keep
    /// the offer's ancestors around.
    pub fn needs_context(self) -> bool {
        matches!(self, Traversal::Relative)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AttrFilter {
    #[serde(default, deserialize_with = "non_empty")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub values: Option<String>,
}

/// Declarative path for one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FieldSpec {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attrs: AttrFilter,
    #[serde(default, deserialize_with = "index")]
    pub number: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PathConfig {
    /// Element chain down to the offer; the last entry is the offer tag.
    pub parents: Vec<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedSource {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub traversal: Traversal,
    pub paths: PathConfig,
}

impl FeedSource {
    pub fn offer_tag(&self) -> &str {
        self.paths.parents.last().map(String::as_str).unwrap_or("")
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.id.trim().is_empty() {
            return Err(FeedError::config(&self.id, "empty source id"));
        }
        if self.offer_tag().trim().is_empty() {
            return Err(FeedError::config(
                &self.id,
                "`parents` must name the offer tag as its last element",
            ));
        }
        Ok(())
    }
}

pub fn load_sources(path: &Path) -> Result<Vec<FeedSource>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read source catalogue {:?}", path))?;
    parse_sources(&raw).with_context(|| format!("Invalid source catalogue {:?}", path))
}

pub fn parse_sources(raw: &str) -> Result<Vec<FeedSource>> {
    let sources: Vec<FeedSource> = serde_json::from_str(raw)?;
    for source in &sources {
        source.validate()?;
    }
    Ok(sources)
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIndex {
    Number(u64),
    Text(String),
}

fn index<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    match RawIndex::deserialize(deserializer)? {
        RawIndex::Number(n) => Ok(n as usize),
        RawIndex::Text(s) if s.trim().is_empty() => Ok(0),
        RawIndex::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
