use std::collections::BTreeMap;

use super::element::OfferNode;
use super::path::Program;
use crate::sources::FeedSource;

/// One extracted listing, keyed by field name. Serialized as-is into the
/// intermediate artifact.
pub type Record = BTreeMap<String, String>;

pub const SOURCE_KEY: &str = "fid_id";
pub const DATE_KEY: &str = "date";

/// Compiled path programs for every configured field of one source.
#[derive(Debug, Clone)]
pub struct Extractor {
    source_id: String,
    fields: Vec<(String, Program)>,
}

impl Extractor {
    pub fn for_source(source: &FeedSource) -> Self {
        let fields = source
            .paths
            .fields
            .iter()
            .map(|(name, spec)| (name.clone(), Program::compile(name, spec, source.traversal)))
            .collect();
        Extractor {
            source_id: source.id.clone(),
            fields,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Runs every field program against the offer. `stamp` is the processing
    /// timestamp shared by the whole batch.
    pub fn extract(&self, offer: &OfferNode, stamp: &str) -> Record {
        let mut record = Record::new();
        record.insert(SOURCE_KEY.to_string(), self.source_id.clone());
        record.insert(DATE_KEY.to_string(), stamp.to_string());
        for (name, program) in &self.fields {
            record.insert(name.clone(), program.eval(offer));
        }

        // Room type is stored as the composite of its label and room count.
        let rooms = record.get("rooms").cloned().unwrap_or_default();
        let composite = format!("{}{}", record.get("type_room").map(String::as_str).unwrap_or(""), rooms);
        record.insert("type_room".to_string(), composite);
        record
    }
}
