//! Per-source lookup tables for categorical flat attributes.
//!
//! A raw label seen in a feed is recorded once per source, with an empty
//! normalized label until someone curates it. Flats store the normalized
//! text, not a reference to the entry.

use std::collections::HashMap;

use anyhow::Result;
use rusqlite::Connection;

use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Family {
    Room,
    Status,
}

impl Family {
    pub fn table(self) -> &'static str {
        match self {
            Family::Room => "room_types",
            Family::Status => "status_types",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionEntry {
    pub id: String,
    pub source_id: String,
    pub name: String,
    pub normalized: String,
}

pub fn identity(source_id: &str, label: &str) -> String {
    format!("{}_{}", source_id, label.trim())
}

/// Get-or-create resolver. Owned by the single database writer, so the
/// cache needs no locking.
#[derive(Debug, Default)]
pub struct Normalizer {
    cache: HashMap<(Family, String), DimensionEntry>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve_entry(
        &mut self,
        conn: &Connection,
        family: Family,
        source_id: &str,
        raw_label: &str,
    ) -> Result<DimensionEntry> {
        let label = raw_label.trim();
        let id = identity(source_id, label);
        if let Some(entry) = self.cache.get(&(family, id.clone())) {
            return Ok(entry.clone());
        }

        let fresh = DimensionEntry {
            id: id.clone(),
            source_id: source_id.to_string(),
            name: label.to_string(),
            normalized: String::new(),
        };
        db::insert_dimension_if_absent(conn, family, &fresh)?;
        // Whatever is stored now wins, ours or a concurrent writer's.
        let entry = db::fetch_dimension(conn, family, &id)?.unwrap_or(fresh);
        self.cache.insert((family, id), entry.clone());
        Ok(entry)
    }

    /// Normalized label for the pair; empty until curated.
    pub fn resolve(&mut self, conn: &Connection, family: Family, source_id: &str, raw_label: &str) -> Result<String> {
        Ok(self.resolve_entry(conn, family, source_id, raw_label)?.normalized)
    }

    /// Drops cached entries, e.g. after a rolled-back transaction.
    pub fn forget(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn same_inputs_same_identity() {
        let conn = conn();
        let mut n = Normalizer::new();
        let a = n.resolve_entry(&conn, Family::Room, "7", "studio").unwrap();
        let b = n.resolve_entry(&conn, Family::Room, "7", "  studio ").unwrap();
        assert_eq!(a.id, "7_studio");
        assert_eq!(a.id, b.id);
        assert_eq!(db::list_dimensions(&conn, Family::Room, false).unwrap().len(), 1);
    }

    #[test]
    fn different_label_or_family_is_distinct() {
        let conn = conn();
        let mut n = Normalizer::new();
        let a = n.resolve_entry(&conn, Family::Room, "7", "studio").unwrap();
        let b = n.resolve_entry(&conn, Family::Room, "7", "2").unwrap();
        assert_ne!(a.id, b.id);
        n.resolve_entry(&conn, Family::Status, "7", "studio").unwrap();
        assert_eq!(db::list_dimensions(&conn, Family::Room, false).unwrap().len(), 2);
        assert_eq!(db::list_dimensions(&conn, Family::Status, false).unwrap().len(), 1);
    }

    #[test]
    fn fresh_entries_resolve_to_empty_label() {
        let conn = conn();
        let mut n = Normalizer::new();
        assert_eq!(n.resolve(&conn, Family::Status, "7", "В продаже").unwrap(), "");
        let stored = db::fetch_dimension(&conn, Family::Status, "7_В продаже").unwrap().unwrap();
        assert_eq!(stored.name, "В продаже");
        assert_eq!(stored.normalized, "");
    }

    #[test]
    fn existing_row_wins_over_fresh_insert() {
        let conn = conn();
        let curated = DimensionEntry {
            id: identity("7", "free"),
            source_id: "7".into(),
            name: "free".into(),
            normalized: "available".into(),
        };
        db::insert_dimension_if_absent(&conn, Family::Status, &curated).unwrap();

        let mut n = Normalizer::new();
        assert_eq!(n.resolve(&conn, Family::Status, "7", "free").unwrap(), "available");
    }

    #[test]
    fn cache_serves_repeat_lookups_until_forgotten() {
        let conn = conn();
        let mut n = Normalizer::new();
        n.resolve(&conn, Family::Room, "7", "euro").unwrap();
        db::set_normalized(&conn, Family::Room, "7_euro", "1-room").unwrap();
        assert_eq!(n.resolve(&conn, Family::Room, "7", "euro").unwrap(), "");
        n.forget();
        assert_eq!(n.resolve(&conn, Family::Room, "7", "euro").unwrap(), "1-room");
    }

    #[test]
    fn empty_label_still_gets_an_entry() {
        let conn = conn();
        let mut n = Normalizer::new();
        let e = n.resolve_entry(&conn, Family::Room, "7", "").unwrap();
        assert_eq!(e.id, "7_");
    }
}
