use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};

use crate::dimensions::{DimensionEntry, Family};
use crate::utils::TIMESTAMP_FORMAT;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS flats (
            id_flat         TEXT PRIMARY KEY,
            number          TEXT,
            number_on_floor TEXT,
            complex         TEXT,
            id_complex      TEXT,
            house           TEXT,
            id_house        TEXT,
            floor           TEXT,
            section         TEXT,
            rooms           TEXT,
            flat_type       TEXT,
            price           TEXT,
            price_base      TEXT,
            square          TEXT,
            square_live     TEXT,
            square_hook     TEXT,
            status          TEXT,
            decoration      TEXT,
            plan            TEXT,
            floor_plan      TEXT,
            fid_id          TEXT,
            date            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_flats_source ON flats(fid_id);

        CREATE TABLE IF NOT EXISTS room_types (
            id              TEXT PRIMARY KEY,
            source_id       TEXT NOT NULL,
            name            TEXT NOT NULL,
            normalized_name TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS status_types (
            id              TEXT PRIMARY KEY,
            source_id       TEXT NOT NULL,
            name            TEXT NOT NULL,
            normalized_name TEXT NOT NULL DEFAULT ''
        );
        ",
    )?;
    Ok(())
}

// ── Flats ──

#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow {
    pub id_flat: String,
    pub number: String,
    pub number_on_floor: String,
    pub complex: String,
    pub id_complex: String,
    pub house: String,
    pub id_house: String,
    pub floor: String,
    pub section: String,
    pub rooms: String,
    pub flat_type: String,
    pub price: String,
    pub price_base: String,
    pub square: String,
    pub square_live: String,
    pub square_hook: String,
    pub status: String,
    pub decoration: String,
    pub plan: String,
    pub floor_plan: String,
    pub fid_id: String,
    pub date: NaiveDateTime,
}

const UPSERT_FLAT: &str = "
    INSERT INTO flats
        (id_flat, number, number_on_floor, complex, id_complex, house, id_house,
         floor, section, rooms, flat_type, price, price_base, square, square_live,
         square_hook, status, decoration, plan, floor_plan, fid_id, date)
    VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)
    ON CONFLICT(id_flat) DO UPDATE SET
        number=excluded.number,
        number_on_floor=excluded.number_on_floor,
        complex=excluded.complex,
        id_complex=excluded.id_complex,
        house=excluded.house,
        id_house=excluded.id_house,
        floor=excluded.floor,
        section=excluded.section,
        rooms=excluded.rooms,
        flat_type=excluded.flat_type,
        price=excluded.price,
        price_base=excluded.price_base,
        square=excluded.square,
        square_live=excluded.square_live,
        square_hook=excluded.square_hook,
        status=excluded.status,
        decoration=excluded.decoration,
        plan=excluded.plan,
        floor_plan=excluded.floor_plan,
        fid_id=excluded.fid_id,
        date=excluded.date";

/// Upserts rows keyed by `id_flat`; every other column is overwritten.
/// Runs on whatever transaction the caller holds.
pub fn upsert_flats(conn: &Connection, rows: &[FlatRow]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(UPSERT_FLAT)?;
    let mut count = 0;
    for r in rows {
        count += stmt.execute(rusqlite::params![
            r.id_flat, r.number, r.number_on_floor, r.complex, r.id_complex,
            r.house, r.id_house, r.floor, r.section, r.rooms, r.flat_type,
            r.price, r.price_base, r.square, r.square_live, r.square_hook,
            r.status, r.decoration, r.plan, r.floor_plan, r.fid_id,
            r.date.format(TIMESTAMP_FORMAT).to_string(),
        ])?;
    }
    Ok(count)
}

pub fn fetch_flat(conn: &Connection, id_flat: &str) -> Result<Option<FlatRow>> {
    let row = conn
        .query_row(
            "SELECT id_flat, number, number_on_floor, complex, id_complex, house, id_house,
                    floor, section, rooms, flat_type, price, price_base, square, square_live,
                    square_hook, status, decoration, plan, floor_plan, fid_id, date
             FROM flats WHERE id_flat = ?1",
            [id_flat],
            |row| {
                let date: String = row.get(21)?;
                Ok(FlatRow {
                    id_flat: row.get(0)?,
                    number: row.get(1)?,
                    number_on_floor: row.get(2)?,
                    complex: row.get(3)?,
                    id_complex: row.get(4)?,
                    house: row.get(5)?,
                    id_house: row.get(6)?,
                    floor: row.get(7)?,
                    section: row.get(8)?,
                    rooms: row.get(9)?,
                    flat_type: row.get(10)?,
                    price: row.get(11)?,
                    price_base: row.get(12)?,
                    square: row.get(13)?,
                    square_live: row.get(14)?,
                    square_hook: row.get(15)?,
                    status: row.get(16)?,
                    decoration: row.get(17)?,
                    plan: row.get(18)?,
                    floor_plan: row.get(19)?,
                    fid_id: row.get(20)?,
                    date: NaiveDateTime::parse_from_str(&date, TIMESTAMP_FORMAT).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            21,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

// ── Dimensions ──

/// Creates the entry unless its id already exists. Returns rows inserted
/// (0 when another writer got there first).
pub fn insert_dimension_if_absent(conn: &Connection, family: Family, entry: &DimensionEntry) -> Result<usize> {
    let sql = format!(
        "INSERT INTO {} (id, source_id, name, normalized_name) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO NOTHING",
        family.table()
    );
    let n = conn.prepare_cached(&sql)?.execute(rusqlite::params![
        entry.id,
        entry.source_id,
        entry.name,
        entry.normalized,
    ])?;
    Ok(n)
}

pub fn fetch_dimension(conn: &Connection, family: Family, id: &str) -> Result<Option<DimensionEntry>> {
    let sql = format!(
        "SELECT id, source_id, name, COALESCE(normalized_name, '') FROM {} WHERE id = ?1",
        family.table()
    );
    let entry = conn
        .prepare_cached(&sql)?
        .query_row([id], |row| {
            Ok(DimensionEntry {
                id: row.get(0)?,
                source_id: row.get(1)?,
                name: row.get(2)?,
                normalized: row.get(3)?,
            })
        })
        .optional()?;
    Ok(entry)
}

pub fn list_dimensions(conn: &Connection, family: Family, pending_only: bool) -> Result<Vec<DimensionEntry>> {
    let filter = if pending_only {
        " WHERE COALESCE(normalized_name, '') = ''"
    } else {
        ""
    };
    let sql = format!(
        "SELECT id, source_id, name, COALESCE(normalized_name, '') FROM {}{} ORDER BY source_id, name",
        family.table(),
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(DimensionEntry {
                id: row.get(0)?,
                source_id: row.get(1)?,
                name: row.get(2)?,
                normalized: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_normalized(conn: &Connection, family: Family, id: &str, label: &str) -> Result<usize> {
    let sql = format!("UPDATE {} SET normalized_name = ?1 WHERE id = ?2", family.table());
    Ok(conn.execute(&sql, rusqlite::params![label, id])?)
}

// ── Stats ──

pub struct Stats {
    pub flats: usize,
    pub sources: Vec<(String, usize)>,
    pub room_types: usize,
    pub room_types_pending: usize,
    pub status_types: usize,
    pub status_types_pending: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

    let mut stmt = conn.prepare(
        "SELECT COALESCE(fid_id, ''), COUNT(*) FROM flats GROUP BY fid_id ORDER BY COUNT(*) DESC",
    )?;
    let sources = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stats {
        flats: count("SELECT COUNT(*) FROM flats")?,
        sources,
        room_types: count("SELECT COUNT(*) FROM room_types")?,
        room_types_pending: count("SELECT COUNT(*) FROM room_types WHERE normalized_name = ''")?,
        status_types: count("SELECT COUNT(*) FROM status_types")?,
        status_types_pending: count("SELECT COUNT(*) FROM status_types WHERE normalized_name = ''")?,
    })
}
