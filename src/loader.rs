//! Intermediate artifacts → `flats` table.
//!
//! One blocking worker per file streams lines, parses rows and ships full
//! buffers over a bounded queue. A single writer task owns the database
//! connection, resolves dimensions and upserts each buffer in its own
//! transaction. Buffers already committed stay committed whatever happens
//! to the rest of the file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::db::{self, FlatRow};
use crate::dimensions::{Family, Normalizer};
use crate::utils::{timestamp_or_now, value_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Streaming,
    Buffering,
    Flushing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub state: FileState,
    /// Rows parsed from the file.
    pub read: usize,
    /// Lines skipped: no `flat_id` or not JSON.
    pub skipped: usize,
    /// Rows committed to the store.
    pub loaded: usize,
    pub batches: usize,
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == FileState::Done
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub queue: usize,
}

struct WriteBatch {
    file: usize,
    rows: Vec<FlatRow>,
}

#[derive(Debug, Default)]
struct WriteTally {
    loaded: usize,
    batches: usize,
    dropped: usize,
    error: Option<String>,
}

struct ReadReport {
    state: FileState,
    read: usize,
    skipped: usize,
    error: Option<String>,
}

/// Every non-empty `*.jsonl` in `dir`, sorted by name.
pub fn artifacts_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        let is_jsonl = path.extension().map(|e| e == "jsonl").unwrap_or(false);
        if is_jsonl && std::fs::metadata(&path)?.len() > 0 {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Loads `files` into the store behind `conn`. The connection moves into
/// the writer task for the duration of the load.
pub async fn load_files(conn: Connection, files: Vec<PathBuf>, opts: LoadOptions) -> Result<Vec<FileOutcome>> {
    let (tx, rx) = mpsc::channel::<WriteBatch>(opts.queue.max(1));
    let writer = tokio::task::spawn_blocking(move || write_loop(conn, rx));

    let semaphore = Arc::new(Semaphore::new(opts.workers.max(1)));
    let mut handles = Vec::with_capacity(files.len());
    for (index, path) in files.iter().enumerate() {
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();
        let path = path.clone();
        let batch_size = opts.batch_size.max(1);
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            tokio::task::spawn_blocking(move || stream_file(index, &path, batch_size, &tx)).await
        }));
    }
    // The writer stops once every worker has dropped its sender.
    drop(tx);

    let pb = ProgressBar::new(files.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} files ({eta})") {
        pb.set_style(style.progress_chars("=> "));
    }
    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        let report = match handle.await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) | Err(e) => ReadReport {
                state: FileState::Failed,
                read: 0,
                skipped: 0,
                error: Some(format!("worker: {}", e)),
            },
        };
        reports.push(report);
        pb.inc(1);
    }
    pb.finish_and_clear();
    let mut tallies = writer.await.context("Writer task failed")?;

    let outcomes = files
        .into_iter()
        .zip(reports)
        .enumerate()
        .map(|(index, (path, report))| {
            let tally = tallies.remove(&index).unwrap_or_default();
            let error = report.error.or(tally.error);
            let state = if error.is_some() {
                FileState::Failed
            } else {
                report.state
            };
            if tally.dropped > 0 {
                warn!(file = ?path, dropped = tally.dropped, "Rows after a failed flush were not loaded");
            }
            FileOutcome {
                path,
                state,
                read: report.read,
                skipped: report.skipped,
                loaded: tally.loaded,
                batches: tally.batches,
                error,
            }
        })
        .collect();
    Ok(outcomes)
}

fn stream_file(index: usize, path: &Path, batch_size: usize, tx: &mpsc::Sender<WriteBatch>) -> ReadReport {
    let mut report = ReadReport {
        state: FileState::Pending,
        read: 0,
        skipped: 0,
        error: None,
    };
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            report.state = FileState::Failed;
            report.error = Some(format!("open: {}", e));
            return report;
        }
    };

    report.state = FileState::Streaming;
    debug!(file = ?path, "Streaming");
    let mut buffer: Vec<FlatRow> = Vec::with_capacity(batch_size.min(8192));

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                report.state = FileState::Failed;
                report.error = Some(format!("read at line {}: {}", lineno + 1, e));
                return report;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(Some(row)) => {
                report.read += 1;
                report.state = FileState::Buffering;
                buffer.push(row);
            }
            Ok(None) => report.skipped += 1,
            Err(e) => {
                debug!(file = ?path, line = lineno + 1, "Skipping malformed line: {}", e);
                report.skipped += 1;
            }
        }

        if buffer.len() >= batch_size {
            report.state = FileState::Flushing;
            if let Err(e) = send(index, &mut buffer, tx) {
                report.state = FileState::Failed;
                report.error = Some(e);
                return report;
            }
        }
    }

    if !buffer.is_empty() {
        report.state = FileState::Flushing;
        if let Err(e) = send(index, &mut buffer, tx) {
            report.state = FileState::Failed;
            report.error = Some(e);
            return report;
        }
    }
    report.state = FileState::Done;
    report
}

fn send(file: usize, buffer: &mut Vec<FlatRow>, tx: &mpsc::Sender<WriteBatch>) -> std::result::Result<(), String> {
    let rows = std::mem::take(buffer);
    tx.blocking_send(WriteBatch { file, rows })
        .map_err(|_| "database writer stopped".to_string())
}

/// One artifact line → a row with raw dimension labels. `Ok(None)` when the
/// line has no listing id.
pub fn parse_line(line: &str) -> Result<Option<FlatRow>, serde_json::Error> {
    let flat: Map<String, Value> = serde_json::from_str(line)?;
    let get = |key: &str| value_text(flat.get(key));

    let id_flat = get("flat_id");
    if id_flat.is_empty() {
        return Ok(None);
    }
    let date = timestamp_or_now(flat.get("date").and_then(Value::as_str));

    Ok(Some(FlatRow {
        id_flat,
        number: get("number"),
        number_on_floor: get("number_on_floor"),
        complex: get("complex"),
        id_complex: get("complex_id"),
        house: get("house"),
        id_house: get("house_id"),
        floor: get("floor"),
        section: get("section"),
        rooms: get("rooms"),
        flat_type: get("type_room"),
        price: get("price"),
        price_base: get("price_base"),
        square: get("area"),
        square_live: get("areaH"),
        square_hook: get("areaK"),
        status: get("status"),
        decoration: get("decoration"),
        plan: get("plan"),
        floor_plan: get("floor_plan"),
        fid_id: get("fid_id"),
        date,
    }))
}

fn write_loop(conn: Connection, mut rx: mpsc::Receiver<WriteBatch>) -> HashMap<usize, WriteTally> {
    let mut tallies: HashMap<usize, WriteTally> = HashMap::new();
    let mut normalizer = Normalizer::new();

    while let Some(WriteBatch { file, mut rows }) = rx.blocking_recv() {
        let tally = tallies.entry(file).or_default();
        if tally.error.is_some() {
            tally.dropped += rows.len();
            continue;
        }
        match save_batch(&conn, &mut normalizer, &mut rows) {
            Ok(n) => {
                tally.loaded += n;
                tally.batches += 1;
                debug!(file, rows = n, "Batch committed");
            }
            Err(e) => {
                warn!(file, "Batch failed: {:#}", e);
                normalizer.forget();
                tally.dropped += rows.len();
                tally.error = Some(format!("{:#}", e));
            }
        }
    }
    tallies
}

/// Resolves both dimensions and upserts the rows in one transaction.
fn save_batch(conn: &Connection, normalizer: &mut Normalizer, rows: &mut [FlatRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    for row in rows.iter_mut() {
        row.flat_type = normalizer.resolve(&tx, Family::Room, &row.fid_id, &row.flat_type)?;
        row.status = normalizer.resolve(&tx, Family::Status, &row.fid_id, &row.status)?;
    }
    let n = db::upsert_flats(&tx, rows)?;
    tx.commit()?;
    Ok(n)
}

pub fn summarize(outcomes: &[FileOutcome]) {
    let ok = outcomes.iter().filter(|o| o.succeeded()).count();
    let rows: usize = outcomes.iter().map(|o| o.loaded).sum();
    info!(files = outcomes.len(), ok, rows, "Load finished");
}
