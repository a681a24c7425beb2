pub mod batch;
pub mod element;
pub mod extract;
pub mod fallback;
pub mod fetch;
pub mod path;
pub mod reader;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::ThreadPoolBuilder;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::settings::Settings;
use crate::sources::FeedSource;
use crate::writer::RecordWriter;
use batch::{run_batches, BatchStats};
use extract::Extractor;
use fallback::Fallback;
use fetch::{fetch_to, TempFeed};
use reader::OfferReader;

/// Result of processing one feed. Failures are reported here, never raised.
#[derive(Debug, Clone)]
pub struct FeedOutcome {
    pub source_id: String,
    pub success: bool,
    pub records: usize,
    pub used_fallback: bool,
    pub artifact: PathBuf,
    pub error: Option<String>,
}

impl FeedOutcome {
    pub fn failed(source_id: &str, artifact: PathBuf, error: String) -> Self {
        FeedOutcome {
            source_id: source_id.to_string(),
            success: false,
            records: 0,
            used_fallback: false,
            artifact,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub batch_size: usize,
    pub workers: usize,
}

/// Feed → intermediate artifact, for one source.
pub fn parse_to_artifact(
    feed: &Path,
    source: &FeedSource,
    output: &Path,
    opts: ParseOptions,
) -> Result<BatchStats, FeedError> {
    let mut reader = OfferReader::open(feed, source.offer_tag(), source.traversal.needs_context())?;
    let extractor = Extractor::for_source(source);
    debug!(
        source = %source.id,
        fields = ?extractor.field_names().collect::<Vec<_>>(),
        "Compiled field paths"
    );
    let pool = ThreadPoolBuilder::new().num_threads(opts.workers.max(1)).build()?;
    let mut writer = RecordWriter::create(output)?;
    let stats = run_batches(&mut reader, &extractor, &pool, opts.batch_size, &mut writer)?;
    writer.finish()?;
    Ok(stats)
}

pub struct FeedRunner {
    settings: Arc<Settings>,
    client: reqwest::Client,
    fallback: Arc<dyn Fallback>,
}

impl FeedRunner {
    pub fn new(settings: Arc<Settings>, fallback: Arc<dyn Fallback>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        Ok(FeedRunner {
            settings,
            client,
            fallback,
        })
    }

    pub fn artifact_path(&self, source_id: &str) -> PathBuf {
        self.settings.data_dir.join(format!("{}.jsonl", source_id))
    }

    fn temp_path(&self, source_id: &str) -> PathBuf {
        self.settings.data_dir.join(format!("temp_{}.xml", source_id))
    }

    /// Runs one feed end to end and reports the outcome.
    pub async fn run_one(&self, source: &FeedSource) -> FeedOutcome {
        let started = Instant::now();
        let artifact = self.artifact_path(&source.id);
        match self.try_run(source, &artifact).await {
            Ok((records, used_fallback)) => {
                info!(
                    source = %source.id,
                    records,
                    used_fallback,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Feed processed"
                );
                FeedOutcome {
                    source_id: source.id.clone(),
                    success: true,
                    records,
                    used_fallback,
                    artifact,
                    error: None,
                }
            }
            Err(e) => {
                warn!(source = %source.id, "Feed failed: {}", e);
                FeedOutcome::failed(&source.id, artifact, e.to_string())
            }
        }
    }

    async fn try_run(&self, source: &FeedSource, artifact: &Path) -> Result<(usize, bool), FeedError> {
        source.validate()?;
        tokio::fs::create_dir_all(&self.settings.data_dir).await?;

        // Guard first, so a half-written download is removed too.
        let temp = TempFeed::new(self.temp_path(&source.id));
        let bytes = fetch_to(&self.client, &source.url, temp.path()).await?;
        debug!(source = %source.id, bytes, "Feed fetched");

        let opts = ParseOptions {
            batch_size: self.settings.offer_batch_size,
            workers: self.settings.extract_workers,
        };
        let stats = {
            let feed = temp.path().to_path_buf();
            let source = source.clone();
            let output = artifact.to_path_buf();
            tokio::task::spawn_blocking(move || parse_to_artifact(&feed, &source, &output, opts))
                .await??
        };
        info!(
            source = %source.id,
            offers = stats.offers,
            batches = stats.batches.len(),
            "Streaming pass done"
        );

        if !artifact_is_empty(artifact).await? {
            return Ok((stats.records, false));
        }

        warn!(source = %source.id, "No records extracted, running fallback");
        let fallback = Arc::clone(&self.fallback);
        let feed = temp.path().to_path_buf();
        let source = source.clone();
        let output = artifact.to_path_buf();
        let records = tokio::task::spawn_blocking(move || fallback.extract(&source, &feed, &output))
            .await?
            .map_err(|e| FeedError::Fallback(format!("{:#}", e)))?;
        Ok((records, true))
    }

    /// Runs every source, at most `feed_workers` at a time. One feed failing
    /// has no effect on the others.
    pub async fn run_all(self: Arc<Self>, sources: Vec<FeedSource>) -> Vec<FeedOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.settings.feed_workers.max(1)));
        let pb = progress_bar(sources.len() as u64);
        let mut handles = Vec::with_capacity(sources.len());

        for source in sources {
            let runner = Arc::clone(&self);
            let sem = Arc::clone(&semaphore);
            let pb = pb.clone();
            let id = source.id.clone();
            let artifact = self.artifact_path(&source.id);
            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let outcome = runner.run_one(&source).await;
                pb.inc(1);
                outcome
            });
            handles.push((id, artifact, handle));
        }

        let outcomes = collect_outcomes(handles).await;
        pb.finish_and_clear();
        outcomes
    }
}

/// One outcome per spawned feed, in spawn order. A task that died is
/// reported as a failed feed.
async fn collect_outcomes(handles: Vec<(String, PathBuf, JoinHandle<FeedOutcome>)>) -> Vec<FeedOutcome> {
    let mut outcomes = Vec::with_capacity(handles.len());
    for (source_id, artifact, handle) in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                warn!(source = %source_id, "Feed task panicked: {}", e);
                outcomes.push(FeedOutcome::failed(&source_id, artifact, format!("worker: {}", e)));
            }
        }
    }
    outcomes
}

async fn artifact_is_empty(path: &Path) -> Result<bool, FeedError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len() == 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} feeds ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::sources::parse_sources;

    struct CountingFallback {
        calls: AtomicUsize,
    }

    impl Fallback for CountingFallback {
        fn extract(&self, _source: &FeedSource, feed: &Path, output: &Path) -> Result<usize> {
            assert!(feed.exists(), "temp feed must outlive the fallback call");
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(output, "{\"flat_id\":\"fb\"}\n")?;
            Ok(1)
        }
    }

    fn settings(dir: &Path) -> Arc<Settings> {
        Arc::new(Settings {
            data_dir: dir.join("base_flat"),
            ..Settings::default()
        })
    }

    fn source(id: &str, url: &str) -> FeedSource {
        parse_sources(&format!(
            r#"[{{"id": "{id}", "url": "{url}", "paths": {{
                "parents": ["realty-feed", "offer"],
                "flat_id": {{"tags": [], "attrs": {{"name": "internal-id"}}}},
                "price": {{"tags": ["price", "value"]}},
                "rooms": {{"tags": ["rooms"]}}
            }}}}]"#
        ))
        .unwrap()
        .remove(0)
    }

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    fn runner(dir: &Path, fallback: Arc<dyn Fallback>) -> FeedRunner {
        FeedRunner::new(settings(dir), fallback).unwrap()
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir.join("base_flat"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("temp_"))
            .collect()
    }

    #[tokio::test]
    async fn extracts_fixture_feed() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Arc::new(CountingFallback { calls: AtomicUsize::new(0) });
        let runner = runner(dir.path(), fallback.clone());

        let outcome = runner.run_one(&source("yrl", &fixture("yandex_feed.xml"))).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.records, 3);
        assert!(!outcome.used_fallback);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);

        let text = std::fs::read_to_string(&outcome.artifact).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains(r#""flat_id":"1001""#));
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn zero_offers_triggers_fallback_once() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Arc::new(CountingFallback { calls: AtomicUsize::new(0) });
        let runner = runner(dir.path(), fallback.clone());

        let outcome = runner.run_one(&source("none", &fixture("empty_feed.xml"))).await;
        assert!(outcome.success);
        assert!(outcome.used_fallback);
        assert_eq!(outcome.records, 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failures_are_outcomes_and_leave_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Arc::new(CountingFallback { calls: AtomicUsize::new(0) });
        let runner = Arc::new(runner(dir.path(), fallback.clone()));

        let broken = dir.path().join("broken.xml");
        std::fs::write(&broken, "<realty-feed><offer internal-id=\"1\"><price></offer>").unwrap();

        let outcomes = runner
            .run_all(vec![
                source("missing", "/no/such/feed.xml"),
                source("broken", broken.to_str().unwrap()),
                source("good", &fixture("yandex_feed.xml")),
            ])
            .await;

        let by_id = |id: &str| outcomes.iter().find(|o| o.source_id == id).unwrap();
        assert!(!by_id("missing").success);
        assert!(!by_id("broken").success);
        assert!(by_id("good").success);
        assert_eq!(by_id("good").records, 3);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
        assert!(temp_files(dir.path()).is_empty());
    }

    fn explode() -> FeedOutcome {
        panic!("parser blew up")
    }

    #[tokio::test]
    async fn dead_feed_task_still_yields_an_outcome() {
        let handles = vec![
            (
                "ok".to_string(),
                PathBuf::from("ok.jsonl"),
                tokio::spawn(async {
                    FeedOutcome {
                        source_id: "ok".into(),
                        success: true,
                        records: 2,
                        used_fallback: false,
                        artifact: PathBuf::from("ok.jsonl"),
                        error: None,
                    }
                }),
            ),
            (
                "boom".to_string(),
                PathBuf::from("boom.jsonl"),
                tokio::spawn(async { explode() }),
            ),
        ];

        let outcomes = collect_outcomes(handles).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[1].source_id, "boom");
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].artifact, PathBuf::from("boom.jsonl"));
        assert!(outcomes[1].error.is_some());
    }

    #[tokio::test]
    async fn default_fallback_recovers_case_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path(), Arc::new(fallback::ParentsChain));

        let feed = dir.path().join("upper.xml");
        std::fs::write(
            &feed,
            r#"<Realty-Feed><Offer internal-id="u1"><price><value>9</value></price></Offer></Realty-Feed>"#,
        )
        .unwrap();
        let outcome = runner.run_one(&source("upper", feed.to_str().unwrap())).await;
        assert!(outcome.success);
        assert!(outcome.used_fallback);
        assert_eq!(outcome.records, 1);
        let text = std::fs::read_to_string(&outcome.artifact).unwrap();
        assert!(text.contains(r#""flat_id":"u1""#));
    }

    #[test]
    fn relative_fixture_reads_building_context() {
        let dir = tempfile::tempdir().unwrap();
        let source = parse_sources(&std::fs::read_to_string(fixture("domclick_sources.json")).unwrap())
            .unwrap()
            .remove(0);
        let out = dir.path().join("dk.jsonl");
        let stats = parse_to_artifact(
            std::path::Path::new(&fixture("domclick_feed.xml")),
            &source,
            &out,
            ParseOptions { batch_size: 2, workers: 3 },
        )
        .unwrap();
        assert_eq!(stats.batches, [2, 1]);

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let flat = lines.iter().find(|l| l["flat_id"] == "f-3").unwrap();
        assert_eq!(flat["house"], "Корпус 2");
        assert_eq!(flat["complex"], "ЖК Парк");
        assert_eq!(flat["price"], "7300000");
        assert_eq!(flat["type_room"], "2");
    }
}
