use std::io::{BufRead, Write};

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use super::element::OfferNode;
use super::extract::{Extractor, Record};
use super::reader::OfferReader;
use crate::error::FeedError;
use crate::utils::now_stamp;
use crate::writer::RecordWriter;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub offers: usize,
    /// Size of every flushed batch, in order.
    pub batches: Vec<usize>,
    pub records: usize,
}

/// Drains the reader in batches of `batch_size` offers. Each batch is
/// extracted on `pool`, written, and dropped before the next one is read,
/// so at most one batch of offer subtrees is alive at a time.
pub fn run_batches<R: BufRead, W: Write>(
    reader: &mut OfferReader<R>,
    extractor: &Extractor,
    pool: &ThreadPool,
    batch_size: usize,
    writer: &mut RecordWriter<W>,
) -> Result<BatchStats, FeedError> {
    let batch_size = batch_size.max(1);
    let mut stats = BatchStats::default();
    let mut batch: Vec<OfferNode> = Vec::with_capacity(batch_size);

    while let Some(offer) = reader.next_offer()? {
        batch.push(offer);
        if batch.len() >= batch_size {
            flush(&mut batch, extractor, pool, writer, &mut stats)?;
        }
    }
    if !batch.is_empty() {
        flush(&mut batch, extractor, pool, writer, &mut stats)?;
    }
    Ok(stats)
}

fn flush<W: Write>(
    batch: &mut Vec<OfferNode>,
    extractor: &Extractor,
    pool: &ThreadPool,
    writer: &mut RecordWriter<W>,
    stats: &mut BatchStats,
) -> Result<(), FeedError> {
    let stamp = now_stamp();
    let records: Vec<Record> = pool.install(|| {
        batch
            .par_iter()
            .map(|offer| extractor.extract(offer, &stamp))
            .collect()
    });
    for record in &records {
        writer.write(record)?;
    }

    stats.offers += batch.len();
    stats.records += records.len();
    stats.batches.push(batch.len());
    debug!(batch = stats.batches.len(), size = batch.len(), "Batch written");
    batch.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::parse_sources;
    use rayon::ThreadPoolBuilder;

    fn feed(n: usize) -> String {
        let mut xml = String::from(r#"<realty-feed xmlns="http://webmaster.yandex.ru/schemas/feed">"#);
        for i in 0..n {
            xml.push_str(&format!(r#"<offer internal-id="{i}"><price><value>{}</value></price></offer>"#, i * 10));
        }
        xml.push_str("</realty-feed>");
        xml
    }

    fn extractor() -> Extractor {
        let source = parse_sources(
            r#"[{"id": "3", "url": "u", "paths": {
                "parents": ["realty-feed", "offer"],
                "flat_id": {"tags": [], "attrs": {"name": "internal-id"}},
                "price": {"tags": ["price", "value"]}
            }}]"#,
        )
        .unwrap()
        .remove(0);
        Extractor::for_source(&source)
    }

    fn run(n: usize, batch_size: usize) -> (BatchStats, Vec<serde_json::Value>) {
        let xml = feed(n);
        let mut reader = OfferReader::from_str(&xml, "offer", false);
        let pool = ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        let mut writer = RecordWriter::new(Vec::new());
        let stats = run_batches(&mut reader, &extractor(), &pool, batch_size, &mut writer).unwrap();
        let out = String::from_utf8(writer.finish().unwrap()).unwrap();
        let lines = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        (stats, lines)
    }

    #[test]
    fn hundred_twenty_offers_in_three_batches() {
        let (stats, lines) = run(120, 50);
        assert_eq!(stats.batches, [50, 50, 20]);
        assert_eq!(stats.offers, 120);
        assert_eq!(stats.records, 120);
        assert_eq!(lines.len(), 120);

        let mut ids: Vec<u32> = lines
            .iter()
            .map(|l| l["flat_id"].as_str().unwrap().parse().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..120).collect::<Vec<_>>());
        assert!(lines.iter().all(|l| l["fid_id"] == "3"));
    }

    #[test]
    fn exact_multiple_has_no_trailing_batch() {
        let (stats, _) = run(100, 50);
        assert_eq!(stats.batches, [50, 50]);
    }

    #[test]
    fn empty_feed_writes_nothing() {
        let (stats, lines) = run(0, 50);
        assert!(stats.batches.is_empty());
        assert!(lines.is_empty());
    }

    #[test]
    fn values_line_up_with_offers() {
        let (_, lines) = run(7, 3);
        for line in lines {
            let id: usize = line["flat_id"].as_str().unwrap().parse().unwrap();
            assert_eq!(line["price"], (id * 10).to_string());
        }
    }
}
