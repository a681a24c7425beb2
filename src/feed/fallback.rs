//! Second chance for feeds whose offer tag matched nothing.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::info;

use super::element::{Element, OfferNode};
use super::extract::Extractor;
use super::reader::element_from;
use crate::sources::FeedSource;
use crate::utils::now_stamp;
use crate::writer::RecordWriter;

/// Alternate extraction strategy, run when the streaming pass produced an
/// empty artifact. Receives the source (url, id, paths), the downloaded
/// feed, which still exists for the duration of the call, and the artifact
/// path to fill. Returns the number of records written.
pub trait Fallback: Send + Sync {
    fn extract(&self, source: &FeedSource, feed: &Path, output: &Path) -> Result<usize>;
}

/// Loads the whole document and walks the full `parents` chain from the
/// root, matching tag names case-insensitively and fanning out over every
/// match at each level.
///
/// Offers are matched without their ancestors, so only forward paths
/// resolve here; `..` fields of relative sources come out empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParentsChain;

impl Fallback for ParentsChain {
    fn extract(&self, source: &FeedSource, feed: &Path, output: &Path) -> Result<usize> {
        let root = load_document(feed)
            .with_context(|| format!("Failed to load feed {:?} for source {}", feed, source.id))?;
        let offers = match root {
            Some(root) => walk_parents(root, &source.paths.parents),
            None => Vec::new(),
        };

        let extractor = Extractor::for_source(source);
        let stamp = now_stamp();
        let mut writer = RecordWriter::create(output)?;
        for offer in offers {
            writer.write(&extractor.extract(&OfferNode::detached(offer), &stamp))?;
        }
        let written = writer.written();
        writer.finish()?;
        info!(source = %source.id, records = written, "Parents-chain fallback finished");
        Ok(written)
    }
}

fn walk_parents(root: Element, parents: &[String]) -> Vec<Element> {
    let mut chain = parents;
    // The chain may or may not start at the document element.
    if let Some(first) = chain.first() {
        if first.eq_ignore_ascii_case(&root.name) {
            chain = &chain[1..];
        }
    }
    if chain.is_empty() {
        return vec![root];
    }

    let mut level = vec![root];
    for tag in chain {
        level = level
            .into_iter()
            .flat_map(|e| e.children)
            .filter(|c| c.name.eq_ignore_ascii_case(tag))
            .collect();
        if level.is_empty() {
            break;
        }
    }
    level
}

fn load_document(path: &Path) -> Result<Option<Element>> {
    let file = File::open(path)?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    let mut buf = Vec::new();
    let mut open: Vec<Element> = Vec::new();

    loop {
        let closed = match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                open.push(element_from(&e, reader.decoder())?);
                None
            }
            Event::Empty(e) => Some(element_from(&e, reader.decoder())?),
            Event::End(_) => open.pop(),
            Event::Text(t) => {
                if let Some(top) = open.last_mut() {
                    if top.children.is_empty() {
                        match t.unescape() {
                            Ok(text) => top.text.push_str(&text),
                            Err(_) => top.text.push_str(&reader.decoder().decode(&t)?),
                        }
                    }
                }
                None
            }
            Event::CData(c) => {
                if let Some(top) = open.last_mut() {
                    if top.children.is_empty() {
                        top.text.push_str(&c.decode()?);
                    }
                }
                None
            }
            Event::Eof => return Ok(None),
            _ => None,
        };
        buf.clear();

        if let Some(element) = closed {
            match open.last_mut() {
                Some(parent) => parent.children.push(element),
                None => return Ok(Some(element)),
            }
        }
    }
}
