//! Streaming offer reader.
//!
//! Walks the document once with quick-xml, keeping only the element stack
//! and the offer currently being built. Names are reduced to their local
//! part, so `<yrl:offer>` and `<offer>` are the same tag. Text, names and
//! attribute values are decoded with the encoding the XML declaration names
//! (UTF-8 when it names none).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Decoder, Reader};

use super::element::{Element, OfferNode};
use crate::error::FeedError;

enum Step {
    Open(Element),
    Leaf(Element),
    Close,
    Text(String),
}

pub struct OfferReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    offer_tag: String,
    keep_context: bool,
    open: Vec<Element>,
    /// Parallel to `open`: whether the frame has contained a completed offer.
    held_offer: Vec<bool>,
    /// Stack index of the outermost offer currently open.
    offer_at: Option<usize>,
    offers_seen: usize,
}

impl OfferReader<BufReader<File>> {
    pub fn open(path: &Path, offer_tag: &str, keep_context: bool) -> Result<Self, FeedError> {
        let file = File::open(path)?;
        let buf_reader = BufReader::with_capacity(1024 * 1024, file);
        Ok(Self::new(buf_reader, offer_tag, keep_context))
    }
}

impl<'a> OfferReader<&'a [u8]> {
    pub fn from_str(xml: &'a str, offer_tag: &str, keep_context: bool) -> Self {
        Self::new(xml.as_bytes(), offer_tag, keep_context)
    }
}

impl<R: BufRead> OfferReader<R> {
    pub fn new(source: R, offer_tag: &str, keep_context: bool) -> Self {
        OfferReader {
            reader: Reader::from_reader(source),
            buf: Vec::with_capacity(8192),
            offer_tag: offer_tag.to_string(),
            keep_context,
            open: Vec::new(),
            held_offer: Vec::new(),
            offer_at: None,
            offers_seen: 0,
        }
    }

    pub fn offers_seen(&self) -> usize {
        self.offers_seen
    }

    fn in_offer(&self) -> bool {
        self.offer_at.is_some()
    }

    /// Next complete offer, or `None` at end of document.
    pub fn next_offer(&mut self) -> Result<Option<OfferNode>, FeedError> {
        loop {
            self.buf.clear();
            let step = match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => Step::Open(element_from(&e, self.reader.decoder())?),
                Event::Empty(e) => Step::Leaf(element_from(&e, self.reader.decoder())?),
                Event::End(_) => Step::Close,
                Event::Text(t) => Step::Text(match t.unescape() {
                    Ok(s) => s.into_owned(),
                    // Unknown entities stay as written.
                    Err(_) => self
                        .reader
                        .decoder()
                        .decode(&t)
                        .map_err(quick_xml::Error::from)?
                        .into_owned(),
                }),
                Event::CData(c) => Step::Text(c.decode().map_err(quick_xml::Error::from)?.into_owned()),
                Event::Eof => return Ok(None),
                _ => continue,
            };

            let closed = match step {
                Step::Open(element) => {
                    self.mark_offer(&element);
                    self.open.push(element);
                    self.held_offer.push(false);
                    None
                }
                Step::Leaf(element) => {
                    self.mark_offer(&element);
                    Some(element)
                }
                Step::Close => {
                    let held = self.held_offer.pop().unwrap_or(false);
                    match self.open.pop() {
                        // Containers of finished offers are never reachable
                        // from a later offer's context; drop them.
                        Some(_) if held => {
                            self.mark_held();
                            None
                        }
                        other => other,
                    }
                }
                Step::Text(text) => {
                    self.push_text(&text);
                    None
                }
            };

            if let Some(element) = closed {
                if let Some(offer) = self.close(element) {
                    return Ok(Some(offer));
                }
            }
        }
    }

    fn mark_offer(&mut self, element: &Element) {
        if self.offer_at.is_none() && element.name == self.offer_tag {
            self.offer_at = Some(self.open.len());
        }
    }

    fn push_text(&mut self, text: &str) {
        if !(self.in_offer() || self.keep_context) {
            return;
        }
        // Only text ahead of the first child belongs to the element.
        if let Some(top) = self.open.last_mut() {
            if top.children.is_empty() {
                top.text.push_str(text);
            }
        }
    }

    /// Handles an element that just closed; `self.open` no longer holds it.
    fn close(&mut self, element: Element) -> Option<OfferNode> {
        let level = self.open.len();
        if self.offer_at == Some(level) {
            self.offer_at = None;
            self.offers_seen += 1;
            let offer = self.wrap(element);
            self.mark_held();
            return Some(offer);
        }
        if self.in_offer() || self.keep_context {
            if let Some(parent) = self.open.last_mut() {
                parent.children.push(element);
            }
        }
        None
    }

    fn mark_held(&mut self) {
        if let Some(flag) = self.held_offer.last_mut() {
            *flag = true;
        }
    }

    fn wrap(&self, offer: Element) -> OfferNode {
        if !self.keep_context || self.open.is_empty() {
            return OfferNode::detached(offer);
        }
        let mut node = offer;
        for ancestor in self.open.iter().rev() {
            let mut frame = ancestor.clone();
            frame.children.push(node);
            node = frame;
        }
        OfferNode::with_context(node, self.open.len())
    }
}

/// Element header with namespace prefixes dropped from the tag and from
/// attribute names. Namespace declarations are not kept.
pub(crate) fn element_from(start: &BytesStart, decoder: Decoder) -> Result<Element, quick_xml::Error> {
    let name = decoder.decode(start.local_name().as_ref())?.into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let key = decoder.decode(attr.key.local_name().as_ref())?.into_owned();
        let value = match attr.decode_and_unescape_value(decoder) {
            Ok(v) => v.into_owned(),
            Err(_) => decoder.decode(&attr.value)?.into_owned(),
        };
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        ..Default::default()
    })
}

/// Reads every offer of an in-memory document. Test helper and small-feed
/// convenience; the pipeline itself goes through [`OfferReader::next_offer`].
pub fn collect_offers(xml: &str, offer_tag: &str, keep_context: bool) -> Result<Vec<OfferNode>, FeedError> {
    let mut reader = OfferReader::from_str(xml, offer_tag, keep_context);
    let mut offers = Vec::new();
    while let Some(offer) = reader.next_offer()? {
        offers.push(offer);
    }
    Ok(offers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_namespaces() {
        let xml = r#"<?xml version="1.0"?>
            <realty-feed xmlns="http://webmaster.yandex.ru/schemas/feed" xmlns:y="urn:y">
              <y:offer y:internal-id="1"><y:price><value>100</value></y:price></y:offer>
              <offer internal-id="2"><price><value>200</value></price></offer>
            </realty-feed>"#;
        let offers = collect_offers(xml, "offer", false).unwrap();
        assert_eq!(offers.len(), 2);
        let first = offers[0].offer();
        assert_eq!(first.name, "offer");
        assert_eq!(first.attr("internal-id"), Some("1"));
        assert_eq!(first.children[0].name, "price");
        assert_eq!(first.children[0].children[0].trimmed_text(), "100");
        assert!(first.attrs.iter().all(|(k, _)| !k.starts_with("xmlns")));
    }

    #[test]
    fn detached_offers_carry_no_ancestors() {
        let xml = "<feed><meta>x</meta><offer><a>1</a></offer></feed>";
        let offers = collect_offers(xml, "offer", false).unwrap();
        assert_eq!(offers[0].lineage().len(), 1);
    }

    #[test]
    fn context_keeps_ancestors_and_their_earlier_children() {
        let xml = "<complexes><complex><name>Park</name><buildings><building>\
                   <name>B1</name><flats><flat><id>1</id></flat><flat><id>2</id></flat></flats>\
                   </building></buildings></complex></complexes>";
        let offers = collect_offers(xml, "flat", true).unwrap();
        assert_eq!(offers.len(), 2);
        let names: Vec<_> = offers[1].lineage().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["complexes", "complex", "buildings", "building", "flats", "flat"]);
        // Completed offers are not retained under their parent.
        let flats = offers[1].lineage()[4];
        assert_eq!(flats.children.len(), 1);
        assert_eq!(offers[1].offer().children[0].trimmed_text(), "2");
    }

    #[test]
    fn nested_same_tag_stays_inside_outer_offer() {
        let xml = "<r><offer><offer>inner</offer></offer></r>";
        let offers = collect_offers(xml, "offer", false).unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].offer().children[0].trimmed_text(), "inner");
    }

    #[test]
    fn self_closing_offer_and_cdata() {
        let xml = r#"<r><offer id="a"/><offer><d><![CDATA[<b>rich</b>]]></d></offer></r>"#;
        let offers = collect_offers(xml, "offer", false).unwrap();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].offer().attr("id"), Some("a"));
        assert_eq!(offers[1].offer().children[0].text, "<b>rich</b>");
    }

    #[test]
    fn malformed_document_is_an_error() {
        let xml = "<r><offer><a>1</b></offer></r>";
        assert!(collect_offers(xml, "offer", false).is_err());
    }

    #[test]
    fn context_does_not_grow_with_position() {
        let mut xml = String::from("<complexes>");
        for i in 0..300 {
            xml.push_str(&format!(
                "<complex><name>C{i}</name><buildings><building><name>B{i}</name>\
                 <flats><flat><num>{i}</num></flat></flats></building></buildings></complex>"
            ));
        }
        xml.push_str("</complexes>");

        let offers = collect_offers(&xml, "flat", true).unwrap();
        assert_eq!(offers.len(), 300);
        for i in [0, 99, 299] {
            let lineage = offers[i].lineage();
            assert_eq!(lineage[0].children.len(), 1, "offer {i}");
            assert_eq!(lineage[1].children[0].trimmed_text(), format!("C{i}"));
            assert_eq!(lineage[3].children[0].trimmed_text(), format!("B{i}"));
        }
    }

    #[test]
    fn finished_sibling_containers_are_dropped_but_scalars_kept() {
        let xml = "<complex><name>Park</name><building><name>B1</name><flat/></building>\
                   <note>n</note><building><name>B2</name><flat/></building></complex>";
        let offers = collect_offers(xml, "flat", true).unwrap();
        let complex = offers[1].lineage()[0];
        let names: Vec<_> = complex.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["name", "note", "building"]);
        assert_eq!(complex.children[2].children[0].trimmed_text(), "B2");
    }

    #[test]
    fn declared_encoding_is_honoured() {
        let path = format!("{}/tests/fixtures/cp1251_feed.xml", env!("CARGO_MANIFEST_DIR"));
        let mut reader = OfferReader::open(Path::new(&path), "offer", false).unwrap();
        let node = reader.next_offer().unwrap().unwrap();
        let offer = node.offer();
        assert_eq!(offer.attr("internal-id"), Some("2001"));
        assert_eq!(offer.attr("комплекс"), Some("Север"));
        assert_eq!(offer.children[0].trimmed_text(), "ЖК Парк");
        assert_eq!(offer.children[1].trimmed_text(), "В продаже");
        assert!(reader.next_offer().unwrap().is_none());
    }

    #[test]
    fn counts_offers() {
        let mut reader = OfferReader::from_str("<r><o/><o/><x/></r>", "o", false);
        while reader.next_offer().unwrap().is_some() {}
        assert_eq!(reader.offers_seen(), 2);
    }
}
