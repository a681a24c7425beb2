/// Owned XML element as kept for one offer. Names are namespace-free.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    /// Text before the first child element.
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Direct children named `tag`, in document order.
    pub fn find_all<'a, 'b>(&'a self, tag: &'b str) -> impl Iterator<Item = &'a Element> + 'b
    where
        'a: 'b,
    {
        self.children.iter().filter(move |c| c.name == tag)
    }

    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }
}

/// One repeating listing subtree together with whatever ancestor context
/// was captured for it.
///
/// `root` is the outermost captured element; the offer itself sits `depth`
/// levels below it, always along the last child at each level (the branch
/// that was still open when the offer closed). With no captured context
/// `depth` is zero and `root` is the offer.
///
/// Ancestors hold only what the parser had read when the offer closed:
/// their children ahead of the offer's branch, minus finished subtrees that
/// contained earlier offers. Anything that follows in the document, such as
/// a building `<name>` placed after its `<flats>`, is not reachable.
#[derive(Debug, Clone)]
pub struct OfferNode {
    root: Element,
    depth: usize,
}

impl OfferNode {
    pub fn detached(offer: Element) -> Self {
        OfferNode {
            root: offer,
            depth: 0,
        }
    }

    pub fn with_context(root: Element, depth: usize) -> Self {
        OfferNode { root, depth }
    }

    /// Path from the outermost captured ancestor down to the offer.
    pub fn lineage(&self) -> Vec<&Element> {
        let mut path = Vec::with_capacity(self.depth + 1);
        let mut current = &self.root;
        path.push(current);
        for _ in 0..self.depth {
            match current.children.last() {
                Some(child) => {
                    current = child;
                    path.push(current);
                }
                None => break,
            }
        }
        path
    }

    pub fn offer(&self) -> &Element {
        self.lineage().last().copied().unwrap_or(&self.root)
    }
}
