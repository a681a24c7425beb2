//! Path programs: the per-field navigation rules compiled into a small
//! instruction set and run by a single evaluator.
//!
//! Evaluation is total. Any miss (no matching tag, filter with no
//! survivors, climbing past the outermost element) yields an empty string.

use super::element::{Element, OfferNode};
use crate::sources::{FieldSpec, Traversal};

/// Field whose attribute, when configured, is read straight off the offer root.
pub const ID_FIELD: &str = "flat_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Collect direct children with this tag as candidates.
    Descend(String),
    /// Move to the parent of the current element.
    Ascend,
    /// Keep only candidates whose attribute equals the value.
    Filter { attr: String, value: String },
    /// Pick a candidate by index, clamped to the last one.
    Select(usize),
    /// Read an attribute of the current element.
    Attr(String),
    /// Read the trimmed text of the current element.
    Text,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program(Vec<Instruction>);

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Program(instructions)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.0
    }

    pub fn compile(field: &str, spec: &FieldSpec, traversal: Traversal) -> Self {
        match traversal {
            Traversal::Forward => compile_forward(field, spec),
            Traversal::Relative => compile_relative(spec),
        }
    }

    pub fn eval(&self, node: &OfferNode) -> String {
        Cursor::new(node.lineage()).run(&self.0).unwrap_or_default()
    }
}

fn compile_forward(field: &str, spec: &FieldSpec) -> Program {
    let attr_name = spec.attrs.name.clone();
    if field == ID_FIELD {
        if let Some(name) = attr_name {
            return Program(vec![Instruction::Attr(name)]);
        }
    }

    let mut ins = Vec::with_capacity(spec.tags.len() * 2 + 2);
    let mut filtered = false;
    for (i, tag) in spec.tags.iter().enumerate() {
        ins.push(Instruction::Descend(tag.clone()));
        let is_last = i + 1 == spec.tags.len();
        if is_last {
            if let (Some(attr), Some(value)) = (&spec.attrs.name, &spec.attrs.values) {
                ins.push(Instruction::Filter {
                    attr: attr.clone(),
                    value: value.clone(),
                });
                filtered = true;
            }
        }
        ins.push(Instruction::Select(spec.number));
    }

    // A filter consumes the attribute name; otherwise the name selects
    // attribute extraction.
    match attr_name {
        Some(name) if !filtered => ins.push(Instruction::Attr(name)),
        _ => ins.push(Instruction::Text),
    }
    Program(ins)
}

fn compile_relative(spec: &FieldSpec) -> Program {
    let mut ins = Vec::with_capacity(spec.tags.len() * 2 + 1);
    for tag in &spec.tags {
        if tag.starts_with("..") {
            for _ in 0..tag.matches("..").count() {
                ins.push(Instruction::Ascend);
            }
        } else {
            ins.push(Instruction::Descend(tag.clone()));
            ins.push(Instruction::Select(spec.number));
        }
    }
    ins.push(Instruction::Text);
    Program(ins)
}

struct Cursor<'a> {
    /// Outermost element first; the last entry is the current element.
    stack: Vec<&'a Element>,
    candidates: Option<Vec<&'a Element>>,
}

impl<'a> Cursor<'a> {
    fn new(stack: Vec<&'a Element>) -> Self {
        Cursor {
            stack,
            candidates: None,
        }
    }

    fn current(&self) -> Option<&'a Element> {
        self.stack.last().copied()
    }

    /// Pending candidates, or the current element alone.
    fn take_candidates(&mut self) -> Vec<&'a Element> {
        match self.candidates.take() {
            Some(c) => c,
            None => self.current().into_iter().collect(),
        }
    }

    /// Moves onto the first pending candidate when no `Select` did.
    fn settle(&mut self) {
        if let Some(first) = self.candidates.take().and_then(|c| c.first().copied()) {
            self.stack.push(first);
        }
    }

    fn run(mut self, program: &[Instruction]) -> Option<String> {
        for ins in program {
            match ins {
                Instruction::Descend(tag) => {
                    self.settle();
                    let found: Vec<&Element> = self.current()?.find_all(tag).collect();
                    if found.is_empty() {
                        return None;
                    }
                    self.candidates = Some(found);
                }
                Instruction::Ascend => {
                    self.settle();
                    if self.stack.len() < 2 {
                        return None;
                    }
                    self.stack.pop();
                }
                Instruction::Filter { attr, value } => {
                    let kept: Vec<&Element> = self
                        .take_candidates()
                        .into_iter()
                        .filter(|e| e.attr(attr) == Some(value.as_str()))
                        .collect();
                    if kept.is_empty() {
                        return None;
                    }
                    self.candidates = Some(kept);
                }
                Instruction::Select(index) => {
                    let candidates = self.take_candidates();
                    let chosen = *candidates.get(*index).or(candidates.last())?;
                    self.stack.push(chosen);
                }
                Instruction::Attr(name) => {
                    self.settle();
                    return Some(self.current()?.attr(name).unwrap_or("").to_string());
                }
                Instruction::Text => {
                    self.settle();
                    return Some(self.current()?.trimmed_text().to_string());
                }
            }
        }
        self.settle();
        Some(self.current()?.trimmed_text().to_string())
    }
}
