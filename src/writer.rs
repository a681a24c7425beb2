use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::feed::extract::Record;

/// Line-delimited JSON sink, one listing per line.
pub struct RecordWriter<W: Write> {
    out: W,
    written: usize,
}

impl RecordWriter<BufWriter<File>> {
    /// Truncates any artifact left by a previous run of the same source.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W) -> Self {
        RecordWriter { out, written: 0 }
    }

    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_object_per_line_utf8_kept() {
        let mut w = RecordWriter::new(Vec::new());
        let mut rec = Record::new();
        rec.insert("flat_id".into(), "1".into());
        rec.insert("complex".into(), "ЖК Север".into());
        w.write(&rec).unwrap();
        rec.insert("flat_id".into(), "2".into());
        w.write(&rec).unwrap();
        assert_eq!(w.written(), 2);

        let out = String::from_utf8(w.finish().unwrap()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ЖК Север"));
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["flat_id"], "2");
    }
}
