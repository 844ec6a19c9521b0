//! N-way merge of sorted line sources.
//!
//! Used twice: by the external sorter to merge its runs, and by the joiner
//! to walk the sitelinks file and the twelve monthly pageview files in one
//! linear pass. The heap holds one line per source, so memory stays flat no
//! matter how large the inputs are.

use crate::sort::Compare;
use anyhow::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::BufRead;

struct HeapEntry {
    line: String,
    source: usize,
    compare: Compare,
}

// Reversed so the BinaryHeap (a max-heap) surfaces the smallest line first.
// Equal lines tie-break on the source index to keep the merge deterministic.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(&other.line, &self.line).then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

pub struct LineMerger<R: BufRead> {
    sources: Vec<R>,
    heap: BinaryHeap<HeapEntry>,
    compare: Compare,
}

impl<R: BufRead> LineMerger<R> {
    pub fn new(mut sources: Vec<R>, compare: Compare) -> Result<LineMerger<R>> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, reader) in sources.iter_mut().enumerate() {
            if let Some(line) = read_line(reader)? {
                heap.push(HeapEntry {
                    line,
                    source,
                    compare,
                });
            }
        }
        Ok(LineMerger {
            sources,
            heap,
            compare,
        })
    }

    /// The next line in global order, along with the index of the source it
    /// came from. `None` once every source is exhausted.
    pub fn next_line(&mut self) -> Result<Option<(String, usize)>> {
        let Some(entry) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(line) = read_line(&mut self.sources[entry.source])? {
            self.heap.push(HeapEntry {
                line,
                source: entry.source,
                compare: self.compare,
            });
        }
        Ok(Some((entry.line, entry.source)))
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::byte_compare;
    use std::io::Cursor;

    fn merge_all(inputs: &[&str]) -> Vec<(String, usize)> {
        let sources: Vec<Cursor<Vec<u8>>> = inputs
            .iter()
            .map(|s| Cursor::new(s.as_bytes().to_vec()))
            .collect();
        let mut merger = LineMerger::new(sources, byte_compare).unwrap();
        let mut out = Vec::new();
        while let Some(item) = merger.next_line().unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn merges_in_global_order() {
        let merged = merge_all(&["a 1\nc 3\n", "b 2\nd 4\n", ""]);
        let lines: Vec<&str> = merged.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(lines, vec!["a 1", "b 2", "c 3", "d 4"]);
    }

    #[test]
    fn reports_source_of_each_line() {
        let merged = merge_all(&["x Q1\n", "x 7\n"]);
        // "x 7" < "x Q1" bytewise, so the pageview-style line comes first.
        assert_eq!(merged[0], ("x 7".to_string(), 1));
        assert_eq!(merged[1], ("x Q1".to_string(), 0));
    }

    #[test]
    fn equal_lines_keep_source_order() {
        let merged = merge_all(&["same\n", "same\n"]);
        assert_eq!(merged[0].1, 0);
        assert_eq!(merged[1].1, 1);
    }

    #[test]
    fn handles_missing_trailing_newline() {
        let merged = merge_all(&["a\nb", "aa\n"]);
        let lines: Vec<&str> = merged.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(lines, vec!["a", "aa", "b"]);
    }
}
