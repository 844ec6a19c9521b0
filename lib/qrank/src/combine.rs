//! Streaming count combiner.
//!
//! Consumes a channel of `"<key> <count>"` lines that is already totally
//! sorted by key and writes one line per distinct key with the counts
//! summed. Keys whose total is zero or negative are dropped. The input
//! ordering is an invariant owned by the external sorter upstream; seeing
//! it violated means an internal bug, not bad input.

use crate::group::{CancelToken, Cancelled};
use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use std::io::Write;

pub fn combine_counts<W: Write>(
    lines: &Receiver<String>,
    writer: &mut W,
    cancel: &CancelToken,
) -> Result<()> {
    let mut last_key = String::new();
    let mut last_count: i64 = 0;
    loop {
        crossbeam_channel::select! {
            recv(lines) -> msg => {
                let line = match msg {
                    Ok(line) => line,
                    // Channel closed: end of input.
                    Err(_) => return write_count(writer, &last_key, last_count),
                };
                let Some((key, count)) = split_count_line(&line) else {
                    continue;
                };
                let count: i64 = count
                    .parse()
                    .with_context(|| format!("bad count in line {line:?}"))?;
                if key == last_key {
                    last_count += count;
                } else {
                    if key < last_key.as_str() {
                        bail!("unsorted combiner input: {key:?} after {:?}", last_key);
                    }
                    write_count(writer, &last_key, last_count)?;
                    last_key.clear();
                    last_key.push_str(key);
                    last_count = count;
                }
            },
            recv(cancel.channel()) -> _ => return Err(anyhow::Error::new(Cancelled)),
        }
    }
}

// Exactly two space-separated fields, or the line is ignored.
fn split_count_line(line: &str) -> Option<(&str, &str)> {
    let (key, rest) = line.split_once(' ')?;
    if rest.is_empty() || rest.contains(' ') {
        return None;
    }
    Some((key, rest))
}

fn write_count<W: Write>(writer: &mut W, key: &str, count: i64) -> Result<()> {
    if count <= 0 {
        return Ok(());
    }
    writeln!(writer, "{key} {count}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::cancel_pair;
    use crossbeam_channel::bounded;

    fn combine(input: &[&str]) -> Result<String> {
        let (tx, rx) = bounded(input.len().max(1));
        for line in input {
            tx.send(line.to_string()).unwrap();
        }
        drop(tx);
        let (_handle, token) = cancel_pair();
        let mut out = Vec::new();
        combine_counts(&rx, &mut out, &token)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn sums_adjacent_runs() {
        let out = combine(&["a 1", "a 4", "b 2"]).unwrap();
        assert_eq!(out, "a 5\nb 2\n");
    }

    #[test]
    fn drops_nonpositive_totals() {
        let out = combine(&["a 3", "a -3", "b 1"]).unwrap();
        assert_eq!(out, "b 1\n");
    }

    #[test]
    fn skips_malformed_lines() {
        let out = combine(&["noise", "a 1 extra", "a 2"]).unwrap();
        assert_eq!(out, "a 2\n");
    }

    #[test]
    fn bad_count_is_fatal() {
        assert!(combine(&["a one"]).is_err());
    }

    #[test]
    fn unsorted_input_is_fatal() {
        assert!(combine(&["b 1", "a 1"]).is_err());
    }

    #[test]
    fn empty_input_writes_nothing() {
        assert_eq!(combine(&[]).unwrap(), "");
    }
}
