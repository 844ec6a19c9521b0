//! Line-oriented external sort.
//!
//! The only memory-bounded primitive in the pipeline: every stage that needs
//! a total order funnels its rows through here. Input arrives on a channel,
//! gets cut into ~8 MiB chunks that a worker pool sorts and spills to disk,
//! and the runs are then k-way merged back into a stream. Stages never hold
//! the full key space in memory.

use crate::group::CancelToken;
use crate::merge::LineMerger;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use tempfile::TempDir;
use tracing::debug;

/// Line comparator. A plain function pointer so run sorting and heap
/// merging share one ordering without generics bubbling up the call stack.
pub type Compare = fn(&str, &str) -> Ordering;

pub fn byte_compare(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}

#[derive(Clone)]
pub struct SortConfig {
    /// Bytes of buffered input per sorted run on disk.
    pub chunk_bytes: usize,
    /// Parallel run writers.
    pub num_workers: usize,
    /// Maximum runs merged in one pass; more trigger intermediate passes,
    /// which also keeps the open-file count bounded.
    pub max_fan_in: usize,
    /// Directory for run files; the process temp dir when unset.
    pub tmp_dir: Option<PathBuf>,
    pub compare: Compare,
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            chunk_bytes: 8 << 20,
            num_workers: num_cpus::get(),
            max_fan_in: 128,
            tmp_dir: None,
            compare: byte_compare,
        }
    }
}

pub struct ExternalSorter {
    input: Receiver<String>,
    output: Sender<String>,
    errors: Sender<anyhow::Error>,
    config: SortConfig,
}

/// Wires up a sorter: the caller keeps the output and error receivers,
/// hands the sorter itself to a task, and must drain the error channel
/// once the output stream ends.
pub fn sort_strings(
    input: Receiver<String>,
    config: SortConfig,
) -> (ExternalSorter, Receiver<String>, Receiver<anyhow::Error>) {
    let (out_tx, out_rx) = bounded(10_000);
    let (err_tx, err_rx) = bounded(1);
    let sorter = ExternalSorter {
        input,
        output: out_tx,
        errors: err_tx,
        config,
    };
    (sorter, out_rx, err_rx)
}

impl ExternalSorter {
    /// Drives the sort to completion. Failures are parked on the error
    /// channel rather than returned, so the task that runs the sorter and
    /// the task that consumes its output stay independent.
    pub fn sort(self, cancel: &CancelToken) {
        let errors = self.errors.clone();
        if let Err(err) = self.run(cancel) {
            let _ = errors.try_send(err);
        }
    }

    fn run(self, cancel: &CancelToken) -> Result<()> {
        let tmp = match &self.config.tmp_dir {
            Some(dir) => TempDir::with_prefix_in("extsort-", dir)?,
            None => TempDir::with_prefix("extsort-")?,
        };

        let mut runs = self.write_runs(&tmp, cancel)?;
        debug!(runs = runs.len(), "run generation done");

        // Collapse to a mergeable fan-in before the final streaming pass.
        let fan_in = self.config.max_fan_in.max(2);
        let mut pass = 0usize;
        while runs.len() > fan_in {
            let group: Vec<PathBuf> = runs.drain(..fan_in).collect();
            let merged = tmp.path().join(format!("pass-{pass}"));
            merge_to_file(&group, &merged, self.config.compare)?;
            for path in &group {
                let _ = fs::remove_file(path);
            }
            runs.push(merged);
            pass += 1;
        }

        // Final merge streams straight into the output channel.
        let mut sources = Vec::with_capacity(runs.len());
        for path in &runs {
            sources.push(crate::io::open_reader(path)?);
        }
        let mut merger = LineMerger::new(sources, self.config.compare)?;
        while let Some((line, _)) = merger.next_line()? {
            cancel.send(&self.output, line)?;
        }
        Ok(())
    }

    fn write_runs(&self, tmp: &TempDir, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
        let workers = self.config.num_workers.max(1);
        let (chunk_tx, chunk_rx) = bounded::<Vec<String>>(workers);
        let (run_tx, run_rx) = unbounded::<PathBuf>();
        let failure: Mutex<Option<anyhow::Error>> = Mutex::new(None);

        thread::scope(|s| -> Result<()> {
            for worker in 0..workers {
                let chunk_rx = chunk_rx.clone();
                let run_tx = run_tx.clone();
                let failure = &failure;
                let dir = tmp.path().to_path_buf();
                let compare = self.config.compare;
                s.spawn(move || {
                    for (seq, mut chunk) in chunk_rx.iter().enumerate() {
                        if failure.lock().unwrap().is_some() {
                            // Keep draining so the feeder never blocks on a
                            // channel nobody reads.
                            continue;
                        }
                        chunk.sort_unstable_by(|a, b| compare(a, b));
                        match write_run(&dir.join(format!("run-{worker}-{seq}")), &chunk) {
                            Ok(path) => {
                                let _ = run_tx.send(path);
                            }
                            Err(err) => {
                                let mut slot = failure.lock().unwrap();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                            }
                        }
                    }
                });
            }
            drop(chunk_rx);
            drop(run_tx);

            let mut buffered = 0usize;
            let mut chunk: Vec<String> = Vec::new();
            for line in self.input.iter() {
                buffered += line.len() + 1;
                chunk.push(line);
                if buffered >= self.config.chunk_bytes {
                    cancel.send(&chunk_tx, mem::take(&mut chunk))?;
                    buffered = 0;
                }
            }
            if !chunk.is_empty() {
                cancel.send(&chunk_tx, chunk)?;
            }
            Ok(())
        })?;

        if let Some(err) = failure.into_inner().unwrap() {
            return Err(err);
        }
        Ok(run_rx.try_iter().collect())
    }
}

fn write_run(path: &Path, lines: &[String]) -> Result<PathBuf> {
    let file = File::create(path).with_context(|| format!("create run {}", path.display()))?;
    let mut writer = BufWriter::with_capacity(1 << 20, file);
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(path.to_path_buf())
}

fn merge_to_file(runs: &[PathBuf], dest: &Path, compare: Compare) -> Result<()> {
    let mut sources = Vec::with_capacity(runs.len());
    for path in runs {
        sources.push(crate::io::open_reader(path)?);
    }
    let mut merger = LineMerger::new(sources, compare)?;
    let file = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut writer = BufWriter::with_capacity(1 << 20, file);
    while let Some((line, _)) = merger.next_line()? {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::run_group;

    fn external_sort(lines: Vec<String>, config: SortConfig) -> Vec<String> {
        let (tx, rx) = bounded(64);
        let (sorter, out_rx, err_rx) = sort_strings(rx, config);
        let collected = Mutex::new(Vec::new());
        run_group(vec![
            Box::new(move |t| {
                for line in lines {
                    t.send(&tx, line)?;
                }
                Ok(())
            }),
            Box::new(|t| {
                sorter.sort(t);
                Ok(())
            }),
            Box::new(|_t| {
                for line in out_rx.iter() {
                    collected.lock().unwrap().push(line);
                }
                Ok(())
            }),
        ])
        .unwrap();
        assert!(err_rx.try_recv().is_err(), "sorter reported an error");
        collected.into_inner().unwrap()
    }

    #[test]
    fn sorts_input_spanning_many_runs() {
        // Tiny chunks plus a small fan-in force several spill files and an
        // intermediate merge pass.
        let config = SortConfig {
            chunk_bytes: 64,
            num_workers: 2,
            max_fan_in: 4,
            ..SortConfig::default()
        };
        let lines: Vec<String> = (0..500).map(|i| format!("key{:03}", (i * 37) % 500)).collect();
        let sorted = external_sort(lines, config);
        assert_eq!(sorted.len(), 500);
        for window in sorted.windows(2) {
            assert!(window[0] <= window[1], "{} > {}", window[0], window[1]);
        }
        assert_eq!(sorted.first().unwrap(), "key000");
        assert_eq!(sorted.last().unwrap(), "key499");
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let sorted = external_sort(Vec::new(), SortConfig::default());
        assert!(sorted.is_empty());
    }

    #[test]
    fn honors_custom_comparator() {
        fn reverse(a: &str, b: &str) -> Ordering {
            b.cmp(a)
        }
        let config = SortConfig {
            chunk_bytes: 32,
            num_workers: 2,
            compare: reverse,
            ..SortConfig::default()
        };
        let sorted = external_sort(vec!["a".into(), "c".into(), "b".into()], config);
        assert_eq!(sorted, vec!["c", "b", "a"]);
    }

    #[test]
    fn duplicate_lines_survive() {
        let config = SortConfig {
            chunk_bytes: 16,
            num_workers: 2,
            ..SortConfig::default()
        };
        let sorted = external_sort(
            vec!["x 1".into(), "x 1".into(), "a 2".into()],
            config,
        );
        assert_eq!(sorted, vec!["a 2", "x 1", "x 1"]);
    }
}
