//! QView building: the join between pageviews and sitelinks.
//!
//! All inputs are sorted by wiki key, so the join is one linear merge
//! across N+1 files. Pageview rows whose key has no sitelink are orphans
//! (pages that no entity claims) and are dropped; everything else is
//! re-keyed by entity id, re-sorted, and summed.

use crate::combine::combine_counts;
use crate::group::{is_cancelled, run_group, CancelToken};
use crate::io::{open_zstd_reader, AtomicZstdFile};
use crate::merge::LineMerger;
use crate::sort::{sort_strings, SortConfig};
use anyhow::Result;
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Sender};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// The merge source index carrying sitelink rows; all later indexes are
/// monthly pageview files.
const SITELINKS_SOURCE: usize = 0;

pub fn build_qviews(
    date: NaiveDate,
    sitelinks: &Path,
    pageviews: &[PathBuf],
    out_dir: &Path,
) -> Result<PathBuf> {
    let out_path = out_dir.join(format!("qviews-{}.zst", date.format("%Y%m%d")));
    if out_path.exists() {
        return Ok(out_path); // use pre-existing artifact
    }

    info!(months = pageviews.len(), "building qviews");
    let start = Instant::now();

    let mut sources: Vec<Box<dyn BufRead + Send>> = Vec::with_capacity(pageviews.len() + 1);
    sources.push(Box::new(open_zstd_reader(sitelinks)?));
    for path in pageviews {
        sources.push(Box::new(open_zstd_reader(path)?));
    }
    let merger = LineMerger::new(sources, crate::sort::byte_compare)?;

    let (line_tx, line_rx) = bounded(10_000);
    let config = SortConfig {
        tmp_dir: Some(out_dir.to_path_buf()),
        ..SortConfig::default()
    };
    let (sorter, sorted_rx, err_rx) = sort_strings(line_rx, config);
    let mut out = AtomicZstdFile::create(&out_path)?;

    let joined = run_group(vec![
        Box::new(move |t: &CancelToken| join_lines(merger, &line_tx, t)),
        Box::new(|t: &CancelToken| {
            sorter.sort(t);
            Ok(())
        }),
        Box::new(|t: &CancelToken| combine_counts(&sorted_rx, &mut out, t)),
    ]);
    if let Ok(err) = err_rx.try_recv() {
        if !is_cancelled(&err) {
            return Err(err);
        }
    }
    joined?;
    out.commit()?;

    info!(elapsed_s = start.elapsed().as_secs_f32(), "built qviews");
    Ok(out_path)
}

fn join_lines<R: BufRead>(
    mut merger: LineMerger<R>,
    out: &Sender<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut cur_key = String::new();
    let mut entity: Option<String> = None;
    let mut counts: Vec<i64> = Vec::new();
    let mut duplicates = 0u64;
    let mut orphans = 0u64;
    let mut skipped = 0u64;

    while let Some((line, source)) = merger.next_line()? {
        let Some((key, payload)) = line.split_once(' ') else {
            skipped += 1;
            continue;
        };
        if key != cur_key {
            flush_key(&mut entity, &mut counts, &mut orphans, out, cancel)?;
            cur_key.clear();
            cur_key.push_str(key);
        }
        if source == SITELINKS_SOURCE {
            if entity.is_some() {
                // Two entities claim one page; rows arrive sorted, so the
                // lexicographically largest id wins deterministically.
                duplicates += 1;
            }
            entity = Some(payload.to_string());
        } else {
            match payload.parse::<i64>() {
                Ok(count) => counts.push(count),
                Err(_) => skipped += 1,
            }
        }
    }
    flush_key(&mut entity, &mut counts, &mut orphans, out, cancel)?;

    if duplicates > 0 {
        debug!(duplicates, "pages with more than one sitelinked entity");
    }
    debug!(orphans, skipped, "join finished");
    Ok(())
}

fn flush_key(
    entity: &mut Option<String>,
    counts: &mut Vec<i64>,
    orphans: &mut u64,
    out: &Sender<String>,
    cancel: &CancelToken,
) -> Result<()> {
    match entity.take() {
        Some(id) => {
            for count in counts.drain(..) {
                cancel.send(out, format!("{id} {count}"))?;
            }
        }
        None => {
            if !counts.is_empty() {
                *orphans += 1;
            }
            counts.clear();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Write};

    fn write_artifact(path: &Path, lines: &[&str]) {
        let mut out = AtomicZstdFile::create(path).unwrap();
        for line in lines {
            writeln!(out, "{line}").unwrap();
        }
        out.commit().unwrap();
    }

    fn read_artifact(path: &Path) -> Vec<String> {
        open_zstd_reader(path)
            .unwrap()
            .lines()
            .map(|l| l.unwrap())
            .collect()
    }

    #[test]
    fn joins_sums_and_drops_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let sitelinks = dir.path().join("sitelinks-20240101.zst");
        write_artifact(
            &sitelinks,
            &[
                "de.wikipedia/berlin Q64",
                "en.wikipedia/berlin Q64",
                "en.wikipedia/universe Q1",
            ],
        );
        let pv1 = dir.path().join("pageviews-202312.zst");
        write_artifact(
            &pv1,
            &[
                "de.wikipedia/berlin 10",
                "en.wikipedia/berlin 7",
                "en.wikipedia/orphan_page 99",
            ],
        );
        let pv2 = dir.path().join("pageviews-202311.zst");
        write_artifact(&pv2, &["en.wikipedia/berlin 5", "en.wikipedia/universe 2"]);

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let out = build_qviews(date, &sitelinks, &[pv1, pv2], dir.path()).unwrap();
        // Berlin collects views from both languages and both months; the
        // orphan page contributes nothing.
        assert_eq!(read_artifact(&out), vec!["Q1 2", "Q64 22"]);
    }

    #[test]
    fn duplicate_sitelink_last_id_wins() {
        let dir = tempfile::tempdir().unwrap();
        let sitelinks = dir.path().join("sitelinks-20240101.zst");
        write_artifact(
            &sitelinks,
            &["en.wikipedia/page Q5", "en.wikipedia/page Q7"],
        );
        let pv = dir.path().join("pageviews-202312.zst");
        write_artifact(&pv, &["en.wikipedia/page 3"]);

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let out = build_qviews(date, &sitelinks, &[pv], dir.path()).unwrap();
        assert_eq!(read_artifact(&out), vec!["Q7 3"]);
    }

    #[test]
    fn existing_artifact_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let existing = dir.path().join("qviews-20240101.zst");
        write_artifact(&existing, &["Q1 1"]);
        // Inputs deliberately missing: the stage must not touch them.
        let out = build_qviews(
            date,
            &dir.path().join("nope.zst"),
            &[dir.path().join("nope2.zst")],
            dir.path(),
        )
        .unwrap();
        assert_eq!(out, existing);
        assert_eq!(read_artifact(&out), vec!["Q1 1"]);
    }
}
