//! Ranking: re-sorts the qviews file by decreasing view count.

use crate::group::{is_cancelled, run_group, CancelToken, Cancelled};
use crate::io::{open_zstd_reader, AtomicFile, AtomicZstdFile};
use crate::sort::{sort_strings, SortConfig};
use anyhow::Result;
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Receiver};
use flate2::write::GzEncoder;
use std::cmp::Ordering;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// Rank order over `"<entityId> <count>"` lines: more views sort first,
/// ties break on the lexicographically smaller entity id.
pub fn qrank_less(a: &str, b: &str) -> Ordering {
    count_of(b)
        .cmp(&count_of(a))
        .then_with(|| key_of(a).cmp(key_of(b)))
}

fn count_of(line: &str) -> i64 {
    line.split_once(' ')
        .and_then(|(_, count)| count.parse().ok())
        .unwrap_or(0)
}

fn key_of(line: &str) -> &str {
    line.split_once(' ').map_or(line, |(key, _)| key)
}

/// Produces the internal `qrank-YYYYMMDD.zst` and the published
/// `qrank-YYYYMMDD.csv.gz` next to it.
pub fn build_qrank(
    date: NaiveDate,
    qviews: &Path,
    out_dir: &Path,
) -> Result<(PathBuf, PathBuf)> {
    let stamp = date.format("%Y%m%d");
    let out_path = out_dir.join(format!("qrank-{stamp}.zst"));
    let csv_path = out_dir.join(format!("qrank-{stamp}.csv.gz"));
    if out_path.exists() && csv_path.exists() {
        return Ok((out_path, csv_path)); // use pre-existing artifacts
    }

    info!("ranking qviews");
    let start = Instant::now();

    let (line_tx, line_rx) = bounded(10_000);
    let config = SortConfig {
        tmp_dir: Some(out_dir.to_path_buf()),
        compare: qrank_less,
        ..SortConfig::default()
    };
    let (sorter, sorted_rx, err_rx) = sort_strings(line_rx, config);

    let mut out = AtomicZstdFile::create(&out_path)?;
    let mut csv = GzEncoder::new(AtomicFile::create(&csv_path)?, flate2::Compression::default());
    writeln!(csv, "Entity,QRank")?;

    let joined = run_group(vec![
        Box::new(move |t: &CancelToken| {
            let mut reader = open_zstd_reader(qviews)?;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 {
                    return Ok(());
                }
                if line.ends_with('\n') {
                    line.pop();
                }
                t.send(&line_tx, line)?;
            }
        }),
        Box::new(|t: &CancelToken| {
            sorter.sort(t);
            Ok(())
        }),
        Box::new(|t: &CancelToken| write_ranked(&sorted_rx, &mut out, &mut csv, t)),
    ]);
    if let Ok(err) = err_rx.try_recv() {
        if !is_cancelled(&err) {
            return Err(err);
        }
    }
    joined?;
    out.commit()?;
    csv.finish()?.commit()?;

    info!(elapsed_s = start.elapsed().as_secs_f32(), "built qrank");
    Ok((out_path, csv_path))
}

fn write_ranked<W1: Write, W2: Write>(
    sorted: &Receiver<String>,
    out: &mut W1,
    csv: &mut W2,
    cancel: &CancelToken,
) -> Result<()> {
    loop {
        crossbeam_channel::select! {
            recv(sorted) -> msg => {
                let line = match msg {
                    Ok(line) => line,
                    Err(_) => return Ok(()),
                };
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
                if let Some((id, count)) = line.split_once(' ') {
                    writeln!(csv, "{id},{count}")?;
                }
            },
            recv(cancel.channel()) -> _ => return Err(anyhow::Error::new(Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::{BufReader, Read};

    #[test]
    fn rank_order() {
        assert_eq!(qrank_less("Q1 10", "Q2 3"), Ordering::Less);
        assert_eq!(qrank_less("Q2 3", "Q1 10"), Ordering::Greater);
        assert_eq!(qrank_less("Q1 5", "Q2 5"), Ordering::Less);
        assert_eq!(qrank_less("Q2 5", "Q1 5"), Ordering::Greater);
        assert_eq!(qrank_less("Q1 5", "Q1 5"), Ordering::Equal);
    }

    #[test]
    fn ranks_and_publishes_csv() {
        let dir = tempfile::tempdir().unwrap();
        let qviews = dir.path().join("qviews-20240101.zst");
        let mut src = AtomicZstdFile::create(&qviews).unwrap();
        write!(src, "Q1 2\nQ55808 7\nQ64 7\nQ99 1000\n").unwrap();
        src.commit().unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let (zst, csv) = build_qrank(date, &qviews, dir.path()).unwrap();

        let ranked: Vec<String> = open_zstd_reader(&zst)
            .unwrap()
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(ranked, vec!["Q99 1000", "Q55808 7", "Q64 7", "Q1 2"]);

        let mut csv_text = String::new();
        BufReader::new(GzDecoder::new(std::fs::File::open(&csv).unwrap()))
            .read_to_string(&mut csv_text)
            .unwrap();
        assert_eq!(
            csv_text,
            "Entity,QRank\nQ99,1000\nQ55808,7\nQ64,7\nQ1,2\n"
        );
    }

    #[test]
    fn sum_is_preserved_between_qviews_and_qrank() {
        let dir = tempfile::tempdir().unwrap();
        let qviews = dir.path().join("qviews-20240202.zst");
        let rows = ["Q1 5", "Q2 17", "Q3 1", "Q4 400"];
        let mut src = AtomicZstdFile::create(&qviews).unwrap();
        for row in rows {
            writeln!(src, "{row}").unwrap();
        }
        src.commit().unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        let (zst, _csv) = build_qrank(date, &qviews, dir.path()).unwrap();
        let total: i64 = open_zstd_reader(&zst)
            .unwrap()
            .lines()
            .map(|l| count_of(&l.unwrap()))
            .sum();
        assert_eq!(total, 5 + 17 + 1 + 400);
    }
}
