//! Monthly pageview aggregation.
//!
//! For each of the twelve months before the dump date, the ~30 daily
//! bzip2-compressed logs are parsed in parallel, pre-aggregated while still
//! grouped, normalized into wiki keys, externally sorted, and combined into
//! one `pageviews-YYYYMM.zst` artifact. Months whose artifact already
//! exists are skipped, which is what makes reruns cheap.

use crate::combine::combine_counts;
use crate::group::{is_cancelled, run_group, CancelToken};
use crate::io::AtomicZstdFile;
use crate::keys::format_line;
use crate::sort::{sort_strings, SortConfig};
use crate::util::{days_in_month, months_back};
use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Sender};
use percent_encoding::percent_decode;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

pub fn process_pageviews(
    test_run: bool,
    dumps: &Path,
    date: NaiveDate,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(12);
    for back in 1..=12 {
        let (year, month) = months_back(date, back);
        paths.push(build_monthly_pageviews(test_run, dumps, year, month, out_dir)?);
        if test_run {
            break;
        }
    }
    Ok(paths)
}

fn build_monthly_pageviews(
    test_run: bool,
    dumps: &Path,
    year: i32,
    month: u32,
    out_dir: &Path,
) -> Result<PathBuf> {
    let out_path = out_dir.join(format!("pageviews-{year:04}{month:02}.zst"));
    if out_path.exists() {
        return Ok(out_path); // use pre-existing artifact
    }

    info!(year, month, "building monthly pageviews");
    let start = Instant::now();

    let (line_tx, line_rx) = bounded(10_000);
    let config = SortConfig {
        tmp_dir: Some(out_dir.to_path_buf()),
        ..SortConfig::default()
    };
    let (sorter, sorted_rx, err_rx) = sort_strings(line_rx, config);
    let mut out = AtomicZstdFile::create(&out_path)?;

    let joined = run_group(vec![
        Box::new(move |t: &CancelToken| {
            // line_tx is owned here; returning drops it and ends the sort input
            read_monthly_pageviews(test_run, dumps, year, month, &line_tx, t)
        }),
        Box::new(|t: &CancelToken| {
            sorter.sort(t);
            Ok(())
        }),
        Box::new(|t: &CancelToken| combine_counts(&sorted_rx, &mut out, t)),
    ]);
    // A root sorter failure surfaces here; a cancelled sorter only died
    // because some other task failed first, so the group error wins then.
    if let Ok(err) = err_rx.try_recv() {
        if !is_cancelled(&err) {
            return Err(err);
        }
    }
    joined?;
    out.commit()?;

    info!(
        year,
        month,
        elapsed_s = start.elapsed().as_secs_f32(),
        "built monthly pageviews"
    );
    Ok(out_path)
}

fn read_monthly_pageviews(
    test_run: bool,
    dumps: &Path,
    year: i32,
    month: u32,
    lines: &Sender<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let days: Vec<u32> = (1..=days_in_month(year, month)).collect();
    days.into_par_iter().try_for_each(|day| {
        let path = dumps
            .join("other")
            .join("pageview_complete")
            .join(format!("{year:04}"))
            .join(format!("{year:04}-{month:02}"))
            .join(format!("pageviews-{year:04}{month:02}{day:02}-user.bz2"));
        read_pageviews_file(test_run, &path, lines, cancel)
    })
}

fn read_pageviews_file(
    test_run: bool,
    path: &Path,
    lines: &Sender<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(MultiBzDecoder::new(file));
    read_pageviews(test_run, reader, lines, cancel)
}

/// Parses one daily log. Columns: site, title, viewcount, access-method,
/// totalcount, hourly-breakdown. Rows for the same page are adjacent, so
/// summing before emission happens in a single streaming pass.
fn read_pageviews<R: BufRead>(
    test_run: bool,
    mut reader: R,
    lines: &Sender<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut last_site = String::new();
    let mut last_title = String::new();
    let mut last_count: i64 = 0;
    let mut skipped = 0u64;
    let mut buf = Vec::new();
    let mut n = 0u64;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        n += 1;
        if test_run && n >= 500 {
            break;
        }

        let cols: Vec<&[u8]> = buf
            .split(|b| b.is_ascii_whitespace())
            .filter(|c| !c.is_empty())
            .collect();
        if cols.len() != 6 {
            continue;
        }

        let Ok(site) = std::str::from_utf8(cols[0]) else {
            skipped += 1;
            continue;
        };

        // https://wg-en.wikipedia.org/ closed in 2008
        if site == "en-wg.wikipedia" {
            continue;
        }

        let Some(title) = unescape_title(cols[1]) else {
            skipped += 1;
            continue;
        };

        let count: i64 = match std::str::from_utf8(cols[4]).ok().and_then(|s| s.parse().ok()) {
            Some(c) => c,
            None => {
                skipped += 1;
                continue;
            }
        };

        if site == last_site && title == last_title {
            last_count += count;
        } else {
            emit_pageviews(&last_site, &last_title, last_count, lines, cancel)?;
            last_site.clear();
            last_site.push_str(site);
            last_title = title;
            last_count = count;
        }
    }
    emit_pageviews(&last_site, &last_title, last_count, lines, cancel)?;
    if skipped > 0 {
        debug!(skipped, "skipped unparseable pageview rows");
    }
    Ok(())
}

fn emit_pageviews(
    site: &str,
    title: &str,
    count: i64,
    lines: &Sender<String>,
    cancel: &CancelToken,
) -> Result<()> {
    if count <= 0 {
        return Ok(());
    }
    // Sites without a language prefix carry no wiki key.
    let Some(dot) = site.find('.') else {
        return Ok(());
    };
    let line = format_line(&site[..dot], &site[dot + 1..], title, &count.to_string());
    cancel.send(lines, line)
}

/// Some, but not all, titles are query-escaped. Decode what decodes and
/// keep the rest as-is; only rows that fail UTF-8 validation are dropped.
fn unescape_title(raw: &[u8]) -> Option<String> {
    let plussed: Vec<u8> = raw
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();
    let decoded: Vec<u8> = percent_decode(&plussed).collect();
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::cancel_pair;
    use std::io::Cursor;

    fn run_reader(input: &str) -> Vec<String> {
        let (tx, rx) = bounded(100);
        let (_handle, token) = cancel_pair();
        read_pageviews(false, Cursor::new(input.as_bytes().to_vec()), &tx, &token).unwrap();
        drop(tx);
        rx.iter().collect()
    }

    #[test]
    fn empty_input() {
        assert!(run_reader("").is_empty());
    }

    #[test]
    fn wrong_column_count() {
        assert!(run_reader("only three columns").is_empty());
    }

    #[test]
    fn groups_and_normalizes() {
        let got = run_reader(
            "als.wikipedia Ägypten 4623 mobile-web 2 N1P1\n\
             als.wikipedia Ägypten 8911 desktop 3 A2X1\n\
             ang.wikipedia Lech_Wałęsa 10374 desktop 1 Q1",
        );
        assert_eq!(
            got,
            vec!["gsw.wikipedia/ägypten 5", "ang.wikipedia/lech_wałęsa 1"]
        );
    }

    #[test]
    fn drops_siteless_and_obsolete_rows() {
        let got = run_reader(
            "commons.wikimedia Foo 1 desktop 2 A1\n\
             nosuchsite Foo 1 desktop 2 A1\n\
             en-wg.wikipedia Foo 1 desktop 2 A1",
        );
        assert_eq!(got, vec!["und.commons/foo 2"]);
    }

    #[test]
    fn percent_escapes_decode_best_effort() {
        let got = run_reader("en.wikipedia Caf%C3%A9 1 desktop 3 A1\nen.wikipedia 100%_tru 1 desktop 2 A1");
        assert_eq!(got, vec!["en.wikipedia/café 3", "en.wikipedia/100%_tru 2"]);
    }

    #[test]
    fn invalid_utf8_title_is_skipped() {
        let mut input = b"en.wikipedia Bad%FF%FE 1 desktop 3 A1\n".to_vec();
        input.extend_from_slice(b"en.wikipedia Ok 1 desktop 2 A1\n");
        let (tx, rx) = bounded(10);
        let (_handle, token) = cancel_pair();
        read_pageviews(false, Cursor::new(input), &tx, &token).unwrap();
        drop(tx);
        let got: Vec<String> = rx.iter().collect();
        assert_eq!(got, vec!["en.wikipedia/ok 2"]);
    }
}
