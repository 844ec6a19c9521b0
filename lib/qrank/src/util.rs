use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Finds the most recent Wikimedia dump file matching `re` under a
/// `YYYY/YYYY-MM/` directory tree, scanning newest-first.
pub fn latest_dump(dir: &Path, re: &Regex) -> Result<PathBuf> {
    let re_year = Regex::new(r"^\d{4}$").unwrap();
    let re_month = Regex::new(r"^\d{4}-\d{2}$").unwrap();

    let mut years = list_matching(dir, &re_year)?;
    years.sort_unstable_by(|a, b| b.cmp(a));
    for year in &years {
        let year_dir = dir.join(year);
        let mut months = list_matching(&year_dir, &re_month)?;
        months.sort_unstable_by(|a, b| b.cmp(a));
        for month in &months {
            let month_dir = year_dir.join(month);
            let mut files = list_matching(&month_dir, re)?;
            files.sort_unstable_by(|a, b| b.cmp(a));
            if let Some(newest) = files.first() {
                return Ok(month_dir.join(newest));
            }
        }
    }
    Err(not_found(format!("no dump matching {re} under {}", dir.display())))
}

/// Locates the newest entity dump, `wikidatawiki/entities/<YYYYMMDD>/
/// wikidata-<YYYYMMDD>-all.json.bz2`, and the date that stamps the run.
pub fn find_entities_dump(dumps: &Path) -> Result<(NaiveDate, PathBuf)> {
    let dir = dumps.join("wikidatawiki").join("entities");
    let re_day = Regex::new(r"^\d{8}$").unwrap();
    let re_file = Regex::new(r"^wikidata-\d{8}-all\.json\.bz2$").unwrap();

    let mut days = list_matching(&dir, &re_day)?;
    days.sort_unstable_by(|a, b| b.cmp(a));
    for day in &days {
        let day_dir = dir.join(day);
        let mut files = list_matching(&day_dir, &re_file)?;
        files.sort_unstable_by(|a, b| b.cmp(a));
        if let Some(newest) = files.first() {
            let date = NaiveDate::parse_from_str(day, "%Y%m%d")
                .with_context(|| format!("bad dump date {day}"))?;
            return Ok((date, day_dir.join(newest)));
        }
    }
    Err(not_found(format!("no entities dump under {}", dir.display())))
}

fn list_matching(dir: &Path, re: &Regex) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(anyhow::Error::from)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if re.is_match(name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

fn not_found(msg: String) -> anyhow::Error {
    anyhow::Error::new(std::io::Error::new(ErrorKind::NotFound, msg))
}

/// True if any link in the error chain is a file-not-found, letting callers
/// tell "nothing to process" apart from real I/O failures.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map_or(false, |io| io.kind() == ErrorKind::NotFound)
    })
}

/// The `(year, month)` that lies `back` calendar months before `date`.
pub fn months_back(date: NaiveDate, back: u32) -> (i32, u32) {
    let total = date.year() * 12 + date.month0() as i32 - back as i32;
    (total.div_euclid(12), total.rem_euclid(12) as u32 + 1)
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    (next - first).num_days() as u32
}

/// Year and week of an ISO week string like "2018-W34".
pub fn parse_iso_week(s: &str) -> Result<(i32, i32)> {
    let re = Regex::new(r"(\d{4})-W(\d{2})").unwrap();
    let caps = re
        .captures(s)
        .with_context(|| format!("week not in ISO 8601 format: {s}"))?;
    let year = caps[1].parse().unwrap();
    let week = caps[2].parse().unwrap();
    Ok((year, week))
}

/// First Monday of the given ISO week. Out-of-range week numbers are
/// accepted and simply offset in whole weeks, so week 0 is the week before
/// week 1 and week 54 runs past the year's end.
pub fn iso_week_start(year: i32, week: i32) -> NaiveDate {
    // The first Monday on or before July 1 is always in the middle of the
    // ISO year, so its week number anchors the arithmetic.
    let july1 = NaiveDate::from_ymd_opt(year, 7, 1).unwrap();
    let monday = july1 - Duration::days(july1.weekday().num_days_from_monday() as i64);
    debug_assert_eq!(monday.weekday(), Weekday::Mon);
    let anchor_week = monday.iso_week().week() as i32;
    monday + Duration::weeks((week - anchor_week) as i64)
}
