//! The stats descriptor published next to the ranking file.
//!
//! The serving layer uses the hash for conditional requests, so it is
//! computed over the bytes of the published csv.gz exactly as downloaded.

use crate::io::AtomicFile;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub sha256: String,
    pub lines: u64,
    pub epoch: String,
}

pub fn build_stats(date: NaiveDate, qrank_csv: &Path, out_dir: &Path) -> Result<PathBuf> {
    let out_path = out_dir.join(format!("stats-{}.json", date.format("%Y%m%d")));
    if out_path.exists() {
        return Ok(out_path); // use pre-existing artifact
    }

    let stats = Stats {
        sha256: file_sha256(qrank_csv)?,
        lines: count_data_rows(qrank_csv)?,
        epoch: date.format("%Y-%m-%d").to_string(),
    };

    let mut out = AtomicFile::create(&out_path)?;
    serde_json::to_writer(&mut out, &stats)?;
    out.write_all(b"\n")?;
    out.commit()?;

    info!(lines = stats.lines, sha256 = %stats.sha256, "wrote stats");
    Ok(out_path)
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        write!(hex, "{byte:02x}").unwrap();
    }
    Ok(hex)
}

/// Data rows in the published CSV, excluding the header line.
fn count_data_rows(path: &Path) -> Result<u64> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(GzDecoder::new(file));
    let mut rows = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        if !line.trim_end().is_empty() {
            rows += 1;
        }
    }
    Ok(rows.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_csv_gz(path: &Path, body: &str) {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(body.as_bytes()).unwrap();
        std::fs::write(path, enc.finish().unwrap()).unwrap();
    }

    #[test]
    fn descriptor_fields() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("qrank-20240101.csv.gz");
        write_csv_gz(&csv, "Entity,QRank\nQ99,1000\nQ1,2\n");

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let out = build_stats(date, &csv, dir.path()).unwrap();
        assert!(out.ends_with("stats-20240101.json"));

        let stats: Stats =
            serde_json::from_reader(File::open(&out).unwrap()).unwrap();
        assert_eq!(stats.lines, 2);
        assert_eq!(stats.epoch, "2024-01-01");
        assert_eq!(stats.sha256.len(), 64);
        assert!(stats.sha256.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(stats.sha256, file_sha256(&csv).unwrap());
    }

    #[test]
    fn identical_input_gives_identical_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("qrank-20240101.csv.gz");
        write_csv_gz(&csv, "Entity,QRank\nQ1,1\n");

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let first = std::fs::read(build_stats(date, &csv, dir.path()).unwrap()).unwrap();
        std::fs::remove_file(dir.path().join("stats-20240101.json")).unwrap();
        let second = std::fs::read(build_stats(date, &csv, dir.path()).unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
