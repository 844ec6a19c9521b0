//! Stage chaining for one build.
//!
//! Each stage writes a compressed, sorted artifact named after the dump
//! epoch and skips itself when that artifact already exists, so a crashed
//! or cancelled build resumes from the last finished stage.

use crate::io::ensure_dir;
use crate::storage::ObjectStorage;
use crate::{entities, pageviews, qrank, qviews, stats, storage, util};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

pub struct BuildConfig {
    pub dumps: PathBuf,
    /// Process only a small sample of the data, into a separate cache.
    pub test_run: bool,
    /// Where intermediate artifacts live; defaults to `cache` (or
    /// `cache-testrun`) under the working directory.
    pub cache_dir: Option<PathBuf>,
}

pub fn compute_qrank(
    config: &BuildConfig,
    storage_client: Option<&dyn ObjectStorage>,
) -> Result<()> {
    let start = Instant::now();
    let out_dir = match &config.cache_dir {
        Some(dir) => dir.clone(),
        None => PathBuf::from(if config.test_run { "cache-testrun" } else { "cache" }),
    };
    ensure_dir(&out_dir)?;

    let (date, dump_path) = util::find_entities_dump(&config.dumps)?;
    info!(epoch = %date, dump = %dump_path.display(), "building qrank");

    let pageview_paths =
        pageviews::process_pageviews(config.test_run, &config.dumps, date, &out_dir)?;
    let sitelinks = entities::process_entities(config.test_run, &dump_path, date, &out_dir)?;
    let qviews_path = qviews::build_qviews(date, &sitelinks, &pageview_paths, &out_dir)?;
    let (_qrank_path, qrank_csv) = qrank::build_qrank(date, &qviews_path, &out_dir)?;
    let stats_path = stats::build_stats(date, &qrank_csv, &out_dir)?;

    if let Some(client) = storage_client {
        storage::upload(date, &qrank_csv, &stats_path, client)?;
    }

    info!(
        elapsed_s = start.elapsed().as_secs_f32(),
        "qrank build finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FsStorage, BUCKET};
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use flate2::read::GzDecoder;
    use std::fs;
    use std::io::{Read, Write};
    use std::path::Path;

    fn bz2(body: &str) -> Vec<u8> {
        let mut enc = BzEncoder::new(Vec::new(), Compression::best());
        enc.write_all(body.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    /// Lays out a miniature dumps directory: one entity dump dated
    /// 2024-01-15 plus daily pageview logs for December 2023.
    fn fake_dumps(root: &Path) {
        let entities_dir = root.join("wikidatawiki/entities/20240115");
        fs::create_dir_all(&entities_dir).unwrap();
        let mut dump = String::from("[\n");
        dump.push_str(r#"{"type":"item","id":"Q64","sitelinks":{"dewiki":{"site":"dewiki","title":"Berlin"},"enwiki":{"site":"enwiki","title":"Berlin"}}},"#);
        dump.push('\n');
        dump.push_str(r#"{"type":"item","id":"Q1","sitelinks":{"enwiki":{"site":"enwiki","title":"Universe"}}},"#);
        dump.push('\n');
        dump.push_str("]\n");
        fs::write(
            entities_dir.join("wikidata-20240115-all.json.bz2"),
            bz2(&dump),
        )
        .unwrap();

        let month_dir = root.join("other/pageview_complete/2023/2023-12");
        fs::create_dir_all(&month_dir).unwrap();
        for day in 1..=31u32 {
            let body = match day {
                1 => {
                    "de.wikipedia Berlin 3 desktop 10 A1\n\
                     en.wikipedia Berlin 2 mobile-web 4 B1\n\
                     en.wikipedia Berlin 1 desktop 3 C1\n\
                     en.wikipedia No_entity_here 9 desktop 50 D1\n"
                }
                2 => {
                    "en.wikipedia Berlin 1 desktop 5 A1\n\
                     en.wikipedia Universe 1 desktop 2 B1\n"
                }
                _ => "",
            };
            fs::write(
                month_dir.join(format!("pageviews-202312{day:02}-user.bz2")),
                bz2(body),
            )
            .unwrap();
        }
    }

    #[test]
    fn end_to_end_test_run() {
        let dir = tempfile::tempdir().unwrap();
        let dumps = dir.path().join("dumps");
        fake_dumps(&dumps);

        let cache = dir.path().join("cache");
        let objects = FsStorage {
            root: dir.path().join("objects"),
        };
        let config = BuildConfig {
            dumps,
            test_run: true,
            cache_dir: Some(cache.clone()),
        };
        compute_qrank(&config, Some(&objects)).unwrap();

        let csv_path = cache.join("qrank-20240115.csv.gz");
        let mut csv = String::new();
        GzDecoder::new(fs::File::open(&csv_path).unwrap())
            .read_to_string(&mut csv)
            .unwrap();
        // Berlin: de 10 + en (4+3) + en 5 = 22; Universe: 2. The page
        // without a sitelink contributes nothing.
        assert_eq!(csv, "Entity,QRank\nQ64,22\nQ1,2\n");

        let stats: crate::stats::Stats = serde_json::from_reader(
            fs::File::open(cache.join("stats-20240115.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(stats.lines, 2);
        assert_eq!(stats.epoch, "2024-01-15");

        let uploaded = dir
            .path()
            .join("objects")
            .join(BUCKET)
            .join("public/qrank-20240115.csv.gz");
        assert_eq!(fs::read(uploaded).unwrap(), fs::read(&csv_path).unwrap());

        // Re-running with all artifacts in place must produce identical
        // outputs from the cache alone.
        let before = fs::read(&csv_path).unwrap();
        compute_qrank(&config, None).unwrap();
        assert_eq!(fs::read(&csv_path).unwrap(), before);
    }
}
