use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Compression level for intermediate artifacts. Chosen for bzip2-like
/// ratios while staying much faster than the inputs' own codec.
pub const ZSTD_LEVEL: i32 = 9;

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref())
        .with_context(|| format!("create_dir_all {}", path.as_ref().display()))
}

pub fn open_reader(path: impl AsRef<Path>) -> Result<BufReader<File>> {
    let file =
        File::open(path.as_ref()).with_context(|| format!("open {}", path.as_ref().display()))?;
    Ok(BufReader::new(file))
}

/// Line-oriented reader over a zstd-compressed artifact.
pub fn open_zstd_reader(
    path: impl AsRef<Path>,
) -> Result<BufReader<zstd::stream::read::Decoder<'static, BufReader<File>>>> {
    let file =
        File::open(path.as_ref()).with_context(|| format!("open {}", path.as_ref().display()))?;
    let decoder = zstd::stream::read::Decoder::new(file)?;
    Ok(BufReader::new(decoder))
}

/// The temporary sibling an artifact is written to before the final rename.
/// Readers must treat `*.tmp` files as non-existent.
pub fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Writer that lands at `dest` only on a successful [`commit`]: output goes
/// to `dest.tmp`, is flushed and fsynced, then atomically renamed. A crash
/// or an early drop leaves at most a `*.tmp` file behind, which the next
/// run overwrites.
///
/// [`commit`]: AtomicFile::commit
pub struct AtomicFile {
    tmp: PathBuf,
    dest: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    pub fn create(dest: impl Into<PathBuf>) -> Result<AtomicFile> {
        let dest = dest.into();
        let tmp = tmp_path(&dest);
        let file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        Ok(AtomicFile {
            tmp,
            dest,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn commit(mut self) -> Result<()> {
        let writer = self.writer.take().expect("already committed");
        let file = writer
            .into_inner()
            .with_context(|| format!("flush {}", self.tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", self.tmp.display()))?;
        drop(file);
        fs::rename(&self.tmp, &self.dest)
            .with_context(|| format!("rename {} -> {}", self.tmp.display(), self.dest.display()))?;
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.as_mut().expect("already committed").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.as_mut().expect("already committed").flush()
    }
}

/// zstd-compressing [`AtomicFile`], the shape every intermediate artifact
/// is written in.
pub struct AtomicZstdFile {
    encoder: Option<zstd::stream::write::Encoder<'static, AtomicFile>>,
}

impl AtomicZstdFile {
    pub fn create(dest: impl Into<PathBuf>) -> Result<AtomicZstdFile> {
        let inner = AtomicFile::create(dest)?;
        let encoder = zstd::stream::write::Encoder::new(inner, ZSTD_LEVEL)?;
        Ok(AtomicZstdFile {
            encoder: Some(encoder),
        })
    }

    pub fn commit(mut self) -> Result<()> {
        let encoder = self.encoder.take().expect("already committed");
        let inner = encoder.finish()?;
        inner.commit()
    }
}

impl Write for AtomicZstdFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.encoder
            .as_mut()
            .expect("already committed")
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.as_mut().expect("already committed").flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn atomic_zstd_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("rows.zst");

        let mut out = AtomicZstdFile::create(&dest).unwrap();
        out.write_all(b"a 1\nb 2\n").unwrap();
        assert!(!dest.exists(), "artifact visible before commit");
        out.commit().unwrap();
        assert!(dest.exists());
        assert!(!tmp_path(&dest).exists());

        let lines: Vec<String> = open_zstd_reader(&dest)
            .unwrap()
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines, vec!["a 1", "b 2"]);
    }

    #[test]
    fn abandoned_writer_leaves_only_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("rows.zst");
        {
            let mut out = AtomicZstdFile::create(&dest).unwrap();
            out.write_all(b"half a row").unwrap();
            // dropped without commit, simulating a crashed stage
        }
        assert!(!dest.exists());
    }
}
