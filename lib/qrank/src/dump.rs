//! Parallel access to a block-compressed entity dump.
//!
//! A `.json.bz2` dump is one long stream whose compressor did not align
//! blocks to entity boundaries. To fan the file out to workers anyway, the
//! compressed bytes are scanned for the six-byte bzip2 block magic; every
//! hit is verified by attempting to decompress from that offset behind a
//! synthesized stream header. Hits that fail to produce output are payload
//! bytes that merely look like a block start. The verified offsets cut the
//! file into independently decompressable chunks.
//!
//! Block boundaries still fall mid-line, so each chunk skips its first,
//! almost certainly partial, line and keeps decompressing into its
//! successor's first block until the line straddling the boundary is
//! complete. Together the two rules hand every logical line to exactly one
//! chunk, except when a boundary coincides with a line start, where the
//! straddler is seen twice; entity ids are unique, so the downstream
//! sort-merge absorbs the duplicate.

use anyhow::{bail, Context, Result};
use bzip2::{Decompress, Status};
use memchr::memchr;
use memchr::memmem;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

/// "1AY&SY", i.e. the digits of pi: every bzip2 block starts with it.
const BLOCK_MAGIC: [u8; 6] = [0x31, 0x41, 0x59, 0x26, 0x53, 0x59];

/// Upper bound on one compressed block: 900 KiB of uncompressed data can
/// only grow slightly under bzip2, so a verification that consumed this
/// much input without emitting a byte was not looking at a real block.
const VERIFY_WINDOW: usize = 2 << 20;

const OUT_BUF_SIZE: usize = 1 << 20;

/// One independently decompressable region of the dump, in compressed
/// byte offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub start: usize,
    pub end: usize,
}

pub struct DumpFile {
    mmap: Mmap,
}

impl DumpFile {
    pub fn open(path: &Path) -> Result<DumpFile> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mmap =
            unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", path.display()))?;
        if mmap.len() < 10 || &mmap[0..3] != b"BZh" || !mmap[3].is_ascii_digit() {
            bail!("{} is not a bzip2 file", path.display());
        }
        Ok(DumpFile { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    /// Cuts the dump into chunks at verified block boundaries.
    pub fn chunks(&self) -> Result<Vec<Chunk>> {
        let candidates: Vec<usize> = memmem::find_iter(&self.mmap[..], &BLOCK_MAGIC).collect();
        debug!(candidates = candidates.len(), "scanned for block magic");

        let mut starts: Vec<usize> = candidates
            .into_par_iter()
            .filter(|&offset| self.is_block_start(offset))
            .collect();
        starts.sort_unstable();
        if starts.is_empty() {
            bail!("no decompressable bzip2 blocks found");
        }

        let mut chunks = Vec::with_capacity(starts.len());
        for pair in starts.windows(2) {
            chunks.push(Chunk {
                start: pair[0],
                end: pair[1],
            });
        }
        chunks.push(Chunk {
            start: *starts.last().unwrap(),
            end: self.mmap.len(),
        });
        info!(chunks = chunks.len(), "split dump into chunks");
        Ok(chunks)
    }

    /// Trial decompression from `offset`: a real block start yields output
    /// before the verification window runs out; payload bytes that happen
    /// to contain the magic fail with a format error instead.
    fn is_block_start(&self, offset: usize) -> bool {
        let window_end = (offset + VERIFY_WINDOW).min(self.mmap.len());
        let mut decoder = Decompress::new(false);
        let mut out = vec![0u8; OUT_BUF_SIZE];
        for segment in [&SYNTH_HEADER[..], &self.mmap[offset..window_end]] {
            let mut pos = 0;
            while pos < segment.len() {
                let before_in = decoder.total_in();
                let before_out = decoder.total_out();
                match decoder.decompress(&segment[pos..], &mut out) {
                    Err(_) => return false,
                    Ok(Status::StreamEnd) => return decoder.total_out() > 0,
                    Ok(_) => {}
                }
                if decoder.total_out() > before_out {
                    return true;
                }
                pos += (decoder.total_in() - before_in) as usize;
                if decoder.total_in() == before_in {
                    break;
                }
            }
        }
        false
    }

    /// Decompresses one chunk and hands every complete line to `on_line`.
    /// The first line is skipped and the line running past `chunk.end` is
    /// finished from the following block, per the ownership rules above.
    pub fn read_chunk_lines<F>(&self, chunk: &Chunk, mut on_line: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut decoder = Decompress::new(false);
        let mut assembler = LineAssembler::default();

        decode(&mut decoder, &SYNTH_HEADER, &mut |_| Ok(false))?;
        let end = decode(&mut decoder, &self.mmap[chunk.start..chunk.end], &mut |bytes| {
            assembler.push(bytes, false, &mut on_line)?;
            Ok(false)
        })?;

        match end {
            DecodeEnd::StreamEnd | DecodeEnd::InputExhausted => {
                self.finish_straddler(chunk.end, &mut assembler, &mut on_line)?;
            }
            DecodeEnd::Stopped => unreachable!("phase one never stops early"),
        }
        Ok(())
    }

    /// The chunk's last line usually runs past its end offset. Decode from
    /// the verified block start at `offset` (a fresh decoder behind a
    /// synthesized header works whether or not that block opened a new
    /// stream) just far enough to complete it. The symmetric skip rule in
    /// the next chunk keeps the line from being emitted twice.
    fn finish_straddler(
        &self,
        mut offset: usize,
        assembler: &mut LineAssembler,
        on_line: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        loop {
            if offset >= self.mmap.len() {
                // End of the dump: whatever is buffered is the final,
                // unterminated line.
                return assembler.flush(on_line);
            }
            let mut decoder = Decompress::new(false);
            decode(&mut decoder, &SYNTH_HEADER, &mut |_| Ok(false))?;
            let end = decode(&mut decoder, &self.mmap[offset..], &mut |bytes| {
                assembler.push(bytes, true, &mut *on_line)
            })?;
            match end {
                DecodeEnd::Stopped => return Ok(()),
                DecodeEnd::InputExhausted => return assembler.flush(on_line),
                DecodeEnd::StreamEnd => {
                    // A whole following stream went by without a newline.
                    // Hop over its footer (and the next stream's header)
                    // and keep going.
                    offset +=
                        (decoder.total_in() as usize).saturating_sub(SYNTH_HEADER.len());
                    if self.mmap[offset..].starts_with(b"BZh") {
                        offset += 4;
                    }
                }
            }
        }
    }
}

/// Stream header fed to the decoder in front of each chunk. The block-size
/// digit is pinned to '9', which accepts blocks written at any level.
const SYNTH_HEADER: [u8; 4] = [b'B', b'Z', b'h', b'9'];

#[derive(Debug, PartialEq, Eq)]
enum DecodeEnd {
    StreamEnd,
    InputExhausted,
    Stopped,
}

/// Pumps `input` through the decoder, passing each decompressed span to
/// `sink`; a sink returning true stops the decode.
fn decode(
    decoder: &mut Decompress,
    input: &[u8],
    sink: &mut dyn FnMut(&[u8]) -> Result<bool>,
) -> Result<DecodeEnd> {
    let mut out = vec![0u8; OUT_BUF_SIZE];
    let mut pos = 0;
    loop {
        let before_in = decoder.total_in();
        let before_out = decoder.total_out();
        let status = decoder
            .decompress(&input[pos..], &mut out)
            .map_err(|err| anyhow::anyhow!("bzip2: {err}"))?;
        pos += (decoder.total_in() - before_in) as usize;
        let produced = (decoder.total_out() - before_out) as usize;
        if produced > 0 && sink(&out[..produced])? {
            return Ok(DecodeEnd::Stopped);
        }
        if matches!(status, Status::StreamEnd) {
            return Ok(DecodeEnd::StreamEnd);
        }
        if pos >= input.len() && produced == 0 {
            return Ok(DecodeEnd::InputExhausted);
        }
        if pos < input.len() && produced == 0 && decoder.total_in() == before_in {
            bail!("bzip2 decoder stalled at offset {pos}");
        }
    }
}

/// Reassembles lines from decompressed spans. The chunk's first line is
/// dropped; in finishing mode the first completed line is also the last.
#[derive(Default)]
struct LineAssembler {
    carry: Vec<u8>,
    skipped_head: bool,
}

impl LineAssembler {
    fn push(
        &mut self,
        mut bytes: &[u8],
        finishing: bool,
        on_line: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<bool> {
        while let Some(pos) = memchr(b'\n', bytes) {
            self.carry.extend_from_slice(&bytes[..pos]);
            if !self.skipped_head {
                self.skipped_head = true;
            } else {
                on_line(&self.carry)?;
            }
            self.carry.clear();
            bytes = &bytes[pos + 1..];
            if finishing {
                return Ok(true);
            }
        }
        self.carry.extend_from_slice(bytes);
        Ok(false)
    }

    fn flush(&mut self, on_line: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        if self.skipped_head && !self.carry.is_empty() {
            on_line(&self.carry)?;
        }
        self.carry.clear();
        Ok(())
    }
}
