//! Sitelink extraction from the entity dump.
//!
//! Entities arrive as one JSON object per line, but running a full JSON
//! parser over tens of gigabytes would dominate the build. The tokenizer
//! here decodes exactly two things: the top-level `id`, and the
//! `site`/`title` pairs inside the `sitelinks` map; everything else is
//! skipped over with escape-aware string scanning. String values go
//! through the same `\uXXXX`-and-surrogate unquoting rules as a JSON
//! parser would apply.

use crate::dump::{Chunk, DumpFile};
use crate::group::{is_cancelled, run_group, CancelToken, Cancelled};
use crate::io::AtomicZstdFile;
use crate::keys::format_line;
use crate::sort::{sort_strings, SortConfig};
use anyhow::Result;
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Receiver, Sender};
use memchr::memmem;
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Extracts one sorted, compressed `(wikikey, entityId)` file from the
/// block-compressed dump, splitting it across worker threads.
pub fn process_entities(
    test_run: bool,
    dump_path: &Path,
    date: NaiveDate,
    out_dir: &Path,
) -> Result<PathBuf> {
    let out_path = out_dir.join(format!("sitelinks-{}.zst", date.format("%Y%m%d")));
    if out_path.exists() {
        return Ok(out_path); // use pre-existing artifact
    }

    info!(dump = %dump_path.display(), "extracting sitelinks");
    let start = Instant::now();

    let dump = DumpFile::open(dump_path)?;
    let mut chunks = dump.chunks()?;
    if test_run {
        chunks.truncate(3);
    }

    let (line_tx, line_rx) = bounded(10_000);
    let config = SortConfig {
        tmp_dir: Some(out_dir.to_path_buf()),
        ..SortConfig::default()
    };
    let (sorter, sorted_rx, err_rx) = sort_strings(line_rx, config);
    let mut out = AtomicZstdFile::create(&out_path)?;

    let dump = &dump;
    let chunks = &chunks;
    let joined = run_group(vec![
        Box::new(move |t: &CancelToken| {
            chunks
                .par_iter()
                .try_for_each(|chunk| extract_chunk(dump, chunk, &line_tx, t))
        }),
        Box::new(|t: &CancelToken| {
            sorter.sort(t);
            Ok(())
        }),
        Box::new(|t: &CancelToken| write_sorted_dedup(&sorted_rx, &mut out, t)),
    ]);
    if let Ok(err) = err_rx.try_recv() {
        if !is_cancelled(&err) {
            return Err(err);
        }
    }
    joined?;
    out.commit()?;

    info!(
        elapsed_s = start.elapsed().as_secs_f32(),
        "extracted sitelinks"
    );
    Ok(out_path)
}

fn extract_chunk(
    dump: &DumpFile,
    chunk: &Chunk,
    lines: &Sender<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut skipped = 0u64;
    dump.read_chunk_lines(chunk, |raw| {
        let Some(json) = entity_json(raw) else {
            return Ok(());
        };
        if !scan_entity(json, &mut |line| cancel.send(lines, line))? {
            skipped += 1;
        }
        Ok(())
    })?;
    if skipped > 0 {
        debug!(skipped, "skipped undecodable entities");
    }
    Ok(())
}

/// Chunk boundaries can hand the same boundary entity to two workers;
/// after the sort those show up as identical adjacent lines and collapse
/// here.
fn write_sorted_dedup<W: Write>(
    sorted: &Receiver<String>,
    writer: &mut W,
    cancel: &CancelToken,
) -> Result<()> {
    let mut last: Option<String> = None;
    loop {
        crossbeam_channel::select! {
            recv(sorted) -> msg => {
                let line = match msg {
                    Ok(line) => line,
                    Err(_) => return Ok(()),
                };
                if last.as_deref() != Some(line.as_str()) {
                    writer.write_all(line.as_bytes())?;
                    writer.write_all(b"\n")?;
                    last = Some(line);
                }
            },
            recv(cancel.channel()) -> _ => return Err(anyhow::Error::new(Cancelled)),
        }
    }
}

/// Strips the array scaffolding around one dumped entity; `None` for the
/// opening `[`, the closing `]`, and anything else too short to matter.
fn entity_json(line: &[u8]) -> Option<&[u8]> {
    let mut s = line;
    while let [b' ' | b'\t' | b'\r', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t' | b'\r'] = s {
        s = rest;
    }
    if let [rest @ .., b','] = s {
        s = rest;
    }
    if s.len() < 5 || s[0] != b'{' {
        return None;
    }
    Some(s)
}

/// Walks one entity object, emitting a normalized line per sitelink.
/// Returns false when the object is too malformed to read.
fn scan_entity(json: &[u8], emit: &mut dyn FnMut(String) -> Result<()>) -> Result<bool> {
    let Some(id_pos) = memmem::find(json, b"\"id\":") else {
        return Ok(false);
    };
    let Some(id_start) = next_non_space(json, id_pos + 5) else {
        return Ok(false);
    };
    if json[id_start] != b'"' {
        return Ok(false);
    }
    let Some((id, _)) = json_string_at(json, id_start) else {
        return Ok(false);
    };

    let Some(sl_pos) = memmem::find(json, b"\"sitelinks\":") else {
        return Ok(true); // entity without sitelinks
    };
    let Some(open) = next_non_space(json, sl_pos + 12) else {
        return Ok(false);
    };
    if json[open] != b'{' {
        return Ok(false);
    }

    let mut i = open + 1;
    let mut depth = 1usize;
    let mut site: Option<String> = None;
    let mut title: Option<String> = None;
    while i < json.len() && depth > 0 {
        match json[i] {
            b'{' => {
                depth += 1;
                if depth == 2 {
                    site = None;
                    title = None;
                }
                i += 1;
            }
            b'}' => {
                if depth == 2 {
                    if let (Some(sitekey), Some(title)) = (site.take(), title.take()) {
                        emit_sitelink(&sitekey, &title, &id, emit)?;
                    }
                }
                depth -= 1;
                i += 1;
            }
            b'"' => {
                let Some((s, end)) = json_string_at(json, i) else {
                    return Ok(false);
                };
                i = end;
                if depth == 2 && (s == "site" || s == "title") {
                    // Only a key if a colon follows; then grab the value.
                    let Some(colon) = next_non_space(json, i) else {
                        continue;
                    };
                    if json[colon] != b':' {
                        continue;
                    }
                    let Some(value_at) = next_non_space(json, colon + 1) else {
                        continue;
                    };
                    if json[value_at] != b'"' {
                        continue;
                    }
                    let Some((value, value_end)) = json_string_at(json, value_at) else {
                        return Ok(false);
                    };
                    if s == "site" {
                        site = Some(value);
                    } else {
                        title = Some(value);
                    }
                    i = value_end;
                }
            }
            _ => i += 1,
        }
    }
    Ok(true)
}

fn emit_sitelink(
    sitekey: &str,
    title: &str,
    entity_id: &str,
    emit: &mut dyn FnMut(String) -> Result<()>,
) -> Result<()> {
    let Some((lang, site)) = split_site_key(sitekey) else {
        debug!(sitekey, "sitekey without a recognizable project");
        return Ok(());
    };
    let site = if site == "wiki" { "wikipedia" } else { site };
    emit(format_line(lang, site, title, entity_id))
}

/// Splits a dump sitekey like "enwiki" or "frwikisource" at its project
/// part: the prefix is the language, the rest names the site. Keys such as
/// "wikidatawiki" split into an empty language and the whole key, which the
/// normalizer's rewrite table resolves.
fn split_site_key(key: &str) -> Option<(&str, &str)> {
    if let Some(pos) = key.find("wiki") {
        return Some((&key[..pos], &key[pos..]));
    }
    // Wiktionary is the one project name not containing "wiki".
    if let Some(pos) = key.find("wiktionary") {
        return Some((&key[..pos], &key[pos..]));
    }
    None
}

fn next_non_space(bytes: &[u8], mut i: usize) -> Option<usize> {
    while i < bytes.len() {
        if !bytes[i].is_ascii_whitespace() {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Decodes the JSON string whose opening quote is at `at`; returns the
/// value and the index just past the closing quote.
fn json_string_at(bytes: &[u8], at: usize) -> Option<(String, usize)> {
    let end = raw_string_end(bytes, at)?;
    let value = unquote(&bytes[at..end])?;
    Some((value, end))
}

fn raw_string_end(bytes: &[u8], at: usize) -> Option<usize> {
    let mut i = at + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Converts a quoted JSON string literal into the string it denotes,
/// including `\uXXXX` escapes and surrogate pairs. Stray surrogates decode
/// to U+FFFD, like a JSON parser would.
fn unquote(s: &[u8]) -> Option<String> {
    if s.len() < 2 || s[0] != b'"' || s[s.len() - 1] != b'"' {
        return None;
    }
    let s = &s[1..s.len() - 1];
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        match s[i] {
            b'\\' => {
                let escape = *s.get(i + 1)?;
                match escape {
                    b'"' | b'\\' | b'/' | b'\'' => {
                        out.push(escape as char);
                        i += 2;
                    }
                    b'b' => {
                        out.push('\u{8}');
                        i += 2;
                    }
                    b'f' => {
                        out.push('\u{c}');
                        i += 2;
                    }
                    b'n' => {
                        out.push('\n');
                        i += 2;
                    }
                    b'r' => {
                        out.push('\r');
                        i += 2;
                    }
                    b't' => {
                        out.push('\t');
                        i += 2;
                    }
                    b'u' => {
                        let first = get_u4(&s[i..])?;
                        i += 6;
                        if (0xD800..0xE000).contains(&first) {
                            let second = if s.len() >= i + 6 { get_u4(&s[i..]) } else { None };
                            match second {
                                Some(low)
                                    if (0xD800..0xDC00).contains(&first)
                                        && (0xDC00..0xE000).contains(&low) =>
                                {
                                    i += 6;
                                    let combined =
                                        0x10000 + ((first - 0xD800) << 10) + (low - 0xDC00);
                                    out.push(char::from_u32(combined)?);
                                }
                                _ => out.push('\u{FFFD}'),
                            }
                        } else {
                            out.push(char::from_u32(first).unwrap_or('\u{FFFD}'));
                        }
                    }
                    _ => return None,
                }
            }
            b'"' => return None,
            b if b < 0x20 => return None,
            b if b < 0x80 => {
                out.push(b as char);
                i += 1;
            }
            _ => {
                // Multibyte UTF-8; coerce undecodable bytes to U+FFFD.
                let end = (i + 4).min(s.len());
                match std::str::from_utf8(&s[i..end]) {
                    Ok(t) => {
                        let c = t.chars().next()?;
                        out.push(c);
                        i += c.len_utf8();
                    }
                    Err(err) if err.valid_up_to() > 0 => {
                        let t = std::str::from_utf8(&s[i..i + err.valid_up_to()]).ok()?;
                        let c = t.chars().next()?;
                        out.push(c);
                        i += c.len_utf8();
                    }
                    Err(_) => {
                        out.push('\u{FFFD}');
                        i += 1;
                    }
                }
            }
        }
    }
    Some(out)
}

fn get_u4(s: &[u8]) -> Option<u32> {
    if s.len() < 6 || s[0] != b'\\' || s[1] != b'u' {
        return None;
    }
    let mut r = 0u32;
    for &c in &s[2..6] {
        let v = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => return None,
        };
        r = r * 16 + v as u32;
    }
    Some(r)
}
