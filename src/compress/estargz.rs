//! eStargz stream restructuring
//!
//! Rewrites a plain layer tar into the seekable eStargz layout: every
//! entry starts on a gzip-member boundary, large file payloads are split
//! at a fixed stride with each chunk in its own member, a table of
//! contents (`stargz.index.json`) is appended as the final tar entry,
//! and the stream ends with a footer member whose gzip extra field
//! carries the TOC offset.

use crate::error::{ImageError, Result};
use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::io::{Read, Write};

/// Published chunk stride: payload bytes per gzip member
pub const CHUNK_STRIDE: usize = 4 * 1024 * 1024;

/// Name of the table-of-contents entry
pub const TOC_ENTRY_NAME: &str = "stargz.index.json";

#[derive(Debug, Serialize)]
struct TocEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    offset: u64,
    #[serde(rename = "chunkOffset", skip_serializing_if = "Option::is_none")]
    chunk_offset: Option<u64>,
    #[serde(rename = "chunkSize", skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gid: Option<u64>,
    #[serde(rename = "linkName", skip_serializing_if = "Option::is_none")]
    link_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
}

#[derive(Debug, Serialize)]
struct Toc {
    version: u32,
    entries: Vec<TocEntry>,
}

/// Byte-counting writer so member offsets can be recorded
struct CountingWriter<W: Write> {
    inner: W,
    offset: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> CountingWriter<W> {
    fn member(&mut self, level: GzLevel) -> GzEncoder<&mut Self> {
        GzEncoder::new(self, level)
    }
}

fn write_member<W: Write>(out: &mut CountingWriter<W>, level: GzLevel, data: &[u8]) -> Result<()> {
    let mut encoder = out.member(level);
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish().map(|_| ()))
        .map_err(|e| ImageError::Io(format!("estargz member: {}", e)))
}

fn tar_padding(size: u64) -> usize {
    let rem = (size % 512) as usize;
    if rem == 0 { 0 } else { 512 - rem }
}

fn entry_type_label(kind: tar::EntryType) -> &'static str {
    match kind {
        tar::EntryType::Directory => "dir",
        tar::EntryType::Symlink => "symlink",
        tar::EntryType::Link => "hardlink",
        _ => "reg",
    }
}

/// Rewrite `tar_reader` (a plain uncompressed tar stream) as eStargz
/// into `out`
pub fn write_estargz<R: Read, W: Write>(tar_reader: R, out: W, level: GzLevel) -> Result<()> {
    let mut out = CountingWriter {
        inner: out,
        offset: 0,
    };
    let mut archive = tar::Archive::new(tar_reader);
    let mut toc_entries: Vec<TocEntry> = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| ImageError::Io(format!("estargz input: {}", e)))?
    {
        let mut entry = entry.map_err(|e| ImageError::Io(format!("estargz input: {}", e)))?;
        let header = entry.header().clone();
        let name = entry
            .path()
            .map_err(|e| ImageError::Io(format!("estargz entry name: {}", e)))?
            .to_string_lossy()
            .to_string();
        let size = header.size().unwrap_or(0);
        let kind = header.entry_type();
        let member_offset = out.offset;

        let header_bytes = header.as_bytes().to_vec();
        if kind != tar::EntryType::Regular || size == 0 {
            // Header-only entries fit one member.
            write_member(&mut out, level, &header_bytes)?;
            toc_entries.push(TocEntry {
                name,
                entry_type: entry_type_label(kind),
                size: (kind == tar::EntryType::Regular).then_some(0),
                offset: member_offset,
                chunk_offset: None,
                chunk_size: None,
                mode: header.mode().ok(),
                uid: header.uid().ok(),
                gid: header.gid().ok(),
                link_name: header
                    .link_name()
                    .ok()
                    .flatten()
                    .map(|l| l.to_string_lossy().to_string()),
                digest: None,
            });
            continue;
        }

        // Regular file: header plus first chunk in the first member,
        // further chunks in their own members at the published stride.
        let mut remaining = size;
        let mut chunk_offset = 0u64;
        let mut content_hasher = {
            use sha2::Digest as _;
            sha2::Sha256::new()
        };
        let mut first = true;
        while remaining > 0 || first {
            let chunk_len = remaining.min(CHUNK_STRIDE as u64) as usize;
            let mut chunk = vec![0u8; chunk_len];
            entry
                .read_exact(&mut chunk)
                .map_err(|e| ImageError::Io(format!("estargz read {}: {}", name, e)))?;
            {
                use sha2::Digest as _;
                content_hasher.update(&chunk);
            }

            let this_offset = out.offset;
            if first {
                let mut member = header_bytes.clone();
                member.extend_from_slice(&chunk);
                write_member(&mut out, level, &member)?;
                toc_entries.push(TocEntry {
                    name: name.clone(),
                    entry_type: "reg",
                    size: Some(size),
                    offset: member_offset,
                    chunk_offset: (size > CHUNK_STRIDE as u64).then_some(0),
                    chunk_size: (size > CHUNK_STRIDE as u64).then_some(chunk_len as u64),
                    mode: header.mode().ok(),
                    uid: header.uid().ok(),
                    gid: header.gid().ok(),
                    link_name: None,
                    digest: None,
                });
            } else {
                write_member(&mut out, level, &chunk)?;
                toc_entries.push(TocEntry {
                    name: name.clone(),
                    entry_type: "chunk",
                    size: None,
                    offset: this_offset,
                    chunk_offset: Some(chunk_offset),
                    chunk_size: Some(chunk_len as u64),
                    mode: None,
                    uid: None,
                    gid: None,
                    link_name: None,
                    digest: None,
                });
            }
            chunk_offset += chunk_len as u64;
            remaining -= chunk_len as u64;
            first = false;
        }
        if let Some(first_entry) = toc_entries
            .iter_mut()
            .rev()
            .find(|e| e.name == name && e.entry_type == "reg")
        {
            use sha2::Digest as _;
            first_entry.digest = Some(format!("sha256:{:x}", content_hasher.finalize()));
        }

        // Tar content padding travels with the last chunk member.
        let pad = tar_padding(size);
        if pad > 0 {
            write_member(&mut out, level, &vec![0u8; pad])?;
        }
    }

    // TOC entry: its own member holding a complete tar entry.
    let toc_offset = out.offset;
    let toc = Toc {
        version: 1,
        entries: toc_entries,
    };
    let toc_json = serde_json::to_vec(&toc)?;
    let mut toc_header = tar::Header::new_ustar();
    toc_header.set_size(toc_json.len() as u64);
    toc_header.set_mode(0o444);
    toc_header.set_mtime(0);
    toc_header.set_entry_type(tar::EntryType::Regular);
    toc_header
        .set_path(TOC_ENTRY_NAME)
        .map_err(|e| ImageError::Io(format!("estargz toc header: {}", e)))?;
    toc_header.set_cksum();
    let mut toc_member = toc_header.as_bytes().to_vec();
    toc_member.extend_from_slice(&toc_json);
    toc_member.extend_from_slice(&vec![0u8; tar_padding(toc_json.len() as u64)]);
    // End-of-archive marker travels with the TOC member.
    toc_member.extend_from_slice(&[0u8; 1024]);
    write_member(&mut out, level, &toc_member)?;

    out.inner
        .write_all(&footer_bytes(toc_offset))
        .map_err(|e| ImageError::Io(format!("estargz footer: {}", e)))?;
    out.flush()?;
    Ok(())
}

/// The footer is an empty gzip member whose extra field encodes the TOC
/// offset as `%016x` followed by `STARGZ`.
fn footer_bytes(toc_offset: u64) -> Vec<u8> {
    let payload = format!("{:016x}STARGZ", toc_offset);
    let mut extra = Vec::with_capacity(4 + payload.len());
    extra.extend_from_slice(b"SG");
    extra.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    extra.extend_from_slice(payload.as_bytes());

    let mut footer = Vec::new();
    // Gzip header with FEXTRA set.
    footer.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
    footer.extend_from_slice(&(extra.len() as u16).to_le_bytes());
    footer.extend_from_slice(&extra);
    // Empty final deflate block, then CRC32 and ISIZE of the empty stream.
    footer.extend_from_slice(&[0x03, 0x00]);
    footer.extend_from_slice(&[0, 0, 0, 0]);
    footer.extend_from_slice(&[0, 0, 0, 0]);
    footer
}

/// Extract the TOC offset from a footer produced by [`footer_bytes`]
pub fn parse_footer(footer: &[u8]) -> Option<u64> {
    if footer.len() < 14 + 22 {
        return None;
    }
    let text = std::str::from_utf8(&footer[14..]).ok()?;
    let stargz = text.find("STARGZ")?;
    let offset_start = stargz.checked_sub(16)?;
    u64::from_str_radix(&text[offset_start..stargz], 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use std::io::Cursor;

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(11);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, "etc/motd", &b"hello world"[..])
            .unwrap();
        let mut dir = tar::Header::new_ustar();
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_mtime(0);
        dir.set_entry_type(tar::EntryType::Directory);
        builder.append_data(&mut dir, "var/", std::io::empty()).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_estargz_stream_is_valid_multi_gzip_tar() {
        let mut out = Vec::new();
        write_estargz(Cursor::new(sample_tar()), &mut out, GzLevel::default()).unwrap();

        let mut decompressed = Vec::new();
        MultiGzDecoder::new(&out[..])
            .read_to_end(&mut decompressed)
            .unwrap();
        let mut archive = tar::Archive::new(Cursor::new(decompressed));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["etc/motd", "var/", TOC_ENTRY_NAME]);
    }

    #[test]
    fn test_toc_is_last_entry_and_footer_points_at_it() {
        let mut out = Vec::new();
        write_estargz(Cursor::new(sample_tar()), &mut out, GzLevel::default()).unwrap();

        // Footer sits at end-of-stream and decodes to nothing.
        let footer_start = out.len() - footer_bytes(0).len();
        let footer = &out[footer_start..];
        let toc_offset = parse_footer(footer).unwrap();
        assert!(toc_offset < footer_start as u64);

        // Decoding from the TOC offset yields the TOC entry.
        let mut tail = Vec::new();
        MultiGzDecoder::new(&out[toc_offset as usize..])
            .read_to_end(&mut tail)
            .unwrap();
        let mut archive = tar::Archive::new(Cursor::new(tail));
        let mut entries = archive.entries().unwrap();
        let mut toc = entries.next().unwrap().unwrap();
        assert_eq!(
            toc.path().unwrap().to_string_lossy(),
            TOC_ENTRY_NAME
        );
        let mut json = String::new();
        toc.read_to_string(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], 1);
        let entries = value["entries"].as_array().unwrap();
        assert_eq!(entries[0]["name"], "etc/motd");
        assert_eq!(entries[0]["type"], "reg");
        assert_eq!(entries[1]["type"], "dir");
    }

    #[test]
    fn test_large_file_is_chunked() {
        let payload = vec![7u8; CHUNK_STRIDE + 100];
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, "big.bin", &payload[..])
            .unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut out = Vec::new();
        write_estargz(Cursor::new(tar_bytes), &mut out, GzLevel::fast()).unwrap();

        let mut decompressed = Vec::new();
        MultiGzDecoder::new(&out[..])
            .read_to_end(&mut decompressed)
            .unwrap();
        let mut archive = tar::Archive::new(Cursor::new(decompressed));
        let mut entries = archive.entries().unwrap();
        let mut big = entries.next().unwrap().unwrap();
        let mut restored = Vec::new();
        big.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, payload);

        let mut toc = entries.next().unwrap().unwrap();
        let mut json = String::new();
        toc.read_to_string(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let kinds: Vec<&str> = value["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["reg", "chunk"]);
    }
}
