//! Content-addressed tar writing
//!
//! [`CasTarWriter`] produces tar archives in which regular-file payloads
//! are stored exactly once: later occurrences of the same content (or of
//! the same content under the same normalized header) become hardlinks to
//! the first occurrence. Identity is tracked in three append-only tables
//! (blob hashes, node hashes, tree hashes) plus first-path maps.
//!
//! The writer owns the underlying tar sink and must be driven
//! sequentially. The first failure poisons the writer; all further
//! operations return an error.

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Where non-regular entries land in the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureMode {
    /// Only content objects are emitted; directories, symlinks and
    /// hardlink aliases are dropped entirely.
    CasOnly,
    /// Content objects first; directory/symlink/hardlink entries are
    /// deferred and flushed at `finish`.
    CasFirst,
    /// Entries are emitted in caller order.
    Intertwined,
}

/// PAX extension records attached to an entry, sorted by key
pub type PaxRecords = BTreeMap<String, String>;

/// What happened to a stored blob
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    /// Path under which the content lives in the archive. For a
    /// deduplicated store this is the path of the first occurrence.
    pub path: String,
    pub blob_hash: String,
    pub size: u64,
    /// True when the content was already present and no bytes were written
    pub deduplicated: bool,
}

/// Entry types forwarded to the write-header callback
pub type HeaderCallback = Box<dyn FnMut(&str, tar::EntryType) + Send>;

struct DeferredEntry {
    header: tar::Header,
    name: String,
    link_target: Option<String>,
    pax: PaxRecords,
}

pub struct CasTarWriter<W: Write> {
    builder: tar::Builder<W>,
    mode: StructureMode,
    // Append-only identity tables.
    blob_hashes: Vec<String>,
    node_hashes: Vec<String>,
    tree_hashes: Vec<String>,
    blob_first_path: HashMap<String, String>,
    node_first_path: HashMap<String, String>,
    tree_first_path: HashMap<String, String>,
    deferred: Vec<DeferredEntry>,
    on_header: Option<(Vec<tar::EntryType>, HeaderCallback)>,
    poisoned: bool,
    finished: bool,
}

impl<W: Write> CasTarWriter<W> {
    pub fn new(sink: W, mode: StructureMode) -> Self {
        let mut builder = tar::Builder::new(sink);
        builder.mode(tar::HeaderMode::Deterministic);
        Self {
            builder,
            mode,
            blob_hashes: Vec::new(),
            node_hashes: Vec::new(),
            tree_hashes: Vec::new(),
            blob_first_path: HashMap::new(),
            node_first_path: HashMap::new(),
            tree_first_path: HashMap::new(),
            deferred: Vec::new(),
            on_header: None,
            poisoned: false,
            finished: false,
        }
    }

    /// Install a callback invoked for each written header whose entry
    /// type is in `types`
    pub fn set_header_callback(&mut self, types: Vec<tar::EntryType>, callback: HeaderCallback) {
        self.on_header = Some((types, callback));
    }

    pub fn blob_count(&self) -> usize {
        self.blob_hashes.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_hashes.len()
    }

    pub fn tree_count(&self) -> usize {
        self.tree_hashes.len()
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(ImageError::Io(
                "tar store is unusable after a previous write failure".to_string(),
            ));
        }
        if self.finished {
            return Err(ImageError::Io("tar store already finished".to_string()));
        }
        Ok(())
    }

    fn poison<T>(&mut self, err: ImageError) -> Result<T> {
        self.poisoned = true;
        Err(err)
    }

    fn notify(&mut self, name: &str, entry_type: tar::EntryType) {
        if let Some((types, callback)) = &mut self.on_header {
            if types.contains(&entry_type) {
                callback(name, entry_type);
            }
        }
    }

    fn append_pax(&mut self, pax: &PaxRecords) -> Result<()> {
        if pax.is_empty() {
            return Ok(());
        }
        self.builder
            .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_bytes())))
            .map_err(|e| ImageError::Io(format!("Failed to write PAX extensions: {}", e)))
    }

    fn emit_regular<R: Read>(
        &mut self,
        header: &mut tar::Header,
        name: &str,
        pax: &PaxRecords,
        data: R,
    ) -> Result<()> {
        self.append_pax(pax)?;
        self.builder
            .append_data(header, name, data)
            .map_err(|e| ImageError::Io(format!("Failed to write tar entry {}: {}", name, e)))?;
        self.notify(name, tar::EntryType::Regular);
        Ok(())
    }

    fn emit_hardlink(&mut self, header_meta: &tar::Header, name: &str, target: &str) -> Result<()> {
        let mut header = header_meta.clone();
        header.set_entry_type(tar::EntryType::Link);
        header.set_size(0);
        self.builder
            .append_link(&mut header, name, target)
            .map_err(|e| ImageError::Io(format!("Failed to write hardlink {}: {}", name, e)))?;
        self.notify(name, tar::EntryType::Link);
        Ok(())
    }

    /// Ingest an opaque blob. The first occurrence of the content is
    /// written as a regular file at `intended_path`; later occurrences
    /// write nothing and report the first path so the caller can emit a
    /// hardlink.
    pub fn store<R: Read>(&mut self, mut reader: R, intended_path: &str) -> Result<StoreOutcome> {
        self.check_usable()?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| ImageError::Io(format!("Failed to read blob for {}: {}", intended_path, e)))?;
        let blob_hash = Digest::sha256(&data).hex;
        let size = data.len() as u64;

        if let Some(first) = self.blob_first_path.get(&blob_hash) {
            return Ok(StoreOutcome {
                path: first.clone(),
                blob_hash,
                size,
                deduplicated: true,
            });
        }

        let mut header = default_file_header(size);
        if let Err(e) = self.emit_regular(&mut header, intended_path, &PaxRecords::new(), &data[..])
        {
            return self.poison(e);
        }
        self.blob_hashes.push(blob_hash.clone());
        self.blob_first_path
            .insert(blob_hash.clone(), intended_path.to_string());
        Ok(StoreOutcome {
            path: intended_path.to_string(),
            blob_hash,
            size,
            deduplicated: false,
        })
    }

    /// Like [`store`](Self::store) but keyed by the normalized header as
    /// well, so identical content under different modes/owners stays
    /// distinct.
    pub fn store_node<R: Read>(
        &mut self,
        mut reader: R,
        header: &tar::Header,
        intended_path: &str,
        pax: &PaxRecords,
    ) -> Result<StoreOutcome> {
        self.check_usable()?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| ImageError::Io(format!("Failed to read blob for {}: {}", intended_path, e)))?;
        let blob_hash = Digest::sha256(&data).hex;
        let size = data.len() as u64;
        let node = node_hash(header, pax, &blob_hash);

        if let Some(first) = self.node_first_path.get(&node) {
            return Ok(StoreOutcome {
                path: first.clone(),
                blob_hash,
                size,
                deduplicated: true,
            });
        }

        let mut header = header.clone();
        header.set_size(size);
        if let Err(e) = self.emit_regular(&mut header, intended_path, pax, &data[..]) {
            return self.poison(e);
        }
        if !self.blob_first_path.contains_key(&blob_hash) {
            self.blob_hashes.push(blob_hash.clone());
            self.blob_first_path
                .insert(blob_hash.clone(), intended_path.to_string());
        }
        self.node_hashes.push(node.clone());
        self.node_first_path.insert(node, intended_path.to_string());
        Ok(StoreOutcome {
            path: intended_path.to_string(),
            blob_hash,
            size,
            deduplicated: false,
        })
    }

    /// Commit a directory tree under `.cas/tree/<treeHash>/`, skipping
    /// trees that were committed before. Returns the chosen path.
    pub fn store_tree(&mut self, root: &Path) -> Result<String> {
        self.check_usable()?;
        let tree = tree_hash(root)?;
        if let Some(first) = self.tree_first_path.get(&tree) {
            return Ok(first.clone());
        }
        let base = format!(".cas/tree/{}", tree);
        self.write_dir_all(&base)?;
        self.store_tree_contents(root, &base)?;
        self.tree_hashes.push(tree.clone());
        self.tree_first_path.insert(tree, base.clone());
        Ok(base)
    }

    fn store_tree_contents(&mut self, dir: &Path, archive_base: &str) -> Result<()> {
        for entry in sorted_dir_entries(dir)? {
            let name = entry.file_name().to_string_lossy().to_string();
            let archive_path = format!("{}/{}", archive_base, name);
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.write_dir_all(&archive_path)?;
                self.store_tree_contents(&entry.path(), &archive_path)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                let mut header = default_file_header(0);
                header.set_entry_type(tar::EntryType::Symlink);
                self.write_symlink_header(header, &archive_path, &target.to_string_lossy())?;
            } else {
                let file = File::open(entry.path())?;
                let metadata = entry.metadata()?;
                let mut header = default_file_header(metadata.len());
                let outcome = self.store_node(file, &header, &archive_path, &PaxRecords::new())?;
                if outcome.deduplicated && outcome.path != archive_path {
                    header.set_size(0);
                    let target = outcome.path.clone();
                    self.emit_hardlink(&header, &archive_path, &target)?;
                }
            }
        }
        Ok(())
    }

    /// Emit a directory entry (with trailing slash), honoring the
    /// structural mode
    pub fn write_dir_all(&mut self, path: &str) -> Result<()> {
        let name = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let mut header = default_file_header(0);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        self.write_header(header, &name, None, PaxRecords::new())
    }

    /// Emit (or defer, in CAS-first mode) a non-regular entry:
    /// directory, symlink, or explicit hardlink
    pub fn write_header(
        &mut self,
        header: tar::Header,
        name: &str,
        link_target: Option<&str>,
        pax: PaxRecords,
    ) -> Result<()> {
        self.check_usable()?;
        match self.mode {
            StructureMode::CasOnly => Ok(()),
            StructureMode::CasFirst => {
                self.deferred.push(DeferredEntry {
                    header,
                    name: name.to_string(),
                    link_target: link_target.map(str::to_string),
                    pax,
                });
                Ok(())
            }
            StructureMode::Intertwined => {
                let result = self.write_header_now(header, name, link_target, &pax);
                if result.is_err() {
                    self.poisoned = true;
                }
                result
            }
        }
    }

    fn write_header_now(
        &mut self,
        mut header: tar::Header,
        name: &str,
        link_target: Option<&str>,
        pax: &PaxRecords,
    ) -> Result<()> {
        self.append_pax(pax)?;
        let entry_type = header.entry_type();
        match link_target {
            Some(target) => {
                self.builder
                    .append_link(&mut header, name, target)
                    .map_err(|e| {
                        ImageError::Io(format!("Failed to write link entry {}: {}", name, e))
                    })?;
            }
            None => {
                self.builder
                    .append_data(&mut header, name, io::empty())
                    .map_err(|e| ImageError::Io(format!("Failed to write entry {}: {}", name, e)))?;
            }
        }
        self.notify(name, entry_type);
        Ok(())
    }

    fn write_symlink_header(
        &mut self,
        mut header: tar::Header,
        name: &str,
        target: &str,
    ) -> Result<()> {
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        self.write_header(header, name, Some(target), PaxRecords::new())
    }

    /// Write a regular file without dedup
    pub fn write_regular<R: Read>(
        &mut self,
        mut header: tar::Header,
        name: &str,
        pax: PaxRecords,
        data: R,
    ) -> Result<()> {
        self.check_usable()?;
        let result = self.emit_regular(&mut header, name, &pax, data);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Write a regular file, deduplicating by node hash: repeated
    /// occurrences become hardlinks to the first
    pub fn write_regular_deduplicated<R: Read>(
        &mut self,
        header: tar::Header,
        name: &str,
        pax: PaxRecords,
        data: R,
    ) -> Result<()> {
        let outcome = self.store_node(data, &header, name, &pax)?;
        if outcome.deduplicated && outcome.path != name {
            let target = outcome.path.clone();
            let mut link_header = header.clone();
            link_header.set_size(0);
            let result = self.emit_hardlink(&link_header, name, &target);
            if result.is_err() {
                self.poisoned = true;
            }
            return result;
        }
        Ok(())
    }

    /// Stream a file from disk into the archive without dedup. The file
    /// is hashed first so the identity tables stay complete.
    pub fn write_regular_from_path(
        &mut self,
        mut header: tar::Header,
        name: &str,
        pax: PaxRecords,
        path: &Path,
    ) -> Result<()> {
        self.check_usable()?;
        let (digest, size) = Digest::sha256_reader(File::open(path).map_err(|e| {
            ImageError::Io(format!("Failed to open {}: {}", path.display(), e))
        })?)?;
        header.set_size(size);
        let file = File::open(path)?;
        let result = self.emit_regular(&mut header, name, &pax, file);
        if result.is_err() {
            self.poisoned = true;
            return result;
        }
        if !self.blob_first_path.contains_key(&digest.hex) {
            self.blob_hashes.push(digest.hex.clone());
            self.blob_first_path.insert(digest.hex, name.to_string());
        }
        Ok(())
    }

    /// Stream a file from disk, deduplicating by node hash
    pub fn write_regular_from_path_deduplicated(
        &mut self,
        mut header: tar::Header,
        name: &str,
        pax: PaxRecords,
        path: &Path,
    ) -> Result<()> {
        self.check_usable()?;
        let (digest, size) = Digest::sha256_reader(File::open(path).map_err(|e| {
            ImageError::Io(format!("Failed to open {}: {}", path.display(), e))
        })?)?;
        header.set_size(size);
        let node = node_hash(&header, &pax, &digest.hex);

        if let Some(first) = self.node_first_path.get(&node).cloned() {
            if first != name {
                let mut link_header = header.clone();
                link_header.set_size(0);
                let result = self.emit_hardlink(&link_header, name, &first);
                if result.is_err() {
                    self.poisoned = true;
                }
                return result;
            }
            return Ok(());
        }

        let file = File::open(path)?;
        let result = self.emit_regular(&mut header, name, &pax, file);
        if result.is_err() {
            self.poisoned = true;
            return result;
        }
        if !self.blob_first_path.contains_key(&digest.hex) {
            self.blob_hashes.push(digest.hex.clone());
            self.blob_first_path.insert(digest.hex, name.to_string());
        }
        self.node_hashes.push(node.clone());
        self.node_first_path.insert(node, name.to_string());
        Ok(())
    }

    /// Flush deferred entries (CAS-first mode) and finish the archive,
    /// returning the sink
    pub fn finish(mut self) -> Result<W> {
        if self.poisoned {
            return Err(ImageError::Io(
                "tar store is unusable after a previous write failure".to_string(),
            ));
        }
        self.finished = true;
        let deferred = std::mem::take(&mut self.deferred);
        for entry in deferred {
            self.write_header_now(
                entry.header,
                &entry.name,
                entry.link_target.as_deref(),
                &entry.pax,
            )?;
        }
        let sink = self
            .builder
            .into_inner()
            .map_err(|e| ImageError::Io(format!("Failed to finish tar archive: {}", e)))?;
        Ok(sink)
    }
}

/// A deterministic header for synthesized entries
pub fn default_file_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header
}

/// Hash of the normalized header plus the blob hash. The entry name is
/// cleared and PAX records are applied in sorted order; mtime, owner,
/// mode, type flag, link name, and device numbers are all retained.
pub fn node_hash(header: &tar::Header, pax: &PaxRecords, blob_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"mode=");
    hasher.update(header.mode().unwrap_or(0).to_le_bytes());
    hasher.update(b"uid=");
    hasher.update(header.uid().unwrap_or(0).to_le_bytes());
    hasher.update(b"gid=");
    hasher.update(header.gid().unwrap_or(0).to_le_bytes());
    hasher.update(b"mtime=");
    hasher.update(header.mtime().unwrap_or(0).to_le_bytes());
    hasher.update(b"type=");
    hasher.update([header.entry_type().as_byte()]);
    hasher.update(b"link=");
    if let Ok(Some(link)) = header.link_name() {
        hasher.update(link.to_string_lossy().as_bytes());
    }
    hasher.update(b"devmajor=");
    hasher.update(
        header
            .device_major()
            .ok()
            .flatten()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    hasher.update(b"devminor=");
    hasher.update(
        header
            .device_minor()
            .ok()
            .flatten()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    for (key, value) in pax {
        hasher.update(b"pax:");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"blob=");
    hasher.update(blob_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Merkle hash of a directory tree: children sorted by name, each
/// contributing `(name, kind, child hash)`
fn tree_hash(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in sorted_dir_entries(dir)? {
        let name = entry.file_name().to_string_lossy().to_string();
        let file_type = entry.file_type()?;
        hasher.update(name.as_bytes());
        if file_type.is_dir() {
            hasher.update(b"/dir/");
            hasher.update(tree_hash(&entry.path())?.as_bytes());
        } else if file_type.is_symlink() {
            hasher.update(b"/symlink/");
            let target = std::fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else {
            hasher.update(b"/file/");
            let (digest, _) = Digest::sha256_reader(File::open(entry.path())?)?;
            hasher.update(digest.hex.as_bytes());
        }
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn sorted_dir_entries(dir: &Path) -> Result<Vec<std::fs::DirEntry>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| ImageError::Io(format!("Failed to read directory {}: {}", dir.display(), e)))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry_names(tar_bytes: &[u8]) -> Vec<(String, tar::EntryType)> {
        let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().to_string(),
                    e.header().entry_type(),
                )
            })
            .collect()
    }

    #[test]
    fn test_store_dedups_by_content() {
        let mut writer = CasTarWriter::new(Vec::new(), StructureMode::Intertwined);
        let first = writer.store(&b"same bytes"[..], "a/x").unwrap();
        assert!(!first.deduplicated);
        let second = writer.store(&b"same bytes"[..], "b/y").unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.path, "a/x");
        assert_eq!(first.blob_hash, second.blob_hash);
        assert_eq!(writer.blob_count(), 1);

        let bytes = writer.finish().unwrap();
        let names = entry_names(&bytes);
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].0, "a/x");
    }

    #[test]
    fn test_store_node_distinguishes_metadata() {
        let mut writer = CasTarWriter::new(Vec::new(), StructureMode::Intertwined);
        let header_a = default_file_header(0);
        let mut header_b = default_file_header(0);
        header_b.set_mode(0o755);

        let first = writer
            .store_node(&b"payload"[..], &header_a, "bin/one", &PaxRecords::new())
            .unwrap();
        // Same content, different mode: a distinct node.
        let second = writer
            .store_node(&b"payload"[..], &header_b, "bin/two", &PaxRecords::new())
            .unwrap();
        assert!(!second.deduplicated);
        assert_eq!(first.blob_hash, second.blob_hash);
        assert_eq!(writer.node_count(), 2);
        assert_eq!(writer.blob_count(), 1);

        // Same content, same metadata: deduplicated.
        let third = writer
            .store_node(&b"payload"[..], &header_a, "bin/three", &PaxRecords::new())
            .unwrap();
        assert!(third.deduplicated);
        assert_eq!(third.path, "bin/one");
    }

    #[test]
    fn test_write_regular_deduplicated_emits_hardlink() {
        let mut writer = CasTarWriter::new(Vec::new(), StructureMode::Intertwined);
        let header = default_file_header(0);
        writer
            .write_regular_deduplicated(header.clone(), "data/a", PaxRecords::new(), &b"dup"[..])
            .unwrap();
        writer
            .write_regular_deduplicated(header, "data/b", PaxRecords::new(), &b"dup"[..])
            .unwrap();
        let bytes = writer.finish().unwrap();
        let names = entry_names(&bytes);
        assert_eq!(names[0], ("data/a".to_string(), tar::EntryType::Regular));
        assert_eq!(names[1], ("data/b".to_string(), tar::EntryType::Link));
    }

    #[test]
    fn test_cas_first_defers_non_regular_entries() {
        let mut writer = CasTarWriter::new(Vec::new(), StructureMode::CasFirst);
        writer.write_dir_all("etc").unwrap();
        writer.store(&b"conf"[..], "etc/conf").unwrap();
        let bytes = writer.finish().unwrap();
        let names = entry_names(&bytes);
        // Content first, deferred directory after.
        assert_eq!(names[0].0, "etc/conf");
        assert_eq!(names[1], ("etc/".to_string(), tar::EntryType::Directory));
    }

    #[test]
    fn test_cas_only_drops_structure() {
        let mut writer = CasTarWriter::new(Vec::new(), StructureMode::CasOnly);
        writer.write_dir_all("etc").unwrap();
        writer.store(&b"conf"[..], "etc/conf").unwrap();
        let bytes = writer.finish().unwrap();
        let names = entry_names(&bytes);
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].0, "etc/conf");
    }

    #[test]
    fn test_node_hash_ignores_name_orders_pax() {
        let header = default_file_header(5);
        let mut pax_a = PaxRecords::new();
        pax_a.insert("k1".into(), "v1".into());
        pax_a.insert("k2".into(), "v2".into());
        let mut pax_b = PaxRecords::new();
        pax_b.insert("k2".into(), "v2".into());
        pax_b.insert("k1".into(), "v1".into());
        // BTreeMap ordering makes insertion order irrelevant.
        assert_eq!(node_hash(&header, &pax_a, "ab"), node_hash(&header, &pax_b, "ab"));

        let mut other = header.clone();
        other.set_mtime(100);
        assert_ne!(node_hash(&header, &pax_a, "ab"), node_hash(&other, &pax_a, "ab"));
    }

    #[test]
    fn test_store_tree_skips_repeats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.txt"), b"tree content").unwrap();

        let mut writer = CasTarWriter::new(Vec::new(), StructureMode::Intertwined);
        let first = writer.store_tree(dir.path()).unwrap();
        let second = writer.store_tree(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with(".cas/tree/"));
        assert_eq!(writer.tree_count(), 1);
    }

    #[test]
    fn test_callback_filters_entry_types() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let count = Arc::new(AtomicUsize::new(0));
        let count_in_cb = count.clone();

        let mut writer = CasTarWriter::new(Vec::new(), StructureMode::Intertwined);
        writer.set_header_callback(
            vec![tar::EntryType::Regular],
            Box::new(move |_, _| {
                count_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        writer.write_dir_all("d").unwrap();
        writer.store(&b"x"[..], "d/f").unwrap();
        writer.finish().unwrap();
        // Only the regular entry fires the callback.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
