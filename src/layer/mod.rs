//! Layer building
//!
//! Turns declared file sets into deterministic layer tars plus sibling
//! descriptor JSONs. Sources are streamed through the content-addressed
//! tar writer (identical files become hardlinks), grouped into one or
//! more layers, compressed, and digested.

use crate::castar::{CasTarWriter, PaxRecords, StructureMode, default_file_header};
use crate::compress::{CompressionSettings, compress};
use crate::digest::layer_digests_from_path;
use crate::error::{ImageError, Result};
use crate::logging::Logger;
use crate::oci::LayerDescriptor;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Per-path file metadata; unset fields fall back to the next layer of
/// defaults (per-path override, then spec default, then built-in)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileMetadata {
    pub mode: Option<String>,
    pub uid: Option<u64>,
    pub gid: Option<u64>,
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub mtime: Option<u64>,
    #[serde(default)]
    pub pax_records: BTreeMap<String, String>,
}

impl FileMetadata {
    /// Octal mode string to bits
    fn parsed_mode(&self) -> Result<Option<u32>> {
        match &self.mode {
            None => Ok(None),
            Some(text) => u32::from_str_radix(text, 8).map(Some).map_err(|_| {
                ImageError::Validation(format!("Invalid octal mode string: {}", text))
            }),
        }
    }

    /// `self` wins over `base` field by field
    fn merged_over(&self, base: &FileMetadata) -> FileMetadata {
        let mut pax = base.pax_records.clone();
        pax.extend(self.pax_records.clone());
        FileMetadata {
            mode: self.mode.clone().or_else(|| base.mode.clone()),
            uid: self.uid.or(base.uid),
            gid: self.gid.or(base.gid),
            uname: self.uname.clone().or_else(|| base.uname.clone()),
            gname: self.gname.clone().or_else(|| base.gname.clone()),
            mtime: self.mtime.or(base.mtime),
            pax_records: pax,
        }
    }

    fn to_header(&self, executable: bool) -> Result<(tar::Header, PaxRecords)> {
        let mut header = default_file_header(0);
        let default_mode = if executable { 0o755 } else { 0o644 };
        header.set_mode(self.parsed_mode()?.unwrap_or(default_mode));
        header.set_uid(self.uid.unwrap_or(0));
        header.set_gid(self.gid.unwrap_or(0));
        header.set_mtime(self.mtime.unwrap_or(0));
        if let Some(uname) = &self.uname {
            header
                .set_username(uname)
                .map_err(|e| ImageError::Validation(format!("Invalid uname: {}", e)))?;
        }
        if let Some(gname) = &self.gname {
            header
                .set_groupname(gname)
                .map_err(|e| ImageError::Validation(format!("Invalid gname: {}", e)))?;
        }
        Ok((header, self.pax_records.clone().into_iter().collect()))
    }
}

/// One runfile delivered alongside an executable
#[derive(Debug, Clone, Deserialize)]
pub struct RunfileSpec {
    /// Path relative to the runfiles directory in the image
    pub rel: String,
    /// Source path on disk
    pub src: PathBuf,
    #[serde(default)]
    pub group: Option<String>,
}

/// What a path in the image is fed from
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    File { path: PathBuf },
    Executable {
        path: PathBuf,
        #[serde(default)]
        runfiles: Vec<RunfileSpec>,
    },
    Directory { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputSpec {
    /// Destination path inside the image
    pub dest: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_true")]
    pub include_executable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymlinkSpec {
    pub link: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingPolicy {
    #[default]
    LayerPerGroup,
    MergeAll,
}

/// Complete layer-build request, deserialized from the build system
#[derive(Debug, Clone, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub default_metadata: FileMetadata,
    /// Per-path metadata overrides
    #[serde(default)]
    pub metadata: BTreeMap<String, FileMetadata>,
    #[serde(default)]
    pub symlinks: Vec<SymlinkSpec>,
    #[serde(default)]
    pub empty_dirs: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub grouping: GroupingPolicy,
    #[serde(default)]
    pub layer_ids: Option<Vec<String>>,
    #[serde(default)]
    pub include_groups: Vec<String>,
    #[serde(default)]
    pub exclude_groups: Vec<String>,
    /// Group name to layer id, identity when absent
    #[serde(default)]
    pub layer_for_group: BTreeMap<String, String>,
}

/// A produced layer blob with its descriptor
#[derive(Debug)]
pub struct BuiltLayer {
    pub layer_id: String,
    pub blob_path: PathBuf,
    pub descriptor: LayerDescriptor,
}

const MERGED_LAYER_ID: &str = "merged";

/// Deterministic rank for well-known group names; unranked groups sort
/// between debug and same-party, alphabetically.
fn group_rank(id: &str) -> u8 {
    match id.replace('-', "_").as_str() {
        "foundational" => 0,
        "other_party" => 1,
        "documentation" => 2,
        "debug" => 3,
        "same_party" => 6,
        _ => 4,
    }
}

fn sanitize_id(id: &str) -> String {
    id.replace('-', "_")
}

/// Reject absolute paths and `.`/`..` components; return the normalized
/// in-image path.
fn normalize_image_path(path: &str) -> Result<String> {
    if path.starts_with('/') {
        return Err(ImageError::Validation(format!(
            "Path is outside the image root (absolute): {}",
            path
        )));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" => continue,
            "." | ".." => {
                return Err(ImageError::Validation(format!(
                    "Path is outside the image root: {}",
                    path
                )));
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(ImageError::Validation(format!("Empty image path: {}", path)));
    }
    Ok(parts.join("/"))
}

/// Validate a symlink target: absolute targets point inside the image;
/// relative targets must not escape the root when resolved against the
/// link's directory.
fn validate_symlink_target(link: &str, target: &str) -> Result<()> {
    if target.starts_with('/') {
        return Ok(());
    }
    let mut depth: i64 = link.matches('/').count() as i64;
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return Err(ImageError::Validation(format!(
                        "Symlink target escapes the image root: {} -> {}",
                        link, target
                    )));
                }
            }
            _ => depth += 1,
        }
    }
    Ok(())
}

/// What lands in one layer, in emission order
enum PlannedEntry {
    FileFromDisk {
        dest: String,
        src: PathBuf,
        executable: bool,
    },
    Tree {
        dest: String,
        src: PathBuf,
    },
    Symlink {
        link: String,
        target: String,
    },
    EmptyDir {
        dest: String,
    },
}

struct LayerPlan {
    id: String,
    entries: Vec<PlannedEntry>,
}

fn resolve_layer_order(spec: &LayerSpec, groups_in_use: &BTreeSet<String>) -> Result<Vec<String>> {
    if spec.grouping == GroupingPolicy::MergeAll {
        return Ok(vec![MERGED_LAYER_ID.to_string()]);
    }
    let mut ids: BTreeSet<String> = BTreeSet::new();
    for group in groups_in_use {
        ids.insert(
            spec.layer_for_group
                .get(group)
                .cloned()
                .unwrap_or_else(|| group.clone()),
        );
    }
    if let Some(order) = &spec.layer_ids {
        for id in &ids {
            if !order.contains(id) {
                return Err(ImageError::Validation(format!(
                    "layer_for_group refers to unknown layer id: {}",
                    id
                )));
            }
        }
        return Ok(order.clone());
    }
    let mut ordered: Vec<String> = ids.into_iter().collect();
    ordered.sort_by(|a, b| group_rank(a).cmp(&group_rank(b)).then_with(|| a.cmp(b)));
    if ordered.is_empty() {
        ordered.push(MERGED_LAYER_ID.to_string());
    }
    Ok(ordered)
}

/// Build all layers for a spec into `out_dir`. Returns the layers in
/// their deterministic order.
pub fn build_layers(
    spec: &LayerSpec,
    out_dir: &Path,
    compression: &CompressionSettings,
    logger: &Logger,
) -> Result<Vec<BuiltLayer>> {
    compression.validate()?;
    if !spec.include_groups.is_empty() && !spec.exclude_groups.is_empty() {
        return Err(ImageError::Validation(
            "include_groups and exclude_groups are mutually exclusive".to_string(),
        ));
    }

    let group_included = |group: &str| -> bool {
        if !spec.include_groups.is_empty() {
            spec.include_groups.iter().any(|g| g == group)
        } else {
            !spec.exclude_groups.iter().any(|g| g == group)
        }
    };

    // Resolve the effective group set across all sources.
    let mut groups_in_use: BTreeSet<String> = BTreeSet::new();
    for input in &spec.inputs {
        for group in &input.groups {
            if group_included(group) {
                groups_in_use.insert(group.clone());
            }
        }
        if let SourceSpec::Executable { runfiles, .. } = &input.source {
            for runfile in runfiles {
                if let Some(group) = &runfile.group {
                    if group_included(group) {
                        groups_in_use.insert(group.clone());
                    }
                }
            }
        }
    }

    let order = resolve_layer_order(spec, &groups_in_use)?;
    let layer_index: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let default_layer = order.len() - 1;

    let layer_of_group = |group: &str| -> usize {
        if spec.grouping == GroupingPolicy::MergeAll {
            return 0;
        }
        let id = spec
            .layer_for_group
            .get(group)
            .map(String::as_str)
            .unwrap_or(group);
        layer_index.get(id).copied().unwrap_or(default_layer)
    };
    // Content spanning several groups lands in the last matching layer.
    let layer_of_groups = |groups: &[String]| -> usize {
        groups
            .iter()
            .filter(|g| group_included(g))
            .map(|g| layer_of_group(g))
            .max()
            .unwrap_or(default_layer)
    };

    let mut plans: Vec<LayerPlan> = order
        .iter()
        .map(|id| LayerPlan {
            id: id.clone(),
            entries: Vec::new(),
        })
        .collect();

    for input in &spec.inputs {
        let dest = normalize_image_path(&input.dest)?;
        match &input.source {
            SourceSpec::File { path } => {
                plans[layer_of_groups(&input.groups)]
                    .entries
                    .push(PlannedEntry::FileFromDisk {
                        dest,
                        src: path.clone(),
                        executable: false,
                    });
            }
            SourceSpec::Directory { path } => {
                plans[layer_of_groups(&input.groups)]
                    .entries
                    .push(PlannedEntry::Tree {
                        dest,
                        src: path.clone(),
                    });
            }
            SourceSpec::Executable { path, runfiles } => {
                let runfiles_root = format!("{}.runfiles", dest);
                for runfile in runfiles {
                    match &runfile.group {
                        Some(group) if !group_included(group) => continue,
                        _ => {}
                    }
                    let layer = runfile
                        .group
                        .as_deref()
                        .map(|g| layer_of_group(g))
                        .unwrap_or(default_layer);
                    let rel = normalize_image_path(&runfile.rel)?;
                    plans[layer].entries.push(PlannedEntry::FileFromDisk {
                        dest: format!("{}/{}", runfiles_root, rel),
                        src: runfile.src.clone(),
                        executable: false,
                    });
                }
                if input.include_executable {
                    // The executable payload itself lives in the last
                    // layer that contains any of its groups.
                    plans[layer_of_groups(&input.groups)]
                        .entries
                        .push(PlannedEntry::FileFromDisk {
                            dest,
                            src: path.clone(),
                            executable: true,
                        });
                }
            }
        }
    }

    // Symlinks and empty directories go only to the default layer so
    // they are not duplicated across layers.
    for symlink in &spec.symlinks {
        let link = normalize_image_path(&symlink.link)?;
        validate_symlink_target(&link, &symlink.target)?;
        plans[default_layer].entries.push(PlannedEntry::Symlink {
            link,
            target: symlink.target.clone(),
        });
    }
    for dir in &spec.empty_dirs {
        let dest = normalize_image_path(dir)?;
        plans[default_layer]
            .entries
            .push(PlannedEntry::EmptyDir { dest });
    }

    let mut built = Vec::with_capacity(plans.len());
    for (index, plan) in plans.iter().enumerate() {
        let layer_name = if spec.grouping == GroupingPolicy::MergeAll {
            format!("_{}_{}", index, MERGED_LAYER_ID)
        } else {
            format!("_{}_{}", index, sanitize_id(&plan.id))
        };
        logger.verbose(&format!(
            "Building layer {} ({} entries)",
            layer_name,
            plan.entries.len()
        ));
        built.push(build_one_layer(spec, plan, &layer_name, out_dir, compression, logger)?);
    }
    Ok(built)
}

fn build_one_layer(
    spec: &LayerSpec,
    plan: &LayerPlan,
    layer_name: &str,
    out_dir: &Path,
    compression: &CompressionSettings,
    logger: &Logger,
) -> Result<BuiltLayer> {
    // Stage the raw tar in a spool file, then compress it into place.
    let mut spool = tempfile::tempfile_in(out_dir)
        .map_err(|e| ImageError::Io(format!("Failed to create spool file: {}", e)))?;
    {
        let mut writer = CasTarWriter::new(BufWriter::new(&mut spool), StructureMode::Intertwined);
        if logger.verbose {
            let progress = logger.clone();
            writer.set_header_callback(
                vec![tar::EntryType::Regular, tar::EntryType::Link],
                Box::new(move |name, kind| {
                    let what = if kind == tar::EntryType::Link {
                        "hardlink"
                    } else {
                        "file"
                    };
                    progress.detail(&format!("{} {}", what, name));
                }),
            );
        }
        let mut emitted_dirs: BTreeSet<String> = BTreeSet::new();
        let mut emit_parents =
            |writer: &mut CasTarWriter<BufWriter<&mut File>>,
             emitted: &mut BTreeSet<String>,
             path: &str|
             -> Result<()> {
                let mut prefix = String::new();
                let parts: Vec<&str> = path.split('/').collect();
                for part in &parts[..parts.len().saturating_sub(1)] {
                    if !prefix.is_empty() {
                        prefix.push('/');
                    }
                    prefix.push_str(part);
                    if emitted.insert(prefix.clone()) {
                        writer.write_dir_all(&prefix)?;
                    }
                }
                Ok(())
            };

        for entry in &plan.entries {
            match entry {
                PlannedEntry::FileFromDisk {
                    dest,
                    src,
                    executable,
                } => {
                    emit_parents(&mut writer, &mut emitted_dirs, dest)?;
                    let meta = resolve_metadata(spec, dest);
                    let (header, pax) = meta.to_header(*executable)?;
                    writer.write_regular_from_path_deduplicated(header, dest, pax, src)?;
                }
                PlannedEntry::Tree { dest, src } => {
                    emit_parents(&mut writer, &mut emitted_dirs, dest)?;
                    if emitted_dirs.insert(dest.clone()) {
                        writer.write_dir_all(dest)?;
                    }
                    write_tree(&mut writer, spec, &mut emitted_dirs, src, dest)?;
                }
                PlannedEntry::Symlink { link, target } => {
                    emit_parents(&mut writer, &mut emitted_dirs, link)?;
                    let meta = resolve_metadata(spec, link);
                    let (mut header, pax) = meta.to_header(false)?;
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    writer.write_header(header, link, Some(target), pax)?;
                }
                PlannedEntry::EmptyDir { dest } => {
                    emit_parents(&mut writer, &mut emitted_dirs, dest)?;
                    if emitted_dirs.insert(dest.clone()) {
                        writer.write_dir_all(dest)?;
                    }
                }
            }
        }
        let mut sink = writer.finish()?;
        sink.flush()?;
    }
    spool.seek(SeekFrom::Start(0))?;

    let extension = match (compression.estargz, compression.algorithm) {
        (_, crate::compress::CompressionAlgorithm::Gzip) => "tar.gz",
        (_, crate::compress::CompressionAlgorithm::Zstd) => "tar.zst",
    };
    let blob_path = out_dir.join(format!("{}.{}", layer_name, extension));
    {
        let out = File::create(&blob_path)
            .map_err(|e| ImageError::Io(format!("Failed to create {}: {}", blob_path.display(), e)))?;
        let mut out = BufWriter::new(out);
        if compression.estargz {
            let level = flate2::Compression::new(compression.level.unwrap_or(6) as u32);
            crate::compress::estargz::write_estargz(&mut spool, &mut out, level)?;
        } else {
            compress(&mut spool, &mut out, compression)?;
        }
        out.flush()?;
    }

    // One pass over the result yields digest, diff-id, format and size.
    let digests = layer_digests_from_path(&blob_path)?;
    let descriptor = LayerDescriptor {
        annotations: spec.annotations.clone(),
        diff_id: digests.diff_id.to_string(),
        digest: digests.digest.to_string(),
        media_type: digests.format.media_type().to_string(),
        name: layer_name.to_string(),
        size: digests.size as i64,
    };
    descriptor.validate()?;
    Ok(BuiltLayer {
        layer_id: plan.id.clone(),
        blob_path,
        descriptor,
    })
}

fn resolve_metadata(spec: &LayerSpec, path: &str) -> FileMetadata {
    match spec.metadata.get(path) {
        Some(per_path) => per_path.merged_over(&spec.default_metadata),
        None => spec.default_metadata.clone(),
    }
}

fn write_tree(
    writer: &mut CasTarWriter<BufWriter<&mut File>>,
    spec: &LayerSpec,
    emitted_dirs: &mut BTreeSet<String>,
    src: &Path,
    dest: &str,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(src)
        .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", src.display(), e)))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let child_dest = format!("{}/{}", dest, name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if emitted_dirs.insert(child_dest.clone()) {
                writer.write_dir_all(&child_dest)?;
            }
            write_tree(writer, spec, emitted_dirs, &entry.path(), &child_dest)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let meta = resolve_metadata(spec, &child_dest);
            let (mut header, pax) = meta.to_header(false)?;
            header.set_entry_type(tar::EntryType::Symlink);
            writer.write_header(header, &child_dest, Some(&target.to_string_lossy()), pax)?;
        } else {
            let meta = resolve_metadata(spec, &child_dest);
            let executable = {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    entry.metadata()?.permissions().mode() & 0o111 != 0
                }
                #[cfg(not(unix))]
                {
                    false
                }
            };
            let (header, pax) = meta.to_header(executable)?;
            writer.write_regular_from_path_deduplicated(header, &child_dest, pax, &entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressionAlgorithm;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    fn settings() -> CompressionSettings {
        CompressionSettings {
            algorithm: CompressionAlgorithm::Gzip,
            level: Some(6),
            jobs: 1,
            estargz: false,
        }
    }

    fn read_layer_entries(path: &Path) -> Vec<(String, tar::EntryType, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let mut decompressed = Vec::new();
        MultiGzDecoder::new(file)
            .read_to_end(&mut decompressed)
            .unwrap();
        let mut archive = tar::Archive::new(&decompressed[..]);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().to_string();
                let kind = e.header().entry_type();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (name, kind, data)
            })
            .collect()
    }

    fn spec_with_inputs(inputs: Vec<InputSpec>) -> LayerSpec {
        LayerSpec {
            name: "test".to_string(),
            inputs,
            default_metadata: FileMetadata::default(),
            metadata: BTreeMap::new(),
            symlinks: Vec::new(),
            empty_dirs: Vec::new(),
            annotations: BTreeMap::new(),
            grouping: GroupingPolicy::LayerPerGroup,
            layer_ids: None,
            include_groups: Vec::new(),
            exclude_groups: Vec::new(),
            layer_for_group: BTreeMap::new(),
        }
    }

    fn file_input(dest: &str, src: &Path, groups: &[&str]) -> InputSpec {
        InputSpec {
            dest: dest.to_string(),
            source: SourceSpec::File {
                path: src.to_path_buf(),
            },
            groups: groups.iter().map(|s| s.to_string()).collect(),
            include_executable: true,
        }
    }

    #[test]
    fn test_groups_split_into_ranked_layers() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("srv"), b"#!binary").unwrap();
        std::fs::write(dir.path().join("conf"), b"key=value").unwrap();
        std::fs::write(dir.path().join("lib.py"), b"import os").unwrap();

        let spec = spec_with_inputs(vec![
            InputSpec {
                dest: "usr/bin/srv".to_string(),
                source: SourceSpec::Executable {
                    path: dir.path().join("srv"),
                    runfiles: vec![RunfileSpec {
                        rel: "lib/lib.py".to_string(),
                        src: dir.path().join("lib.py"),
                        group: Some("foundational".to_string()),
                    }],
                },
                groups: vec!["foundational".to_string(), "same-party".to_string()],
                include_executable: true,
            },
            file_input("etc/conf", &dir.path().join("conf"), &[]),
        ]);

        let logger = Logger::new_quiet();
        let layers = build_layers(&spec, out.path(), &settings(), &logger).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].descriptor.name, "_0_foundational");
        assert_eq!(layers[1].descriptor.name, "_1_same_party");

        let first: Vec<String> = read_layer_entries(&layers[0].blob_path)
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();
        assert!(first.iter().any(|n| n.ends_with("lib.py")));
        assert!(!first.iter().any(|n| n.ends_with("srv") && !n.ends_with('/')));

        let second: Vec<String> = read_layer_entries(&layers[1].blob_path)
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();
        // Executable payload and ungrouped config land in the last layer.
        assert!(second.contains(&"usr/bin/srv".to_string()));
        assert!(second.contains(&"etc/conf".to_string()));
    }

    #[test]
    fn test_identical_files_become_hardlinks() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"same payload").unwrap();
        std::fs::write(dir.path().join("b"), b"same payload").unwrap();

        let spec = spec_with_inputs(vec![
            file_input("data/a", &dir.path().join("a"), &[]),
            file_input("data/b", &dir.path().join("b"), &[]),
        ]);
        let logger = Logger::new_quiet();
        let layers = build_layers(&spec, out.path(), &settings(), &logger).unwrap();
        assert_eq!(layers.len(), 1);

        let entries = read_layer_entries(&layers[0].blob_path);
        let kinds: BTreeMap<String, tar::EntryType> = entries
            .iter()
            .map(|(n, k, _)| (n.clone(), *k))
            .collect();
        assert_eq!(kinds["data/a"], tar::EntryType::Regular);
        assert_eq!(kinds["data/b"], tar::EntryType::Link);
    }

    #[test]
    fn test_layer_tar_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f1"), b"one").unwrap();
        std::fs::write(dir.path().join("f2"), b"two").unwrap();

        let mut spec = spec_with_inputs(vec![
            file_input("usr/share/doc/readme", &dir.path().join("f1"), &[]),
            file_input("usr/bin/tool", &dir.path().join("f2"), &[]),
        ]);
        spec.symlinks.push(SymlinkSpec {
            link: "usr/bin/alias".to_string(),
            target: "tool".to_string(),
        });
        spec.empty_dirs.push("var/log".to_string());

        let logger = Logger::new_quiet();
        let layers = build_layers(&spec, out.path(), &settings(), &logger).unwrap();
        let entries = read_layer_entries(&layers[0].blob_path);
        let names: Vec<&String> = entries.iter().map(|(n, _, _)| n).collect();

        // No duplicate names.
        let unique: BTreeSet<&String> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());

        for (name, kind, _) in &entries {
            // No absolute or dot components.
            assert!(!name.starts_with('/'));
            assert!(!name.split('/').any(|p| p == "." || p == ".."));
            // Directory entries end with a slash, others never do.
            if *kind == tar::EntryType::Directory {
                assert!(name.ends_with('/'), "dir without slash: {}", name);
            } else {
                assert!(!name.ends_with('/'), "non-dir with slash: {}", name);
            }
        }

        // Directories precede their children.
        let mut seen_dirs: BTreeSet<String> = BTreeSet::new();
        for (name, kind, _) in &entries {
            if let Some(parent) = name.trim_end_matches('/').rsplit_once('/').map(|x| x.0) {
                assert!(
                    seen_dirs.contains(parent),
                    "child {} precedes its directory",
                    name
                );
            }
            if *kind == tar::EntryType::Directory {
                seen_dirs.insert(name.trim_end_matches('/').to_string());
            }
        }
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"stable").unwrap();
        let spec = spec_with_inputs(vec![file_input("opt/f", &dir.path().join("f"), &[])]);
        let logger = Logger::new_quiet();

        let out_a = tempfile::tempdir().unwrap();
        let out_b = tempfile::tempdir().unwrap();
        let first = build_layers(&spec, out_a.path(), &settings(), &logger).unwrap();
        let second = build_layers(&spec, out_b.path(), &settings(), &logger).unwrap();
        assert_eq!(
            std::fs::read(&first[0].blob_path).unwrap(),
            std::fs::read(&second[0].blob_path).unwrap()
        );
        assert_eq!(first[0].descriptor, second[0].descriptor);
    }

    #[test]
    fn test_include_exclude_conflict() {
        let mut spec = spec_with_inputs(vec![]);
        spec.include_groups.push("a".to_string());
        spec.exclude_groups.push("b".to_string());
        let logger = Logger::new_quiet();
        let out = tempfile::tempdir().unwrap();
        assert!(build_layers(&spec, out.path(), &settings(), &logger).is_err());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        assert!(normalize_image_path("/etc/passwd").is_err());
        assert!(normalize_image_path("../outside").is_err());
        assert!(normalize_image_path("a/../../b").is_err());
        assert_eq!(normalize_image_path("a//b/").unwrap(), "a/b");

        assert!(validate_symlink_target("bin/x", "../../escape").is_err());
        assert!(validate_symlink_target("bin/x", "../lib/ok").is_ok());
        assert!(validate_symlink_target("bin/x", "/usr/lib/abs").is_ok());
    }

    #[test]
    fn test_layer_for_group_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let mut spec = spec_with_inputs(vec![file_input(
            "f",
            &dir.path().join("f"),
            &["tools"],
        )]);
        spec.layer_ids = Some(vec!["app".to_string()]);
        spec.layer_for_group
            .insert("tools".to_string(), "missing".to_string());
        let logger = Logger::new_quiet();
        let out = tempfile::tempdir().unwrap();
        let err = build_layers(&spec, out.path(), &settings(), &logger).unwrap_err();
        assert!(err.to_string().contains("unknown layer id"));
    }

    #[test]
    fn test_merge_all_single_layer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let mut spec = spec_with_inputs(vec![
            file_input("a", &dir.path().join("f"), &["g1"]),
            file_input("b", &dir.path().join("f"), &["g2"]),
        ]);
        spec.grouping = GroupingPolicy::MergeAll;
        let logger = Logger::new_quiet();
        let out = tempfile::tempdir().unwrap();
        let layers = build_layers(&spec, out.path(), &settings(), &logger).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].descriptor.name, "_0_merged");
    }

    #[test]
    fn test_descriptor_digests_verify() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"content for digesting").unwrap();
        let spec = spec_with_inputs(vec![file_input("f", &dir.path().join("f"), &[])]);
        let logger = Logger::new_quiet();
        let out = tempfile::tempdir().unwrap();
        let layers = build_layers(&spec, out.path(), &settings(), &logger).unwrap();
        let descriptor = &layers[0].descriptor;

        let blob = std::fs::read(&layers[0].blob_path).unwrap();
        assert_eq!(
            crate::digest::Digest::parse(&descriptor.digest).unwrap(),
            crate::digest::Digest::sha256(&blob)
        );
        assert_eq!(descriptor.size, blob.len() as i64);
        assert_eq!(descriptor.media_type, crate::oci::MEDIA_TYPE_LAYER_GZIP);
        assert_ne!(descriptor.diff_id, descriptor.digest);
    }
}
