//! Runfiles dispatch mode
//!
//! When the binary sits inside a runfiles tree that carries a
//! `dispatch.json`, the file names the command and its payload, so
//! build actions can materialize self-contained, re-runnable push and
//! load wrappers that need no command line at all.

use crate::cli::args::{self, Args, Commands};
use crate::error::{ImageError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct DispatchFile {
    command: String,
    #[serde(flatten)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    registry: String,
    repository: String,
    metadata: PathBuf,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    tag_file: Option<PathBuf>,
    #[serde(default)]
    stamp_info_files: Vec<PathBuf>,
    #[serde(default = "default_storage_dir")]
    storage_dir: PathBuf,
    #[serde(default)]
    airgapped: bool,
}

#[derive(Debug, Deserialize)]
struct LoadPayload {
    metadata: PathBuf,
    #[serde(default = "default_target")]
    target: String,
    #[serde(default)]
    platform: Option<String>,
    references: Vec<String>,
    #[serde(default = "default_storage_dir")]
    storage_dir: PathBuf,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".image-cache")
}

fn default_target() -> String {
    "auto".to_string()
}

/// Resolve a payload path against the dispatch file's directory so
/// wrappers run from anywhere
fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path
    }
}

/// Translate a dispatch file into the equivalent parsed command
pub fn parse_dispatch_file(path: &Path) -> Result<Args> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
    let dispatch: DispatchFile = serde_json::from_str(&contents)
        .map_err(|e| ImageError::Parse(format!("Malformed dispatch.json: {}", e)))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let command = match dispatch.command.as_str() {
        "push" => {
            let payload: PushPayload = serde_json::from_value(dispatch.payload)
                .map_err(|e| ImageError::Parse(format!("Malformed push dispatch: {}", e)))?;
            Commands::Push(args::PushArgs {
                registry: payload.registry,
                repository: payload.repository,
                metadata: resolve(base, payload.metadata),
                tags: payload.tags,
                tag_file: payload.tag_file.map(|p| resolve(base, p)),
                stamp_info_files: payload
                    .stamp_info_files
                    .into_iter()
                    .map(|p| resolve(base, p))
                    .collect(),
                storage_dir: resolve(base, payload.storage_dir),
                airgapped: payload.airgapped,
                verbose: false,
            })
        }
        "load" => {
            let payload: LoadPayload = serde_json::from_value(dispatch.payload)
                .map_err(|e| ImageError::Parse(format!("Malformed load dispatch: {}", e)))?;
            Commands::Load(args::LoadArgs {
                metadata: resolve(base, payload.metadata),
                target: payload.target,
                platform: payload.platform,
                references: payload.references,
                storage_dir: resolve(base, payload.storage_dir),
                verbose: false,
            })
        }
        other => {
            return Err(ImageError::Validation(format!(
                "dispatch.json names unsupported command: {}",
                other
            )));
        }
    };
    Ok(Args {
        command: Some(command),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        std::fs::write(
            &path,
            r#"{
                "command": "push",
                "registry": "https://registry.example.com",
                "repository": "team/app",
                "metadata": "deploy.json",
                "tags": ["latest"]
            }"#,
        )
        .unwrap();
        let args = parse_dispatch_file(&path).unwrap();
        match args.command {
            Some(Commands::Push(push)) => {
                assert_eq!(push.registry, "https://registry.example.com");
                assert_eq!(push.repository, "team/app");
                // Relative paths resolve against the dispatch directory.
                assert_eq!(push.metadata, dir.path().join("deploy.json"));
                assert_eq!(push.tags, vec!["latest"]);
            }
            _ => panic!("expected push command"),
        }
    }

    #[test]
    fn test_load_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        std::fs::write(
            &path,
            r#"{
                "command": "load",
                "metadata": "/abs/deploy.json",
                "references": ["example.com/app:dev"],
                "target": "docker"
            }"#,
        )
        .unwrap();
        let args = parse_dispatch_file(&path).unwrap();
        match args.command {
            Some(Commands::Load(load)) => {
                assert_eq!(load.metadata, PathBuf::from("/abs/deploy.json"));
                assert_eq!(load.target, "docker");
                assert_eq!(load.references, vec!["example.com/app:dev"]);
            }
            _ => panic!("expected load command"),
        }
    }

    #[test]
    fn test_unknown_dispatch_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        std::fs::write(&path, r#"{"command": "explode"}"#).unwrap();
        assert!(parse_dispatch_file(&path).is_err());
    }
}
