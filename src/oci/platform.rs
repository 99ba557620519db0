//! Platform selection for multi-platform base images
//!
//! A wanted `(os, architecture, variant)` expands into an ordered
//! preference vector; a base index is matched by taking the first
//! manifest that matches a vector entry exactly. ARM64 entries with no
//! variant are treated as v8 on both sides of the comparison.

use crate::error::{ImageError, Result};
use crate::oci::{ImageIndex, OciDescriptor, Platform};

/// Host platform with the architecture names registries use
pub fn host_platform() -> Platform {
    let architecture = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    };
    Platform::new(std::env::consts::OS, architecture, None)
}

/// Ordered list of variants to try for a wanted platform, most specific
/// first. The empty string means "no variant".
fn variant_vector(architecture: &str, variant: &str) -> Vec<String> {
    match architecture {
        "amd64" => {
            let mut out = Vec::new();
            if let Some(n) = parse_simple_variant(variant) {
                for v in (1..=n).rev() {
                    out.push(format!("v{}", v));
                }
            } else if !variant.is_empty() {
                out.push(variant.to_string());
            }
            out.push(String::new());
            out
        }
        "arm" => {
            let mut out = Vec::new();
            if let Some(n) = parse_simple_variant(variant) {
                for v in (5..=n).rev() {
                    out.push(format!("v{}", v));
                }
            } else if !variant.is_empty() {
                out.push(variant.to_string());
            } else {
                out.push(String::new());
            }
            out
        }
        "arm64" => {
            // Bare arm64 is normalized to v8.
            let variant = if variant.is_empty() { "v8" } else { variant };
            let mut out = Vec::new();
            match parse_dotted_variant(variant) {
                Some((8, minor)) => {
                    for m in (1..=minor).rev() {
                        out.push(format!("v8.{}", m));
                    }
                    out.push("v8".to_string());
                }
                Some((9, minor)) => {
                    for m in (1..=minor).rev() {
                        out.push(format!("v9.{}", m));
                    }
                    out.push("v9".to_string());
                    out.push("v8".to_string());
                }
                _ => out.push(variant.to_string()),
            }
            out
        }
        _ => vec![variant.to_string()],
    }
}

/// "v3" → 3
fn parse_simple_variant(variant: &str) -> Option<u32> {
    variant.strip_prefix('v')?.parse().ok()
}

/// "v8.2" → (8, 2); "v9" → (9, 0)
fn parse_dotted_variant(variant: &str) -> Option<(u32, u32)> {
    let rest = variant.strip_prefix('v')?;
    match rest.split_once('.') {
        Some((major, minor)) => Some((major.parse().ok()?, minor.parse().ok()?)),
        None => Some((rest.parse().ok()?, 0)),
    }
}

fn normalized_variant(platform: &Platform) -> String {
    let variant = platform.variant.clone().unwrap_or_default();
    if platform.architecture == "arm64" && variant.is_empty() {
        "v8".to_string()
    } else {
        variant
    }
}

/// The full preference vector for a wanted platform
pub fn platform_vector(wanted: &Platform) -> Vec<Platform> {
    let variant = normalized_variant(wanted);
    variant_vector(&wanted.architecture, &variant)
        .into_iter()
        .map(|v| {
            Platform::new(
                &wanted.os,
                &wanted.architecture,
                if v.is_empty() { None } else { Some(&v) },
            )
        })
        .collect()
}

fn matches(candidate: &Platform, target: &Platform) -> bool {
    candidate.os == target.os
        && candidate.architecture == target.architecture
        && normalized_variant(candidate) == normalized_variant(target)
}

/// Select the index manifest for a wanted platform, walking the
/// preference vector. A missing match is fatal and names the triple.
pub fn select_manifest<'a>(index: &'a ImageIndex, wanted: &Platform) -> Result<&'a OciDescriptor> {
    for target in platform_vector(wanted) {
        for descriptor in &index.manifests {
            if let Some(platform) = &descriptor.platform {
                if matches(platform, &target) {
                    return Ok(descriptor);
                }
            }
        }
    }
    let mut message = format!(
        "no matching base image found for os={} architecture={}",
        wanted.os, wanted.architecture
    );
    if let Some(v) = &wanted.variant {
        message.push_str(&format!(" variant={}", v));
    }
    Err(ImageError::Validation(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn descriptor(os: &str, arch: &str, variant: Option<&str>) -> OciDescriptor {
        OciDescriptor {
            media_type: crate::oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: format!(
                "sha256:{:064x}",
                (os.len() * 1000 + arch.len() * 10 + variant.map(|v| v.len()).unwrap_or(0)) as u64
            ),
            size: 1,
            platform: Some(Platform::new(os, arch, variant)),
            annotations: None,
        }
    }

    fn index(entries: Vec<OciDescriptor>) -> ImageIndex {
        ImageIndex {
            schema_version: 2,
            media_type: Some(crate::oci::MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: entries,
            annotations: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_amd64_exact_match() {
        let idx = index(vec![
            descriptor("linux", "amd64", Some("v2")),
            descriptor("linux", "amd64", Some("v3")),
            descriptor("linux", "arm64", Some("v8")),
        ]);
        let selected =
            select_manifest(&idx, &Platform::new("linux", "amd64", Some("v3"))).unwrap();
        assert_eq!(
            selected.platform.as_ref().unwrap().variant.as_deref(),
            Some("v3")
        );
    }

    #[test]
    fn test_amd64_fallback_vector() {
        // v4 is absent: fall back to v3.
        let idx = index(vec![
            descriptor("linux", "amd64", Some("v2")),
            descriptor("linux", "amd64", Some("v3")),
        ]);
        let selected =
            select_manifest(&idx, &Platform::new("linux", "amd64", Some("v4"))).unwrap();
        assert_eq!(
            selected.platform.as_ref().unwrap().variant.as_deref(),
            Some("v3")
        );

        // Only v2 present.
        let idx = index(vec![descriptor("linux", "amd64", Some("v2"))]);
        let selected =
            select_manifest(&idx, &Platform::new("linux", "amd64", Some("v4"))).unwrap();
        assert_eq!(
            selected.platform.as_ref().unwrap().variant.as_deref(),
            Some("v2")
        );

        // Only the no-variant entry present.
        let idx = index(vec![descriptor("linux", "amd64", None)]);
        let selected =
            select_manifest(&idx, &Platform::new("linux", "amd64", Some("v4"))).unwrap();
        assert!(selected.platform.as_ref().unwrap().variant.is_none());
    }

    #[test]
    fn test_arm64_bare_normalizes_to_v8() {
        let idx = index(vec![descriptor("linux", "arm64", Some("v8"))]);
        assert!(select_manifest(&idx, &Platform::new("linux", "arm64", None)).is_ok());

        let idx = index(vec![descriptor("linux", "arm64", None)]);
        assert!(select_manifest(&idx, &Platform::new("linux", "arm64", Some("v8"))).is_ok());
    }

    #[test]
    fn test_arm64_v9_falls_through_to_v8() {
        let idx = index(vec![descriptor("linux", "arm64", Some("v8"))]);
        let selected =
            select_manifest(&idx, &Platform::new("linux", "arm64", Some("v9.2"))).unwrap();
        assert_eq!(
            selected.platform.as_ref().unwrap().variant.as_deref(),
            Some("v8")
        );
    }

    #[test]
    fn test_arm_falls_back_to_v5_only() {
        let vector = platform_vector(&Platform::new("linux", "arm", Some("v7")));
        let variants: Vec<Option<&str>> =
            vector.iter().map(|p| p.variant.as_deref()).collect();
        assert_eq!(variants, vec![Some("v7"), Some("v6"), Some("v5")]);
    }

    #[test]
    fn test_no_match_names_triple() {
        let idx = index(vec![descriptor("linux", "amd64", Some("v2"))]);
        let err = select_manifest(&idx, &Platform::new("linux", "riscv64", None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: no matching base image found for os=linux architecture=riscv64"
        );
    }

    #[test]
    fn test_other_architectures_exact_only() {
        let idx = index(vec![descriptor("linux", "s390x", None)]);
        assert!(select_manifest(&idx, &Platform::new("linux", "s390x", None)).is_ok());
        assert!(select_manifest(&idx, &Platform::new("linux", "s390x", Some("z14"))).is_err());
    }
}
