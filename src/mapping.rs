//! Fingerprint → defect image lookup table.
//!
//! The Mapping Builder walks (reference, defect) directory pairs, fingerprints
//! every reference file and records the path of the defect image that shares
//! its base name. The resulting [`FingerprintMap`] is written as a flat,
//! pretty-printed JSON object and loaded read-only by the service at startup.
//!
//! # Matching
//!
//! For a reference file `<base>.<ext>`, candidates are tried in
//! [`DEFECT_EXTENSIONS`] order inside the defect directory; the first one that
//! exists wins. Reference files without any candidate are skipped and counted
//! in the [`BuildReport`].
//!
//! # Collisions
//!
//! Pairs are merged in the order given, so when two reference files share a
//! fingerprint the entry from the later pair is kept.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::fingerprint::{fingerprint_file, is_fingerprint};

/// Defect image extensions, in order of preference.
pub const DEFECT_EXTENSIONS: [&str; 2] = [".jpg", ".png"];

/// Fingerprint → file path.
///
/// A `BTreeMap` keeps the serialized table sorted and diff-friendly.
pub type FingerprintMap = BTreeMap<String, String>;

/// One `--pairs REF_DIR DEF_DIR` entry.
#[derive(Debug, Clone)]
pub struct DirPair {
    pub reference: PathBuf,
    pub defect: PathBuf,
}

impl DirPair {
    pub fn new(reference: impl Into<PathBuf>, defect: impl Into<PathBuf>) -> Self {
        Self {
            reference: reference.into(),
            defect: defect.into(),
        }
    }
}

/// Counters collected while building a mapping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Regular files seen in reference directories.
    pub scanned: usize,
    /// Reference files that had a matching defect image.
    pub matched: usize,
    /// Reference files with no defect image under any accepted extension.
    pub skipped: usize,
    /// Matches that replaced an entry already in the table.
    pub overwritten: usize,
}

/// Scan a single pair and return its partial mapping.
///
/// Only regular files directly inside `ref_dir` are considered; symlinks
/// count when they point at one. Files are visited in file-name order.
/// `ref_dir` must be an existing directory.
pub fn collect_mapping(
    ref_dir: &Path,
    def_dir: &Path,
    report: &mut BuildReport,
) -> Result<FingerprintMap> {
    let meta = std::fs::metadata(ref_dir)
        .with_context(|| format!("Failed to read reference directory: {}", ref_dir.display()))?;
    if !meta.is_dir() {
        bail!("Reference directory is not a directory: {}", ref_dir.display());
    }

    let mut mapping = FingerprintMap::new();

    let walker = WalkDir::new(ref_dir)
        .follow_links(true)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Dangling links inside the directory are skipped.
            Err(e) if e.depth() > 0 => {
                tracing::warn!(
                    path = ?e.path(),
                    error = %e,
                    "unreadable reference entry, skipping"
                );
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read reference directory: {}", ref_dir.display())
                })
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        report.scanned += 1;

        let ref_path = entry.path();
        let Some(defect_path) = find_defect_image(ref_path, def_dir) else {
            report.skipped += 1;
            tracing::debug!(
                reference = %ref_path.display(),
                defect_dir = %def_dir.display(),
                "no defect image for reference file, skipping"
            );
            continue;
        };

        let fp = fingerprint_file(ref_path)?;
        if mapping
            .insert(fp, defect_path.to_string_lossy().to_string())
            .is_some()
        {
            report.overwritten += 1;
        }
        report.matched += 1;
    }

    Ok(mapping)
}

/// Returns the first existing `def_dir/<base><ext>` for the reference file.
fn find_defect_image(ref_path: &Path, def_dir: &Path) -> Option<PathBuf> {
    let base = ref_path.file_stem()?.to_string_lossy();
    DEFECT_EXTENSIONS
        .iter()
        .map(|ext| def_dir.join(format!("{}{}", base, ext)))
        .find(|candidate| candidate.exists())
}

/// Build the full mapping from every pair, later pairs overwriting earlier ones.
pub fn build_mapping(pairs: &[DirPair]) -> Result<(FingerprintMap, BuildReport)> {
    let mut report = BuildReport::default();
    let mut result = FingerprintMap::new();

    for pair in pairs {
        tracing::info!(
            reference = %pair.reference.display(),
            defect = %pair.defect.display(),
            "scanning pair"
        );
        let partial = collect_mapping(&pair.reference, &pair.defect, &mut report)?;
        for (fp, path) in partial {
            if result.insert(fp, path).is_some() {
                report.overwritten += 1;
            }
        }
    }

    Ok((result, report))
}

/// Serialize the mapping as pretty-printed JSON, creating parent directories.
pub fn write_mapping(path: &Path, mapping: &FingerprintMap) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }
    }

    let json = serde_json::to_string_pretty(mapping)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write mapping file: {}", path.display()))?;
    Ok(())
}

/// Load a mapping file written by [`write_mapping`].
///
/// Missing or malformed files are errors; the service refuses to start
/// without a valid table.
pub fn load_mapping(path: &Path) -> Result<FingerprintMap> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mapping file: {}", path.display()))?;
    let mapping: FingerprintMap = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse mapping file: {}", path.display()))?;

    let odd_keys = mapping.keys().filter(|k| !is_fingerprint(k)).count();
    if odd_keys > 0 {
        tracing::warn!(
            path = %path.display(),
            count = odd_keys,
            "mapping contains keys that are not md5 hex digests; they will never match"
        );
    }

    Ok(mapping)
}

/// CLI entry point for `defectgen map`.
pub fn run_build(output: &Path, pairs: &[DirPair]) -> Result<()> {
    let (mapping, report) = build_mapping(pairs)?;
    write_mapping(output, &mapping)?;

    if report.skipped > 0 {
        tracing::warn!(
            skipped = report.skipped,
            "reference files without a matching defect image were left out"
        );
    }

    println!(
        "Wrote {} entries to {} (scanned: {}, skipped: {})",
        mapping.len(),
        output.display(),
        report.scanned,
        report.skipped
    );
    Ok(())
}
