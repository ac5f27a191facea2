//! Work source: batch folders and the samples inside them.

use std::path::{Path, PathBuf};

use crate::scheduler::Sample;

/// A folder of samples processed as one unit of scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub name: String,
    pub path: PathBuf,
}

/// Folders named `<Prefix>_<digits>` directly under `base_dir` whose prefix
/// matches one of `prefixes` (case-insensitive), sorted by name.
pub fn discover_batches(base_dir: &Path, prefixes: &[String]) -> std::io::Result<Vec<Batch>> {
    let mut batches = Vec::new();
    for entry in std::fs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if matches_prefix(&name, prefixes) {
            batches.push(Batch {
                name,
                path: entry.path(),
            });
        }
    }
    batches.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::info!(
        batches = ?batches.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
        "Discovered batch folders"
    );
    Ok(batches)
}

fn matches_prefix(name: &str, prefixes: &[String]) -> bool {
    let mut parts = name.split('_');
    let (Some(prefix), Some(index), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    prefixes.iter().any(|p| p.eq_ignore_ascii_case(prefix))
}

/// Regular files in `folder` with one of `extensions` (case-insensitive),
/// sorted by path. A missing folder yields no samples.
pub fn samples(folder: &Path, extensions: &[String]) -> std::io::Result<Vec<Sample>> {
    if !folder.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let wanted = path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy();
                extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
            })
            .unwrap_or(false);
        if wanted {
            found.push(path);
        }
    }
    found.sort();
    tracing::info!(count = found.len(), folder = %folder.display(), "Found samples");
    Ok(found.into_iter().map(Sample::new).collect())
}
