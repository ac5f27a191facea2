use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;

use crate::error::{DispatchError, FilingError};
use crate::filer::{Destination, Filing, Relocation};
use crate::scheduler::{Sample, TaskHandle};

/// Per-batch output directories next to the batch folder:
/// `<batch>_processed`, `<batch>_json` and `<batch>_failed`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    processed_dir: PathBuf,
    json_dir: PathBuf,
    failed_dir: PathBuf,
}

impl DirectoryStore {
    pub fn for_batch(base_dir: &Path, batch: &str) -> Self {
        Self {
            processed_dir: base_dir.join(format!("{batch}_processed")),
            json_dir: base_dir.join(format!("{batch}_json")),
            failed_dir: base_dir.join(format!("{batch}_failed")),
        }
    }

    /// Create the output directories if missing.
    pub async fn prepare(&self) -> Result<(), DispatchError> {
        for dir in [&self.processed_dir, &self.json_dir, &self.failed_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| DispatchError::OutputDir {
                    path: dir.clone(),
                    source,
                })?;
            tracing::debug!(dir = %dir.display(), "Output directory ready");
        }
        Ok(())
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    pub fn json_dir(&self) -> &Path {
        &self.json_dir
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed_dir
    }

    fn target(&self, sample: &Sample, dest: &Destination) -> PathBuf {
        let name = sample.name();
        let ts = timestamp();
        match dest {
            Destination::Processed { handle } => self
                .processed_dir
                .join(format!("task_{handle}_{name}_{ts}")),
            Destination::Failed { kind } => self
                .failed_dir
                .join(format!("failed_{}_{name}_{ts}", kind.tag())),
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Rename, falling back to copy + delete across filesystems. A failed copy
/// leaves no partial file behind, and if the source cannot be deleted after
/// copying, the copy is removed again so the sample exists in exactly one place.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    let rename_err = match tokio::fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if tokio::fs::try_exists(to).await? {
        return Err(rename_err);
    }
    if let Err(e) = tokio::fs::copy(from, to).await {
        let _ = tokio::fs::remove_file(to).await;
        tracing::debug!(from = %from.display(), error = %e, "Copy fallback failed");
        return Err(rename_err);
    }
    if let Err(e) = tokio::fs::remove_file(from).await {
        let _ = tokio::fs::remove_file(to).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl Filing for DirectoryStore {
    async fn relocate(&self, sample: &Sample, dest: &Destination) -> Result<Relocation, FilingError> {
        let to = self.target(sample, dest);
        match tokio::fs::try_exists(&sample.path).await {
            Ok(true) => {}
            Ok(false) => return Ok(Relocation::AlreadyAbsent),
            Err(source) => {
                return Err(FilingError::Relocate {
                    from: sample.path.clone(),
                    to,
                    source,
                })
            }
        }
        move_file(&sample.path, &to)
            .await
            .map_err(|source| FilingError::Relocate {
                from: sample.path.clone(),
                to: to.clone(),
                source,
            })?;
        Ok(Relocation::Moved(to))
    }

    async fn persist_artifact(
        &self,
        sample: &Sample,
        handle: &TaskHandle,
        bytes: &[u8],
    ) -> Result<PathBuf, FilingError> {
        let path = self
            .json_dir
            .join(format!("task_{handle}_{}_{}.json", sample.name(), timestamp()));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| FilingError::Persist {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}
