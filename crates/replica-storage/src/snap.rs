//! # snap
//!
//! why: keep point-in-time application images on disk so the log prefix can be discarded
//! relations: implements SnapshotStore; loaded once at startup by replica-node before log replay
//! what: FileSnapshotStore with one file per (index, term) and bounded retention

use std::fs;
use std::path::{Path, PathBuf};

use replica_core::Snapshot;
use tracing::{debug, info, warn};

use crate::fs_util::{atomic_write, sync_dir};
use crate::{SnapshotStore, StorageError, StorageResult};

const SNAP_SUFFIX: &str = ".snap";

/// file-based snapshot store
///
/// one json file per snapshot named `<index>-<term>.snap` in fixed-width hex,
/// so lexical order is index order
pub struct FileSnapshotStore {
    dir: PathBuf,
    /// files kept after a save
    retain: usize,
    latest_index: Option<u64>,
}

impl FileSnapshotStore {
    /// open the store at the given directory, keeping at most `retain` snapshots
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = %path.display(), "removing leftover snapshot temp file");
                fs::remove_file(&path)?;
            }
        }

        let latest_index = list(&dir)?
            .last()
            .and_then(|name| parse_name(name))
            .map(|(index, _)| index);

        Ok(Self {
            dir,
            retain: retain.max(1),
            latest_index,
        })
    }

    fn purge(&self) -> StorageResult<()> {
        let names = list(&self.dir)?;
        if names.len() <= self.retain {
            return Ok(());
        }
        for name in &names[..names.len() - self.retain] {
            debug!(snapshot = %name, "purging old snapshot");
            fs::remove_file(self.dir.join(name))?;
        }
        sync_dir(&self.dir)?;
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        if let Some(latest) = self.latest_index {
            if snapshot.index < latest {
                return Err(StorageError::SnapshotRegression {
                    latest,
                    attempted: snapshot.index,
                });
            }
        }

        let json = serde_json::to_vec(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        atomic_write(&self.dir, &file_name(snapshot.index, snapshot.term), &json)?;
        self.latest_index = Some(snapshot.index);
        info!(
            index = snapshot.index,
            term = snapshot.term,
            bytes = json.len(),
            "saved snapshot"
        );

        if let Err(e) = self.purge() {
            // the new snapshot is durable; stale files are only wasted space
            warn!(error = %e, "failed to purge old snapshots");
        }
        Ok(())
    }

    fn load_latest(&self) -> StorageResult<Option<Snapshot>> {
        let Some(name) = list(&self.dir)?.pop() else {
            return Ok(None);
        };
        let path = self.dir.join(&name);
        let bytes = fs::read(&path)?;
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::corrupt(&path, 1, e))?;

        if parse_name(&name) != Some((snapshot.index, snapshot.term)) {
            return Err(StorageError::corrupt(
                &path,
                1,
                format!(
                    "file name does not match snapshot {}-{}",
                    snapshot.index, snapshot.term
                ),
            ));
        }
        Ok(Some(snapshot))
    }
}

fn file_name(index: u64, term: u64) -> String {
    format!("{index:016x}-{term:016x}{SNAP_SUFFIX}")
}

fn parse_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(SNAP_SUFFIX)?;
    let (index, term) = stem.split_once('-')?;
    Some((
        u64::from_str_radix(index, 16).ok()?,
        u64::from_str_radix(term, 16).ok()?,
    ))
}

/// snapshot file names, oldest first
fn list(dir: &Path) -> StorageResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if parse_name(&name).is_some() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
