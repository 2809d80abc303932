//! Recovery-marker discipline (component H): at most one zero-byte marker
//! file `.recovery_marker.<peer_uuid>_<db_uuid>` may exist in the log
//! directory. Its presence at startup means a previous bulk-recover run did
//! not finish; more than one is a fatal inconsistency. Grounded on
//! `examples/original_source/src/raft_server_backend_rocksdb.c`'s marker
//! handling, re-expressed without a hand-rolled regex engine — the pattern
//! is simple enough to parse with `str::strip_prefix`/`split('_')`.

use std::fs;
use std::path::Path;

use uuid::Uuid;

use crate::error::{LogError, Result};

const MARKER_PREFIX: &str = ".recovery_marker.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryMarker {
    pub peer_uuid: Uuid,
    pub db_uuid: Uuid,
}

impl RecoveryMarker {
    fn filename(&self) -> String {
        format!("{MARKER_PREFIX}{}_{}", self.peer_uuid, self.db_uuid)
    }

    fn parse(name: &str) -> Option<RecoveryMarker> {
        let rest = name.strip_prefix(MARKER_PREFIX)?;
        let (peer, db) = rest.split_once('_')?;
        Some(RecoveryMarker {
            peer_uuid: Uuid::parse_str(peer).ok()?,
            db_uuid: Uuid::parse_str(db).ok()?,
        })
    }
}

/// Scans `dir` for a recovery marker. `Ok(None)` means a normal open;
/// `Ok(Some(_))` means the caller should resume bulk recovery from stage 3.
/// More than one marker file is fatal (`LogError::MultipleMarkers`).
pub fn scan_marker(dir: &Path) -> Result<Option<RecoveryMarker>> {
    let mut found = None;
    if !dir.exists() {
        return Ok(None);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(marker) = RecoveryMarker::parse(name) {
            if found.is_some() {
                return Err(LogError::MultipleMarkers);
            }
            found = Some(marker);
        }
    }
    Ok(found)
}

pub fn write_marker(dir: &Path, marker: &RecoveryMarker) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::File::create(dir.join(marker.filename()))?;
    Ok(())
}

pub fn delete_marker(dir: &Path, marker: &RecoveryMarker) -> Result<()> {
    let path = dir.join(marker.filename());
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Outcome of stages 1–2 of `bulk_recover` (spec §4.D); stage 3's file-level
/// transfer from a peer's checkpoint is an external collaborator and is not
/// driven from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkRecoverOutcome {
    /// True if a marker was found on disk, meaning a previous bulk-recover
    /// run was interrupted and should resume from stage 3.
    pub resumed_incomplete_recovery: bool,
    pub marker: RecoveryMarker,
}

/// Drives stages 1 and 2 of bulk recovery:
/// 1. Look for an existing marker; if present, resume from it.
/// 2. Otherwise take a fresh local checkpoint (the caller supplies the
///    checkpoint closure so this module stays storage-agnostic), tolerating
///    "already" or "no data" outcomes, then write a fresh marker naming
///    this node as peer and a freshly generated db uuid.
pub fn bulk_recover(
    log_dir: &Path,
    self_uuid: Uuid,
    fresh_checkpoint: impl FnOnce() -> Result<()>,
) -> Result<BulkRecoverOutcome> {
    if let Some(marker) = scan_marker(log_dir)? {
        return Ok(BulkRecoverOutcome {
            resumed_incomplete_recovery: true,
            marker,
        });
    }

    match fresh_checkpoint() {
        Ok(()) => {}
        Err(LogError::NotSupported(_)) => {}
        Err(e) => return Err(e),
    }

    let marker = RecoveryMarker {
        peer_uuid: self_uuid,
        db_uuid: Uuid::new_v4(),
    };
    write_marker(log_dir, &marker)?;
    Ok(BulkRecoverOutcome {
        resumed_incomplete_recovery: false,
        marker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_marker_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(scan_marker(dir.path()).unwrap(), None);
    }

    #[test]
    fn round_trips_a_single_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = RecoveryMarker {
            peer_uuid: Uuid::new_v4(),
            db_uuid: Uuid::new_v4(),
        };
        write_marker(dir.path(), &marker).unwrap();
        assert_eq!(scan_marker(dir.path()).unwrap(), Some(marker));
        delete_marker(dir.path(), &marker).unwrap();
        assert_eq!(scan_marker(dir.path()).unwrap(), None);
    }

    #[test]
    fn multiple_markers_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_marker(
            dir.path(),
            &RecoveryMarker {
                peer_uuid: Uuid::new_v4(),
                db_uuid: Uuid::new_v4(),
            },
        )
        .unwrap();
        write_marker(
            dir.path(),
            &RecoveryMarker {
                peer_uuid: Uuid::new_v4(),
                db_uuid: Uuid::new_v4(),
            },
        )
        .unwrap();
        match scan_marker(dir.path()) {
            Err(LogError::MultipleMarkers) => {}
            other => panic!("expected MultipleMarkers, got {:?}", other),
        }
    }

    #[test]
    fn bulk_recover_without_marker_checkpoints_and_writes_one() {
        let dir = tempfile::tempdir().unwrap();
        let self_id = Uuid::new_v4();
        let mut checkpointed = false;
        let outcome = bulk_recover(dir.path(), self_id, || {
            checkpointed = true;
            Ok(())
        })
        .unwrap();
        assert!(checkpointed);
        assert!(!outcome.resumed_incomplete_recovery);
        assert_eq!(scan_marker(dir.path()).unwrap(), Some(outcome.marker));
    }

    #[test]
    fn bulk_recover_resumes_from_existing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let existing = RecoveryMarker {
            peer_uuid: Uuid::new_v4(),
            db_uuid: Uuid::new_v4(),
        };
        write_marker(dir.path(), &existing).unwrap();
        let outcome = bulk_recover(dir.path(), Uuid::new_v4(), || {
            panic!("should not checkpoint when a marker already exists")
        })
        .unwrap();
        assert!(outcome.resumed_incomplete_recovery);
        assert_eq!(outcome.marker, existing);
    }
}
