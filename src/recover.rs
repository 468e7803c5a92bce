//! Startup recovery: replay the merge journal before anything becomes
//! writable.
//!
//! A journal ending in `MergeEnd` means the merge committed and only
//! retirement of inputs may be outstanding; anything else is mid-flight and
//! is rolled back (the inputs are intact or restorable, so a future cycle
//! simply redoes the merge). Running recovery twice over the same on-disk
//! state yields the same file set: every action here is a no-op when its
//! effect is already present.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::MergeError;
use crate::format::{is_sealed, SegmentWriter};
use crate::journal::{read_journal, CommitMode, JournalScan, MERGE_LOG_NAME, SQUEEZE_LOG_NAME};
use crate::segment::{
    sidecar_path, SegmentName, INPLACE_MERGE_SUFFIX, MODS_SUFFIX, RESOURCE_SUFFIX,
    SQUEEZE_MERGE_SUFFIX,
};
use crate::telemetry::{merge_metrics, MergeEvent, MergeEventListener};

/// What recovery did, and whether a rolled-back merge should be resubmitted.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub journals_processed: usize,
    pub rolled_back: bool,
    pub completed_commit: bool,
    pub deleted: Vec<PathBuf>,
    /// File set of a rolled-back merge, for `continue_merge_after_reboot`.
    pub resume: Option<(Vec<PathBuf>, Vec<PathBuf>)>,
}

/// Replays both journal flavours found in the storage-group system directory.
pub fn recover(
    sys_dir: &Path,
    listener: &std::sync::Arc<dyn MergeEventListener>,
    continue_after_reboot: bool,
) -> Result<RecoveryReport, MergeError> {
    let mut report = RecoveryReport::default();
    for name in [MERGE_LOG_NAME, SQUEEZE_LOG_NAME] {
        let path = sys_dir.join(name);
        if !path.exists() {
            continue;
        }
        listener.on_event(MergeEvent::RecoveryStarted { journal: path.clone() });
        let scan = read_journal(&path)?;
        let squeeze = name == SQUEEZE_LOG_NAME;
        recover_one(&path, &scan, squeeze, continue_after_reboot, listener, &mut report)?;
        report.journals_processed += 1;
        listener.on_event(MergeEvent::RecoveryCompleted { journal: path.clone() });
    }
    Ok(report)
}

fn recover_one(
    journal: &Path,
    scan: &JournalScan,
    squeeze: bool,
    continue_after_reboot: bool,
    listener: &std::sync::Arc<dyn MergeEventListener>,
    report: &mut RecoveryReport,
) -> Result<(), MergeError> {
    if scan.contains_merge_end() {
        finish_committed(scan, squeeze, report)?;
        report.completed_commit = true;
    } else {
        roll_back(scan, squeeze, report)?;
        report.rolled_back = true;
        merge_metrics::record_recovery_rollback();
        listener.on_event(MergeEvent::RecoveryRolledBack { journal: journal.to_path_buf() });
        if continue_after_reboot {
            if let Some((seq, unseq)) = scan.file_set() {
                report.resume = Some((seq.to_vec(), unseq.to_vec()));
            }
        }
    }
    fs::remove_file(journal)?;
    Ok(())
}

/// `MergeEnd` is present: every per-file swap already happened; apply the
/// retirements that a crash mid-cleanup left behind.
fn finish_committed(
    scan: &JournalScan,
    squeeze: bool,
    report: &mut RecoveryReport,
) -> Result<(), MergeError> {
    let (seq, unseq) = match scan.file_set() {
        Some(set) => set,
        None => return Ok(()),
    };

    if squeeze {
        let new_file = scan.new_file().ok_or_else(|| {
            MergeError::InconsistentState(
                "journal has MergeEnd but no NewFile record".to_string(),
            )
        })?;
        let temp = sidecar_path(new_file, SQUEEZE_MERGE_SUFFIX);
        if !new_file.exists() {
            if temp.exists() && is_sealed(&temp)? {
                fs::rename(&temp, new_file)?;
            } else {
                return Err(MergeError::InconsistentState(format!(
                    "committed squeeze output {} is gone",
                    new_file.display()
                )));
            }
        }
        for input in seq.iter().chain(unseq.iter()) {
            delete_with_sidecars(input, report)?;
        }
    } else {
        // Sequence inputs were renamed to their successor names; a listed
        // path that exists under neither name means committed data vanished.
        for path in seq {
            let successor = successor_path(path)?;
            if !path.exists() && !successor.exists() {
                return Err(MergeError::InconsistentState(format!(
                    "committed file {} is gone (successor {} missing too)",
                    path.display(),
                    successor.display()
                )));
            }
            let temp = sidecar_path(path, INPLACE_MERGE_SUFFIX);
            if temp.exists() {
                fs::remove_file(&temp)?;
                report.deleted.push(temp);
            }
        }
        for path in unseq {
            delete_with_sidecars(path, report)?;
        }
    }
    Ok(())
}

/// No `MergeEnd`: undo whatever the crash interrupted.
fn roll_back(
    scan: &JournalScan,
    squeeze: bool,
    report: &mut RecoveryReport,
) -> Result<(), MergeError> {
    match scan.last_file_merge() {
        Some((file, truncate_pos, CommitMode::MoveMergedToOld, ended)) => {
            let successor = successor_path(file)?;
            if ended {
                // Seal finished; only the rename may be pending.
                if file.exists() && !successor.exists() {
                    rename_with_sidecars(file, &successor)?;
                }
                let temp = sidecar_path(file, INPLACE_MERGE_SUFFIX);
                if temp.exists() {
                    fs::remove_file(&temp)?;
                    report.deleted.push(temp);
                }
            } else if file.exists() {
                // Mid-append crash: cut the file back to its pre-merge data
                // and rebuild the seal from the surviving chunks.
                reseal_truncated(file, truncate_pos)?;
                let temp = sidecar_path(file, INPLACE_MERGE_SUFFIX);
                if temp.exists() {
                    fs::remove_file(&temp)?;
                    report.deleted.push(temp);
                }
            }
            delete_remaining_temps(scan, report)?;
        }
        Some((file, _, CommitMode::MoveUnmergedToNew, ended)) => {
            let temp = sidecar_path(file, INPLACE_MERGE_SUFFIX);
            let successor = successor_path(file)?;
            if ended && temp.exists() && is_sealed(&temp)? && !successor.exists() {
                // Commit completed, swap pending: finish it.
                if file.exists() {
                    fs::remove_file(file)?;
                }
                fs::rename(&temp, &successor)?;
                let resource = sidecar_path(file, RESOURCE_SUFFIX);
                if resource.exists() {
                    fs::rename(&resource, sidecar_path(&successor, RESOURCE_SUFFIX))?;
                }
                let mods = sidecar_path(file, MODS_SUFFIX);
                if mods.exists() {
                    fs::remove_file(&mods)?;
                }
            } else if temp.exists() {
                // Not promoted: the temp is discarded, the original stands.
                fs::remove_file(&temp)?;
                report.deleted.push(temp);
            }
            delete_remaining_temps(scan, report)?;
        }
        None => {
            delete_remaining_temps(scan, report)?;
        }
    }

    if squeeze {
        // A squeeze temp carries a generated name; sweep the partition
        // directories of the listed inputs for leftovers.
        if let Some((seq, unseq)) = scan.file_set() {
            let mut dirs: Vec<PathBuf> = Vec::new();
            for p in seq.iter().chain(unseq.iter()) {
                if let Some(dir) = p.parent() {
                    if !dirs.iter().any(|d| d == dir) {
                        dirs.push(dir.to_path_buf());
                    }
                }
            }
            for dir in dirs {
                sweep_squeeze_temps(&dir, report)?;
            }
        }
        // An unpromoted NewFile output is rolled back too; inputs are intact.
        if let Some(new_file) = scan.new_file() {
            if new_file.exists() && inputs_all_present(scan) {
                fs::remove_file(new_file)?;
                let resource = sidecar_path(new_file, RESOURCE_SUFFIX);
                if resource.exists() {
                    fs::remove_file(&resource)?;
                }
                report.deleted.push(new_file.clone());
            }
        }
    }
    Ok(())
}

fn inputs_all_present(scan: &JournalScan) -> bool {
    scan.file_set()
        .map(|(seq, unseq)| seq.iter().chain(unseq.iter()).all(|p| p.exists()))
        .unwrap_or(false)
}

fn delete_remaining_temps(scan: &JournalScan, report: &mut RecoveryReport) -> Result<(), MergeError> {
    if let Some((seq, _)) = scan.file_set() {
        for path in seq {
            let temp = sidecar_path(path, INPLACE_MERGE_SUFFIX);
            if temp.exists() {
                fs::remove_file(&temp)?;
                report.deleted.push(temp);
            }
        }
    }
    Ok(())
}

fn sweep_squeeze_temps(dir: &Path, report: &mut RecoveryReport) -> Result<(), MergeError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(SQUEEZE_MERGE_SUFFIX) {
            fs::remove_file(entry.path())?;
            report.deleted.push(entry.path());
        }
    }
    Ok(())
}

fn successor_path(path: &Path) -> Result<PathBuf, MergeError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| MergeError::InvalidFileName(path.display().to_string()))?;
    let next = SegmentName::parse(&file_name)?.next_merge();
    Ok(path.with_file_name(next.file_name()))
}

fn rename_with_sidecars(old: &Path, new: &Path) -> Result<(), MergeError> {
    fs::rename(old, new)?;
    let old_resource = sidecar_path(old, RESOURCE_SUFFIX);
    if old_resource.exists() {
        fs::rename(&old_resource, sidecar_path(new, RESOURCE_SUFFIX))?;
    }
    let old_mods = sidecar_path(old, MODS_SUFFIX);
    if old_mods.exists() {
        fs::remove_file(&old_mods)?;
    }
    Ok(())
}

fn delete_with_sidecars(path: &Path, report: &mut RecoveryReport) -> Result<(), MergeError> {
    for p in [
        path.to_path_buf(),
        sidecar_path(path, RESOURCE_SUFFIX),
        sidecar_path(path, MODS_SUFFIX),
    ] {
        if p.exists() {
            fs::remove_file(&p)?;
            report.deleted.push(p);
        }
    }
    Ok(())
}

/// Truncates a half-appended file back to its journaled data end and rebuilds
/// the seal from the chunks that survive the cut. The result is byte-for-byte
/// the original chunk data under a fresh index.
fn reseal_truncated(path: &Path, truncate_pos: u64) -> Result<(), MergeError> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(truncate_pos)?;
    drop(file);
    let writer = SegmentWriter::restore(path)?;
    writer.seal()?;
    Ok(())
}

/// Convenience used by the engine at startup: replay journals in `sys_dir`.
pub fn recover_storage_group(
    sys_dir: &Path,
    listener: &std::sync::Arc<dyn MergeEventListener>,
    continue_after_reboot: bool,
) -> Result<RecoveryReport, MergeError> {
    if !sys_dir.exists() {
        return Ok(RecoveryReport::default());
    }
    recover(sys_dir, listener, continue_after_reboot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{journal_path, JournalEntry, MergeJournal};
    use tempfile::tempdir;

    #[test]
    fn test_no_journal_is_a_noop() {
        let dir = tempdir().unwrap();
        let report = recover_storage_group(
            dir.path(),
            &crate::telemetry::noop_event_listener(),
            false,
        )
        .unwrap();
        assert_eq!(report.journals_processed, 0);
        assert!(!report.rolled_back);
    }

    #[test]
    fn test_plain_merge_start_deletes_temps_and_journal() {
        let dir = tempdir().unwrap();
        let seq = dir.path().join("1-1-0.seg");
        fs::write(&seq, b"data").unwrap();
        let temp = sidecar_path(&seq, INPLACE_MERGE_SUFFIX);
        fs::write(&temp, b"partial").unwrap();

        let mut journal = MergeJournal::create(dir.path(), false).unwrap();
        journal
            .log(&JournalEntry::Files { seq: vec![seq.clone()], unseq: vec![] })
            .unwrap();
        journal.log(&JournalEntry::MergeStart).unwrap();
        journal.close().unwrap();

        let report = recover_storage_group(
            dir.path(),
            &crate::telemetry::noop_event_listener(),
            false,
        )
        .unwrap();
        assert!(report.rolled_back);
        assert!(!temp.exists());
        assert!(seq.exists());
        assert!(!journal_path(dir.path(), false).exists());
    }

    #[test]
    fn test_resume_request_carries_file_set() {
        let dir = tempdir().unwrap();
        let seq = dir.path().join("1-1-0.seg");
        fs::write(&seq, b"data").unwrap();

        let mut journal = MergeJournal::create(dir.path(), false).unwrap();
        journal
            .log(&JournalEntry::Files { seq: vec![seq.clone()], unseq: vec![] })
            .unwrap();
        journal.log(&JournalEntry::MergeStart).unwrap();
        journal.close().unwrap();

        let report = recover_storage_group(
            dir.path(),
            &crate::telemetry::noop_event_listener(),
            true,
        )
        .unwrap();
        let (resume_seq, resume_unseq) = report.resume.unwrap();
        assert_eq!(resume_seq, vec![seq]);
        assert!(resume_unseq.is_empty());
    }
}
