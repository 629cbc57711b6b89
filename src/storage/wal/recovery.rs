//! Three-pass crash recovery: analysis, redo, undo.

use std::collections::HashMap;

use log::info;

use crate::error::{QuillError, Result};
use crate::storage::pager::Pager;
use crate::storage::wal::entry::{EntryKind, LogEntry};
use crate::storage::wal::writer::Log;
use crate::transaction::SYSTEM_TXN_ID;

/// Outcome of a transaction as observed by the analysis pass.
///
/// Walking backwards, the first terminal entry seen for a transaction is its
/// final word; a begin without one leaves the transaction in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnOutcome {
    Committed,
    Aborted,
    InFlight,
}

/// Summary of a recovery run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    /// Transactions whose commit entry was found.
    pub committed: usize,
    /// Transactions whose abort entry was found.
    pub aborted: usize,
    /// Transactions begun but never committed or aborted.
    pub in_flight: usize,
    /// After-images written back during the redo pass.
    pub redone_images: usize,
    /// Before-images written back during the undo pass.
    pub undone_images: usize,
    /// LSN of the checkpoint the redo pass started from (0 if none).
    pub checkpoint_lsn: u64,
}

/// Recovers the data file from the log, then clears the log.
///
/// 1. **Analysis**: a backward scan classifies every transaction and finds
///    the most recent checkpoint.
/// 2. **Redo**: committed after-images are replayed forward from the
///    checkpoint. System images (txn id 0, e.g. freshly cleared pages) are
///    always replayed; flush-page entries are advisory and skipped.
/// 3. **Undo**: before-images of in-flight transactions are restored,
///    newest first.
///
/// Both replay passes are idempotent: running recovery twice yields the same
/// data-file contents as running it once. On success the data file is
/// fsynced and the log cleared; on failure the log is left intact so
/// recovery can be retried.
///
/// # Errors
///
/// Returns any I/O or allocation failure from iteration or image writes.
pub fn recover(log: &mut Log, pager: &Pager) -> Result<RecoveryReport> {
    // Pass 1: analysis (backward)
    let mut entries: Vec<(LogEntry, Option<Vec<u8>>)> = Vec::new();
    let mut outcomes: HashMap<u64, TxnOutcome> = HashMap::new();
    let mut checkpoint_lsn = 0u64;
    {
        let mut iter = log.iter();
        while let Some((entry, payload)) = iter.next_entry()? {
            match entry.kind {
                EntryKind::TxnCommit => {
                    outcomes.entry(entry.txn_id).or_insert(TxnOutcome::Committed);
                }
                EntryKind::TxnAbort => {
                    outcomes.entry(entry.txn_id).or_insert(TxnOutcome::Aborted);
                }
                EntryKind::TxnBegin => {
                    outcomes.entry(entry.txn_id).or_insert(TxnOutcome::InFlight);
                }
                EntryKind::Checkpoint => {
                    if checkpoint_lsn == 0 {
                        checkpoint_lsn = entry.lsn;
                    }
                }
                _ => {}
            }
            entries.push((entry, payload));
        }
    }

    let mut report = RecoveryReport {
        checkpoint_lsn,
        ..RecoveryReport::default()
    };
    for outcome in outcomes.values() {
        match outcome {
            TxnOutcome::Committed => report.committed += 1,
            TxnOutcome::Aborted => report.aborted += 1,
            TxnOutcome::InFlight => report.in_flight += 1,
        }
    }
    info!(
        "recovery: {} entries, {} committed, {} aborted, {} in flight, checkpoint lsn {}",
        entries.len(),
        report.committed,
        report.aborted,
        report.in_flight,
        checkpoint_lsn
    );

    let is_committed = |txn_id: u64| {
        txn_id == SYSTEM_TXN_ID || outcomes.get(&txn_id) == Some(&TxnOutcome::Committed)
    };
    let is_in_flight =
        |txn_id: u64| txn_id != SYSTEM_TXN_ID && outcomes.get(&txn_id) == Some(&TxnOutcome::InFlight);

    // Pass 2: redo (forward from the checkpoint)
    for (entry, payload) in entries.iter().rev() {
        if entry.lsn <= checkpoint_lsn {
            continue;
        }
        match entry.kind {
            EntryKind::Write if is_committed(entry.txn_id) => {
                let image = required_payload(entry, payload)?;
                pager.apply_image(entry.offset, image)?;
                report.redone_images += 1;
            }
            EntryKind::Overwrite if is_committed(entry.txn_id) => {
                let image = required_payload(entry, payload)?;
                let half = image.len() / 2;
                pager.apply_image(entry.offset, &image[half..])?;
                report.redone_images += 1;
            }
            _ => {}
        }
    }

    // Pass 3: undo (backward from the tail)
    for (entry, payload) in entries.iter() {
        match entry.kind {
            EntryKind::Prewrite if is_in_flight(entry.txn_id) => {
                let image = required_payload(entry, payload)?;
                pager.apply_image(entry.offset, image)?;
                report.undone_images += 1;
            }
            EntryKind::Overwrite if is_in_flight(entry.txn_id) => {
                let image = required_payload(entry, payload)?;
                let half = image.len() / 2;
                pager.apply_image(entry.offset, &image[..half])?;
                report.undone_images += 1;
            }
            _ => {}
        }
    }

    pager.sync()?;
    log.clear()?;

    info!(
        "recovery complete: {} images redone, {} undone",
        report.redone_images, report.undone_images
    );
    Ok(report)
}

fn required_payload<'a>(entry: &LogEntry, payload: &'a Option<Vec<u8>>) -> Result<&'a [u8]> {
    payload.as_deref().ok_or_else(|| {
        QuillError::Corrupted(format!(
            "log entry at lsn {} is missing its {}-byte payload",
            entry.lsn, entry.data_size
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PAGE_SIZE;
    use crate::transaction::Transaction;
    use tempfile::TempDir;

    fn setup() -> (Pager, Log, TempDir) {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("test.db");
        let pager = Pager::create(&base).unwrap();
        let log = Log::create(&base).unwrap();
        (pager, log, temp)
    }

    fn full_page(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_SIZE]
    }

    #[test]
    fn test_recover_empty_log_is_a_noop() {
        let (pager, mut log, _temp) = setup();
        let report = recover(&mut log, &pager).unwrap();
        assert_eq!(report.committed, 0);
        assert_eq!(report.redone_images, 0);
        assert_eq!(report.undone_images, 0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_redo_applies_committed_after_image() {
        let (pager, mut log, _temp) = setup();
        let txn = Transaction::new(1);

        let offset = pager.allocate_page(Some(&mut log), txn.id()).unwrap();
        log.append_txn_begin(&txn).unwrap();
        log.append_write(txn.id(), offset, &full_page(7)).unwrap();
        log.append_txn_commit(&txn).unwrap();

        // the after-image never reached the data file
        let report = recover(&mut log, &pager).unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.redone_images, 1);
        assert!(log.is_empty());
        assert_eq!(log.lsn(), 1);

        let page = pager.read_page_uncached(offset).unwrap();
        assert!(page.data.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_redo_skips_uncommitted_and_undoes_in_flight() {
        let (pager, mut log, _temp) = setup();

        // committed txn 1 writes 7s; in-flight txn 2 scribbles 9s on disk
        let offset = pager.allocate_page(Some(&mut log), 1).unwrap();
        let t1 = Transaction::new(1);
        log.append_txn_begin(&t1).unwrap();
        log.append_write(1, offset, &full_page(7)).unwrap();
        log.append_txn_commit(&t1).unwrap();

        let t2 = Transaction::new(2);
        log.append_txn_begin(&t2).unwrap();
        log.append_prewrite(2, offset, &full_page(7)).unwrap();
        pager.apply_image(offset, &full_page(9)).unwrap();
        // crash: no commit for txn 2

        let report = recover(&mut log, &pager).unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.undone_images, 1);

        let page = pager.read_page_uncached(offset).unwrap();
        assert!(page.data.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_aborted_txn_is_ignored() {
        let (pager, mut log, _temp) = setup();

        let offset = pager.allocate_page(Some(&mut log), 1).unwrap();
        let t1 = Transaction::new(1);
        log.append_txn_begin(&t1).unwrap();
        log.append_write(1, offset, &full_page(4)).unwrap();
        log.append_txn_abort(&t1).unwrap();

        let report = recover(&mut log, &pager).unwrap();
        assert_eq!(report.aborted, 1);
        assert_eq!(report.redone_images, 0);
        assert_eq!(report.undone_images, 0);
    }

    #[test]
    fn test_overwrite_uses_the_right_half() {
        let (pager, mut log, _temp) = setup();

        let offset = pager.allocate_page(Some(&mut log), 1).unwrap();

        // committed: redo takes the new image
        let t1 = Transaction::new(1);
        log.append_txn_begin(&t1).unwrap();
        log.append_overwrite(1, offset, &full_page(1), &full_page(2))
            .unwrap();
        log.append_txn_commit(&t1).unwrap();

        let report = recover(&mut log, &pager).unwrap();
        assert_eq!(report.redone_images, 1);
        let page = pager.read_page_uncached(offset).unwrap();
        assert!(page.data.iter().all(|&b| b == 2));

        // in-flight: undo takes the old image
        let t2 = Transaction::new(2);
        log.append_txn_begin(&t2).unwrap();
        log.append_overwrite(2, offset, &full_page(2), &full_page(3))
            .unwrap();
        pager.apply_image(offset, &full_page(3)).unwrap();

        let report = recover(&mut log, &pager).unwrap();
        assert_eq!(report.undone_images, 1);
        let page = pager.read_page_uncached(offset).unwrap();
        assert!(page.data.iter().all(|&b| b == 2));
    }

    #[test]
    fn test_redo_starts_at_the_checkpoint() {
        let (pager, mut log, _temp) = setup();

        let offset = pager.allocate_page(Some(&mut log), 1).unwrap();

        // committed write of 3s, flushed, then a checkpoint
        let t1 = Transaction::new(1);
        log.append_txn_begin(&t1).unwrap();
        log.append_write(1, offset, &full_page(3)).unwrap();
        log.append_txn_commit(&t1).unwrap();
        pager.apply_image(offset, &full_page(3)).unwrap();
        log.append_checkpoint().unwrap();

        // post-checkpoint committed write of 5s, never flushed
        let t2 = Transaction::new(2);
        log.append_txn_begin(&t2).unwrap();
        log.append_write(2, offset, &full_page(5)).unwrap();
        log.append_txn_commit(&t2).unwrap();

        let report = recover(&mut log, &pager).unwrap();
        assert!(report.checkpoint_lsn > 0);
        assert_eq!(report.redone_images, 1);

        let page = pager.read_page_uncached(offset).unwrap();
        assert!(page.data.iter().all(|&b| b == 5));
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let (pager, mut log, temp) = setup();
        let base = temp.path().join("test.db");

        let offset = pager.allocate_page(Some(&mut log), 1).unwrap();
        let t1 = Transaction::new(1);
        log.append_txn_begin(&t1).unwrap();
        log.append_write(1, offset, &full_page(7)).unwrap();
        log.append_txn_commit(&t1).unwrap();
        log.close(true).unwrap();

        // preserve the log files so recovery can be replayed
        let saved0 = std::fs::read(temp.path().join("test.db.log0")).unwrap();
        let saved1 = std::fs::read(temp.path().join("test.db.log1")).unwrap();

        let mut log = Log::open(&base).unwrap();
        recover(&mut log, &pager).unwrap();
        let first = pager.read_page_uncached(offset).unwrap().data;
        drop(log);

        std::fs::write(temp.path().join("test.db.log0"), &saved0).unwrap();
        std::fs::write(temp.path().join("test.db.log1"), &saved1).unwrap();

        let mut log = Log::open(&base).unwrap();
        recover(&mut log, &pager).unwrap();
        let second = pager.read_page_uncached(offset).unwrap().data;

        assert_eq!(first[..], second[..]);
        assert!(first.iter().all(|&b| b == 7));
    }
}
