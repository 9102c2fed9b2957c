//! Extraction and inventory (librarian).
//!
//! Extraction presents an occupied shelf at the window so the operator
//! can take the volume out, then stores the empty shelf back. Inventory
//! walks the catalogue without motion, optionally cross-checking the
//! cells against an RFID sweep by the in-cabinet reader.

use std::collections::BTreeSet;
use std::time::Instant;

use bookmat_core::cabinet::CellCoord;
use bookmat_core::rfid::normalize_uid;
use serde::Serialize;

use crate::store::models::{
    BookPatch, BookStatus, Cell, CellPatch, CellStatus, LogLevel, OperationDraft, OperationKind,
};

use super::{TransactionError, Transactions};

/// Result of one extraction.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractOutcome {
    pub cell: Cell,
    pub book_rfid: Option<String>,
    pub message: String,
}

/// Result of a full extraction sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractAllOutcome {
    pub extracted: usize,
    pub errors: Vec<String>,
}

/// Verdict for one cell of the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryVerdict {
    /// Cell and catalogue agree.
    Ok,
    /// Catalogue says occupied, the scan did not see the tag.
    Missing,
    /// Cell and book rows disagree about each other.
    Mismatch,
    /// A scanned tag no occupied cell accounts for.
    Unexpected,
}

/// One line of the inventory report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryEntry {
    pub cell: Option<CellCoord>,
    pub rfid: Option<String>,
    pub verdict: InventoryVerdict,
}

/// Full inventory report.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryReport {
    pub total_occupied: usize,
    pub ok: usize,
    pub missing: usize,
    pub mismatch: usize,
    pub unexpected: usize,
    pub entries: Vec<InventoryEntry>,
}

impl Transactions {
    /// Extracts the book in `cell_id` through the window.
    pub async fn extract(&self, cell_id: i64) -> Result<ExtractOutcome, TransactionError> {
        let _cabinet = self.cabinet.lock().await;
        let started = Instant::now();

        let cell = self
            .store
            .get_cell(cell_id)?
            .ok_or(TransactionError::CellNotFound)?;
        if cell.status != CellStatus::Occupied {
            return Err(TransactionError::CellIsEmpty);
        }

        if let Err(err) = self.algorithms.take_shelf(cell.coord).await {
            self.log_mechanics_failure(OperationKind::Extract, Some(cell.coord), &err, started);
            return Err(err.into());
        }
        self.algorithms
            .wait_for_user(Some(self.timeouts.user_wait()))
            .await;
        if let Err(err) = self.algorithms.give_shelf(cell.coord).await {
            self.log_mechanics_failure(OperationKind::Extract, Some(cell.coord), &err, started);
            return Err(err.into());
        }

        if let Some(rfid) = &cell.book_rfid {
            if let Some(book) = self.store.get_book_by_rfid(rfid)? {
                self.store.update_book(
                    book.id,
                    &BookPatch {
                        status: Some(BookStatus::Extracted),
                        cell_id: Some(None),
                        ..BookPatch::default()
                    },
                )?;
            }
        }
        self.store.update_cell(cell.id, &CellPatch::cleared())?;

        let mut draft = OperationDraft::new(OperationKind::Extract);
        draft.cell = Some(cell.coord);
        draft.book_rfid = cell.book_rfid.clone();
        draft.duration_ms = started.elapsed().as_millis() as i64;
        self.log_operation(draft);
        let title = cell.book_title.as_deref().unwrap_or("book");
        self.log_system(
            LogLevel::Info,
            "extract",
            &format!("extracted \"{title}\" from cell {}", cell.coord),
        );

        let message = format!("\"{title}\" extracted");
        let book_rfid = cell.book_rfid.clone();
        let cell = self
            .store
            .get_cell(cell_id)?
            .ok_or(TransactionError::CellNotFound)?;
        Ok(ExtractOutcome {
            cell,
            book_rfid,
            message,
        })
    }

    /// Extracts every cell flagged for extraction, collecting per-cell
    /// failures instead of stopping at the first one.
    pub async fn extract_all(&self) -> Result<ExtractAllOutcome, TransactionError> {
        let pending = self.store.get_cells_needing_extraction()?;
        let mut extracted = 0;
        let mut errors = Vec::new();
        for cell in pending {
            match self.extract(cell.id).await {
                Ok(_) => extracted += 1,
                Err(err) => errors.push(format!("cell {}: {err}", cell.id)),
            }
        }
        Ok(ExtractAllOutcome { extracted, errors })
    }

    /// Walks every cell and classifies the catalogue against reality.
    ///
    /// With `scan_rfid` the in-cabinet reader sweeps the field first and
    /// occupied cells are checked against the scan; without it (or
    /// without a reader) occupancy is taken at the catalogue's word.
    pub async fn inventory(&self, scan_rfid: bool) -> Result<InventoryReport, TransactionError> {
        let _cabinet = self.cabinet.lock().await;

        let scanned: Option<BTreeSet<String>> = if scan_rfid {
            match &self.book_reader {
                Some(reader) => match reader.scan(3) {
                    Ok(tags) => Some(tags.into_iter().collect()),
                    Err(err) => {
                        self.log_system(
                            LogLevel::Warning,
                            "inventory",
                            &format!("tag sweep failed, falling back to catalogue: {err}"),
                        );
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let mut report = InventoryReport {
            total_occupied: 0,
            ok: 0,
            missing: 0,
            mismatch: 0,
            unexpected: 0,
            entries: Vec::new(),
        };
        let mut accounted: BTreeSet<String> = BTreeSet::new();

        for cell in self.store.get_all_cells()? {
            if cell.status != CellStatus::Occupied {
                continue;
            }
            report.total_occupied += 1;

            let Some(rfid) = cell.book_rfid.clone() else {
                report.mismatch += 1;
                report.entries.push(InventoryEntry {
                    cell: Some(cell.coord),
                    rfid: None,
                    verdict: InventoryVerdict::Mismatch,
                });
                continue;
            };
            let normalized = normalize_uid(&rfid).unwrap_or_else(|| rfid.clone());
            accounted.insert(normalized.clone());

            // Cell and book row must point at each other.
            let consistent = match self.store.get_book_by_rfid(&rfid)? {
                Some(book) => book.cell_id == Some(cell.id),
                None => false,
            };
            if !consistent {
                report.mismatch += 1;
                report.entries.push(InventoryEntry {
                    cell: Some(cell.coord),
                    rfid: Some(rfid),
                    verdict: InventoryVerdict::Mismatch,
                });
                continue;
            }

            let verdict = match &scanned {
                Some(tags) if !tags.contains(&normalized) => InventoryVerdict::Missing,
                _ => InventoryVerdict::Ok,
            };
            match verdict {
                InventoryVerdict::Ok => report.ok += 1,
                InventoryVerdict::Missing => report.missing += 1,
                _ => unreachable!(),
            }
            report.entries.push(InventoryEntry {
                cell: Some(cell.coord),
                rfid: Some(rfid),
                verdict,
            });
        }

        if let Some(tags) = &scanned {
            for tag in tags {
                if !accounted.contains(tag) {
                    report.unexpected += 1;
                    report.entries.push(InventoryEntry {
                        cell: None,
                        rfid: Some(tag.clone()),
                        verdict: InventoryVerdict::Unexpected,
                    });
                }
            }
        }

        self.log_system(
            LogLevel::Info,
            "inventory",
            &format!(
                "inventory: {} ok, {} missing, {} mismatch, {} unexpected",
                report.ok, report.missing, report.mismatch, report.unexpected
            ),
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::rig;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_extract_clears_cell_and_book() {
        let rig = rig();
        let book = rig
            .transactions
            .store()
            .get_book_by_rfid("BOOK002")
            .unwrap()
            .unwrap();
        let cell_id = book.cell_id.unwrap();

        let outcome = rig.transactions.extract(cell_id).await.unwrap();
        assert_eq!(outcome.book_rfid.as_deref(), Some("BOOK002"));
        assert_eq!(outcome.cell.status, CellStatus::Empty);

        let book = rig
            .transactions
            .store()
            .get_book_by_rfid("BOOK002")
            .unwrap()
            .unwrap();
        assert_eq!(book.status, BookStatus::Extracted);
        assert_eq!(book.cell_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_empty_cell_rejected() {
        let rig = rig();
        let empty = rig.transactions.store().find_empty_cell().unwrap().unwrap();
        let err = rig.transactions.extract(empty.id).await.unwrap_err();
        assert!(matches!(err, TransactionError::CellIsEmpty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_all_sweeps_flagged_cells() {
        let rig = rig();
        rig.library.add_book("NEW001", "The Trial", "Kafka F.");
        rig.library.add_book("NEW002", "Emma", "Austen J.");
        rig.transactions.return_book("NEW001").await.unwrap();
        rig.transactions.return_book("NEW002").await.unwrap();

        let outcome = rig.transactions.extract_all().await.unwrap();
        assert_eq!(outcome.extracted, 2);
        assert!(outcome.errors.is_empty());
        assert!(rig
            .transactions
            .store()
            .get_cells_needing_extraction()
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inventory_without_scan_trusts_catalogue() {
        let rig = rig();
        let report = rig.transactions.inventory(false).await.unwrap();
        assert_eq!(report.total_occupied, 5);
        assert_eq!(report.ok, 5);
        assert_eq!(report.missing, 0);
        assert_eq!(report.mismatch, 0);
        assert_eq!(report.unexpected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inventory_flags_dangling_cell() {
        let rig = rig();
        // Occupy a cell with a tag no book row knows.
        let empty = rig.transactions.store().find_empty_cell().unwrap().unwrap();
        rig.transactions
            .store()
            .update_cell(
                empty.id,
                &CellPatch {
                    status: Some(CellStatus::Occupied),
                    book_rfid: Some(Some("ORPHAN1".into())),
                    ..CellPatch::default()
                },
            )
            .unwrap();

        let report = rig.transactions.inventory(false).await.unwrap();
        assert_eq!(report.mismatch, 1);
        assert!(report
            .entries
            .iter()
            .any(|e| e.verdict == InventoryVerdict::Mismatch
                && e.rfid.as_deref() == Some("ORPHAN1")));
    }
}
