//! Book return.
//!
//! The patron places the book on the presented shelf; GIVE stores it in
//! the first empty cell. A book unknown to the local store is created
//! from remote metadata, so a volume issued at the main desk can still
//! come back through the cabinet. Returned cells are flagged for
//! extraction: a librarian later moves the book to its proper shelf.

use std::time::Instant;

use bookmat_irbis::LibraryClient as _;
use serde::Serialize;

use crate::store::models::{
    Book, BookPatch, BookStatus, Cell, CellPatch, CellStatus, LogLevel, OperationDraft,
    OperationKind,
};

use super::{TransactionError, Transactions};

/// Result of a successful return.
#[derive(Debug, Clone, Serialize)]
pub struct ReturnOutcome {
    pub book: Book,
    pub cell: Cell,
    pub message: String,
}

impl Transactions {
    /// Accepts `book_rfid` back into the cabinet.
    pub async fn return_book(&self, book_rfid: &str) -> Result<ReturnOutcome, TransactionError> {
        let _cabinet = self.cabinet.lock().await;
        let started = Instant::now();

        let existing = self.store.get_book_by_rfid(book_rfid)?;
        let (title, author) = match &existing {
            Some(book) => (book.title.clone(), book.author.clone()),
            None => {
                // Not ours; ask the catalogue who this is.
                let remote = match self.library.get_book(book_rfid).await {
                    Ok(remote) => remote,
                    Err(err) => {
                        tracing::warn!(%err, "remote metadata lookup failed on return");
                        None
                    }
                };
                let Some(remote) = remote else {
                    return Err(TransactionError::BookNotFound);
                };
                let author = if remote.author.is_empty() {
                    None
                } else {
                    Some(remote.author)
                };
                (remote.title, author)
            }
        };

        let cell = self
            .store
            .find_empty_cell()?
            .ok_or(TransactionError::NoEmptyCell)?;

        if let Err(err) = self.algorithms.give_shelf(cell.coord).await {
            self.log_mechanics_failure(OperationKind::Return, Some(cell.coord), &err, started);
            return Err(err.into());
        }

        let book_id = match &existing {
            Some(book) => book.id,
            None => self
                .store
                .create_book(book_rfid, &title, author.as_deref(), None)?,
        };
        self.store.update_book(
            book_id,
            &BookPatch {
                status: Some(BookStatus::Returned),
                cell_id: Some(Some(cell.id)),
                issued_to: Some(None),
                issued_at: Some(None),
                due_date: Some(None),
                ..BookPatch::default()
            },
        )?;
        self.store.update_cell(
            cell.id,
            &CellPatch {
                status: Some(CellStatus::Occupied),
                book_rfid: Some(Some(book_rfid.to_string())),
                book_title: Some(Some(title.clone())),
                needs_extraction: Some(true),
                ..CellPatch::default()
            },
        )?;

        if let Err(err) = self.library.register_return(book_rfid).await {
            self.log_system(
                LogLevel::Warning,
                "return",
                &format!("remote return registration failed for {book_rfid}: {err}"),
            );
        }

        let mut draft = OperationDraft::new(OperationKind::Return);
        draft.cell = Some(cell.coord);
        draft.book_rfid = Some(book_rfid.to_string());
        draft.duration_ms = started.elapsed().as_millis() as i64;
        self.log_operation(draft);
        self.log_system(LogLevel::Info, "return", &format!("returned \"{title}\""));

        let book = self
            .store
            .get_book_by_rfid(book_rfid)?
            .ok_or(TransactionError::BookNotFound)?;
        let cell = self
            .store
            .get_cell(cell.id)?
            .ok_or(TransactionError::CellNotFound)?;
        let message = format!("book \"{title}\" returned");
        Ok(ReturnOutcome { book, cell, message })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::rig;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_return_unknown_book_creates_row_from_remote() {
        let rig = rig();
        rig.library.add_book("NEW001", "The Trial", "Kafka F.");

        let outcome = rig.transactions.return_book("NEW001").await.unwrap();
        assert_eq!(outcome.book.status, BookStatus::Returned);
        assert_eq!(outcome.book.title, "The Trial");
        assert_eq!(outcome.cell.status, CellStatus::Occupied);
        assert!(outcome.cell.needs_extraction);
        assert_eq!(outcome.cell.book_rfid.as_deref(), Some("NEW001"));

        // First empty cell in store order: the seed data occupies the
        // first five, so the sixth row gets it.
        assert_eq!(outcome.cell.id, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_then_return_round_trip() {
        let rig = rig();
        rig.transactions.issue("BOOK001", "CARD001").await.unwrap();

        let outcome = rig.transactions.return_book("BOOK001").await.unwrap();
        assert_eq!(outcome.book.status, BookStatus::Returned);
        assert_eq!(outcome.book.issued_to, None);
        assert!(outcome.cell.needs_extraction);

        // Remote exemplar is back on shelf.
        assert_eq!(rig.library.exemplar_status("BOOK001").as_deref(), Some("0"));

        // Extraction counter visible to the next staff login.
        let auth = rig.transactions.authenticate("ADMIN01").await.unwrap();
        assert_eq!(auth.needs_extraction, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_return_totally_unknown_book_fails() {
        let rig = rig();
        let err = rig.transactions.return_book("GHOST9").await.unwrap_err();
        assert!(matches!(err, TransactionError::BookNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_return_without_empty_cells_fails() {
        let rig = rig();
        // Occupy every empty cell.
        loop {
            let Some(cell) = rig.transactions.store().find_empty_cell().unwrap() else {
                break;
            };
            rig.transactions
                .store()
                .update_cell(
                    cell.id,
                    &CellPatch {
                        status: Some(CellStatus::Occupied),
                        ..CellPatch::default()
                    },
                )
                .unwrap();
        }
        rig.library.add_book("NEW002", "Emma", "Austen J.");
        let err = rig.transactions.return_book("NEW002").await.unwrap_err();
        assert!(matches!(err, TransactionError::NoEmptyCell));
    }
}
