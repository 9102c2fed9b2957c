//! Book loading (librarian).
//!
//! Places a new volume into the cabinet. Metadata comes from the caller
//! or, failing that, from the remote catalogue; a remote record that
//! claims the book is still issued elsewhere is loaded anyway with a
//! warning, since the physical volume in the librarian's hand wins the
//! argument.

use std::time::Instant;

use bookmat_irbis::{LibraryClient as _, RemoteBookStatus};
use serde::Serialize;

use crate::store::models::{
    Book, BookPatch, BookStatus, Cell, CellPatch, CellStatus, LogLevel, OperationDraft,
    OperationKind,
};

use super::{TransactionError, Transactions};

/// Result of a successful load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub book: Book,
    pub cell: Cell,
    pub message: String,
}

impl Transactions {
    /// Loads `book_rfid` into `cell_id` or the first empty cell.
    pub async fn load_book(
        &self,
        book_rfid: &str,
        title: Option<&str>,
        author: Option<&str>,
        cell_id: Option<i64>,
    ) -> Result<LoadOutcome, TransactionError> {
        let _cabinet = self.cabinet.lock().await;
        let started = Instant::now();

        let existing = self.store.get_book_by_rfid(book_rfid)?;
        let (title, author) = match (&existing, title) {
            (Some(book), _) => (book.title.clone(), book.author.clone()),
            (None, Some(title)) => (title.to_string(), author.map(str::to_string)),
            (None, None) => {
                let remote = match self.library.get_book(book_rfid).await {
                    Ok(remote) => remote,
                    Err(err) => {
                        tracing::warn!(%err, "remote metadata lookup failed on load");
                        None
                    }
                };
                let Some(remote) = remote else {
                    return Err(TransactionError::TitleRequired);
                };
                if remote.status == RemoteBookStatus::Issued {
                    self.log_system(
                        LogLevel::Warning,
                        "load",
                        &format!("{book_rfid} is recorded as issued in the catalogue"),
                    );
                }
                let author = if remote.author.is_empty() {
                    None
                } else {
                    Some(remote.author)
                };
                (remote.title, author)
            }
        };

        let cell = match cell_id {
            Some(id) => {
                let cell = self.store.get_cell(id)?.ok_or(TransactionError::CellNotFound)?;
                if cell.status != CellStatus::Empty {
                    return Err(TransactionError::CellUnavailable);
                }
                cell
            }
            None => self
                .store
                .find_empty_cell()?
                .ok_or(TransactionError::NoEmptyCell)?,
        };

        if let Err(err) = self.algorithms.give_shelf(cell.coord).await {
            self.log_mechanics_failure(OperationKind::Load, Some(cell.coord), &err, started);
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
                status: Some(BookStatus::InCabinet),
                cell_id: Some(Some(cell.id)),
                ..BookPatch::default()
            },
        )?;
        self.store.update_cell(
            cell.id,
            &CellPatch {
                status: Some(CellStatus::Occupied),
                book_rfid: Some(Some(book_rfid.to_string())),
                book_title: Some(Some(title.clone())),
                ..CellPatch::default()
            },
        )?;

        let mut draft = OperationDraft::new(OperationKind::Load);
        draft.cell = Some(cell.coord);
        draft.book_rfid = Some(book_rfid.to_string());
        draft.duration_ms = started.elapsed().as_millis() as i64;
        self.log_operation(draft);
        self.log_system(
            LogLevel::Info,
            "load",
            &format!("loaded \"{title}\" into cell {}", cell.coord),
        );

        let book = self
            .store
            .get_book_by_rfid(book_rfid)?
            .ok_or(TransactionError::BookNotFound)?;
        let cell = self
            .store
            .get_cell(cell.id)?
            .ok_or(TransactionError::CellNotFound)?;
        let message = format!("book \"{title}\" loaded");
        Ok(LoadOutcome { book, cell, message })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::rig;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_load_with_explicit_metadata() {
        let rig = rig();
        let outcome = rig
            .transactions
            .load_book("AA11BB22", Some("Walden"), Some("Thoreau H."), None)
            .await
            .unwrap();
        assert_eq!(outcome.book.status, BookStatus::InCabinet);
        assert_eq!(outcome.book.title, "Walden");
        assert_eq!(outcome.cell.book_rfid.as_deref(), Some("AA11BB22"));
        assert_eq!(outcome.cell.status, CellStatus::Occupied);
        assert!(!outcome.cell.needs_extraction);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_pulls_remote_metadata() {
        let rig = rig();
        rig.library.add_book("CC33DD44", "Dead Souls", "Gogol N.");
        let outcome = rig
            .transactions
            .load_book("CC33DD44", None, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.book.title, "Dead Souls");
        assert_eq!(outcome.book.author.as_deref(), Some("Gogol N."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_without_any_metadata_fails() {
        let rig = rig();
        let err = rig
            .transactions
            .load_book("EE55FF66", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::TitleRequired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_into_occupied_cell_rejected() {
        let rig = rig();
        // Cell 1 is occupied by the seed data.
        let err = rig
            .transactions
            .load_book("AA11BB22", Some("Walden"), None, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::CellUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_into_chosen_empty_cell() {
        let rig = rig();
        let target = rig.transactions.store().find_empty_cell().unwrap().unwrap();
        let outcome = rig
            .transactions
            .load_book("AA11BB22", Some("Walden"), None, Some(target.id))
            .await
            .unwrap();
        assert_eq!(outcome.cell.id, target.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_of_extracted_book_reuses_row() {
        let rig = rig();
        rig.transactions
            .load_book("AA11BB22", Some("Walden"), None, None)
            .await
            .unwrap();
        let first = rig
            .transactions
            .store()
            .get_book_by_rfid("AA11BB22")
            .unwrap()
            .unwrap();

        // Loading the same tag again keeps the row and its title.
        let outcome = rig
            .transactions
            .load_book("AA11BB22", None, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.book.id, first.id);
        assert_eq!(outcome.book.title, "Walden");
    }
}
