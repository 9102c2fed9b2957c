//! Book issue.
//!
//! TAKE presents the shelf, the patron lifts the book, GIVE stores the
//! now-light shelf back in the same cell. Local rows commit before the
//! remote loan registration; a remote failure is a warning, not a
//! rollback.

use std::time::Instant;

use bookmat_irbis::LibraryClient as _;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::store::models::{
    Book, BookPatch, BookStatus, CellPatch, LogLevel, OperationDraft, OperationKind,
};

use super::{TransactionError, Transactions};

/// Result of a successful issue.
#[derive(Debug, Clone, Serialize)]
pub struct IssueOutcome {
    pub book: Book,
    pub message: String,
}

impl Transactions {
    /// Issues `book_rfid` to `user_rfid`.
    pub async fn issue(
        &self,
        book_rfid: &str,
        user_rfid: &str,
    ) -> Result<IssueOutcome, TransactionError> {
        let _cabinet = self.cabinet.lock().await;
        let started = Instant::now();

        let book = self
            .store
            .get_book_by_rfid(book_rfid)?
            .ok_or(TransactionError::BookNotFound)?;
        if book.status == BookStatus::Issued {
            return Err(TransactionError::AlreadyIssued);
        }
        if let Some(reserved_by) = &book.reserved_by {
            if reserved_by != user_rfid {
                return Err(TransactionError::ReservedByOther);
            }
        }
        let cell = match book.cell_id {
            Some(cell_id) => self
                .store
                .get_cell(cell_id)?
                .ok_or(TransactionError::BookNotInCabinet)?,
            None => return Err(TransactionError::BookNotInCabinet),
        };

        if let Err(err) = self.algorithms.take_shelf(cell.coord).await {
            self.log_mechanics_failure(OperationKind::Issue, Some(cell.coord), &err, started);
            return Err(err.into());
        }

        self.algorithms
            .wait_for_user(Some(self.timeouts.user_wait()))
            .await;

        if let Err(err) = self.algorithms.give_shelf(cell.coord).await {
            self.log_mechanics_failure(OperationKind::Issue, Some(cell.coord), &err, started);
            return Err(err.into());
        }

        let now = Utc::now();
        self.store.update_book(
            book.id,
            &BookPatch {
                status: Some(BookStatus::Issued),
                issued_to: Some(Some(user_rfid.to_string())),
                issued_at: Some(Some(now)),
                due_date: Some(Some(now + ChronoDuration::days(i64::from(self.loan_days)))),
                reserved_by: Some(None),
                cell_id: Some(None),
                ..BookPatch::default()
            },
        )?;
        self.store.update_cell(cell.id, &CellPatch::cleared())?;

        if let Err(err) = self.library.register_issue(book_rfid, user_rfid).await {
            self.log_system(
                LogLevel::Warning,
                "issue",
                &format!("remote issue registration failed for {book_rfid}: {err}"),
            );
        }

        let mut draft = OperationDraft::new(OperationKind::Issue);
        draft.cell = Some(cell.coord);
        draft.book_rfid = Some(book_rfid.to_string());
        draft.user_rfid = Some(user_rfid.to_string());
        draft.duration_ms = started.elapsed().as_millis() as i64;
        self.log_operation(draft);
        self.log_system(
            LogLevel::Info,
            "issue",
            &format!("issued \"{}\" to {user_rfid}", book.title),
        );

        let book = self
            .store
            .get_book_by_rfid(book_rfid)?
            .ok_or(TransactionError::BookNotFound)?;
        let message = format!("book \"{}\" issued", book.title);
        Ok(IssueOutcome { book, message })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::rig;
    use super::*;
    use crate::store::models::CellStatus;
    use bookmat_core::{Event, MotionOp};

    #[tokio::test(start_paused = true)]
    async fn test_issue_happy_path() {
        let rig = rig();
        let mut rx = rig.events.subscribe();

        let before = rig
            .transactions
            .store()
            .get_book_by_rfid("BOOK001")
            .unwrap()
            .unwrap();
        let cell_id = before.cell_id.unwrap();

        let outcome = rig.transactions.issue("BOOK001", "CARD001").await.unwrap();
        assert_eq!(outcome.book.status, BookStatus::Issued);
        assert_eq!(outcome.book.issued_to.as_deref(), Some("CARD001"));
        assert_eq!(outcome.book.cell_id, None);
        assert!(outcome.book.issued_at.is_some());
        assert!(outcome.book.due_date.is_some());

        let cell = rig.transactions.store().get_cell(cell_id).unwrap().unwrap();
        assert_eq!(cell.status, CellStatus::Empty);
        assert_eq!(cell.book_rfid, None);

        // The remote exemplar flipped to issued.
        assert_eq!(rig.library.exemplar_status("BOOK001").as_deref(), Some("1"));

        // Progress stream: 13 TAKE steps then 12 GIVE steps.
        let mut take = Vec::new();
        let mut give = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Progress {
                step, operation, ..
            } = event
            {
                match operation {
                    MotionOp::Take => take.push(step),
                    MotionOp::Give => give.push(step),
                    MotionOp::Init => {}
                }
            }
        }
        assert_eq!(take, (1..=13).collect::<Vec<_>>());
        assert_eq!(give, (1..=12).collect::<Vec<_>>());

        // Operation record appended.
        let ops = rig
            .transactions
            .store()
            .recent_operations(5, Some(crate::store::models::OperationKind::Issue))
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].book_rfid.as_deref(), Some("BOOK001"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_rejects_wrong_reader() {
        let rig = rig();
        // BOOK001 is reserved for CARD001.
        let err = rig.transactions.issue("BOOK001", "CARD002").await.unwrap_err();
        assert!(matches!(err, TransactionError::ReservedByOther));

        // No mutation happened.
        let book = rig
            .transactions
            .store()
            .get_book_by_rfid("BOOK001")
            .unwrap()
            .unwrap();
        assert_eq!(book.status, BookStatus::Reserved);
        assert!(book.cell_id.is_some());
        let cell = rig
            .transactions
            .store()
            .get_cell(book.cell_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(cell.status, CellStatus::Occupied);
        assert_eq!(rig.library.exemplar_status("BOOK001").as_deref(), Some("0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_unknown_book() {
        let rig = rig();
        let err = rig.transactions.issue("NOPE1", "CARD001").await.unwrap_err();
        assert!(matches!(err, TransactionError::BookNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_twice_rejected() {
        let rig = rig();
        rig.transactions.issue("BOOK001", "CARD001").await.unwrap();
        let err = rig.transactions.issue("BOOK001", "CARD001").await.unwrap_err();
        assert!(matches!(err, TransactionError::AlreadyIssued));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreserved_book_issues_to_anyone() {
        let rig = rig();
        let outcome = rig.transactions.issue("BOOK002", "CARD002").await.unwrap();
        assert_eq!(outcome.book.issued_to.as_deref(), Some("CARD002"));
    }
}
