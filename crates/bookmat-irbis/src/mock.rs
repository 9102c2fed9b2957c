//! In-memory library backend.
//!
//! Mirrors the record structure of the real server closely enough that
//! the issue/return workflows exercise the same field and subfield
//! plumbing: readers carry fields 10/30/40/50, books carry 200/700/903
//! with repeating 910 exemplars. Used on hosts without a reachable
//! server and by the transaction tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local};

use bookmat_core::rfid::{normalize_uid, uid_variants};

use crate::error::IrbisError;
use crate::record::{
    active_loans, book_brief, find_exemplar, find_open_loan, Record, Subfields, OPEN_LOAN,
    TAG_EXEMPLAR, TAG_LOAN, TAG_READER_CARD, TAG_READER_CATEGORY, TAG_READER_NAME, TAG_SHELFMARK,
    TAG_TITLE,
};
use crate::service::{
    LibraryClient, RemoteBook, RemoteBookStatus, RemoteLoan, RemoteRole, RemoteUser,
};

#[derive(Default)]
struct MockState {
    readers: HashMap<i32, Record>,
    books: HashMap<i32, Record>,
    reader_index: HashMap<String, i32>,
    book_index: HashMap<String, i32>,
    next_mfn: i32,
}

impl MockState {
    fn index_uid(index: &mut HashMap<String, i32>, uid: &str, mfn: i32) {
        if let Some(normalized) = normalize_uid(uid) {
            index.insert(normalized, mfn);
        }
        for variant in uid_variants(uid) {
            index.insert(variant.to_ascii_uppercase(), mfn);
        }
    }

    fn lookup(index: &HashMap<String, i32>, uid: &str) -> Option<i32> {
        if let Some(normalized) = normalize_uid(uid) {
            if let Some(&mfn) = index.get(&normalized) {
                return Some(mfn);
            }
        }
        uid_variants(uid)
            .into_iter()
            .find_map(|variant| index.get(&variant.to_ascii_uppercase()).copied())
    }
}

/// In-memory [`LibraryClient`].
pub struct MockLibrary {
    state: Mutex<MockState>,
    loan_days: u32,
    location_code: String,
    operator: String,
}

impl Default for MockLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLibrary {
    /// An empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            loan_days: 30,
            location_code: "09".to_string(),
            operator: "MASTER".to_string(),
        }
    }

    /// A catalogue pre-loaded with the bring-up fixtures: four readers
    /// (`CARD001`, `CARD002`, `ADMIN01`, `ADMIN99`) and five books
    /// (`BOOK001`…`BOOK005`).
    #[must_use]
    pub fn seeded() -> Self {
        let mock = Self::new();
        for (uid, name, category) in [
            ("CARD001", "^AIvanov^BIvan^GIvanovich", "Reader"),
            ("CARD002", "^APetrova^BMaria^GSergeevna", "Reader"),
            ("ADMIN01", "^ASidorova^BAnna^GVladimirovna", "Librarian"),
            ("ADMIN99", "^ASystem^BAdministrator", "Administrator"),
        ] {
            mock.add_reader(uid, name, category);
        }
        for (index, (rfid, title, author, shelfmark)) in [
            ("BOOK001", "War and Peace", "^ATolstoy^BL.^GN.", "R2"),
            ("BOOK002", "The Master and Margarita", "^ABulgakov^BM.^GA.", "R2"),
            ("BOOK003", "1984", "^AOrwell^BG.", "E(Eng)"),
            ("BOOK004", "Crime and Punishment", "^ADostoevsky^BF.^GM.", "R2"),
            ("BOOK005", "Anna Karenina", "^ATolstoy^BL.^GN.", "R2"),
        ]
        .into_iter()
        .enumerate()
        {
            mock.add_book_full(rfid, title, author, shelfmark, &format!("{:05}", index + 1));
        }
        mock
    }

    /// Enrolls a reader. `name` is the raw field-10 value.
    pub fn add_reader(&self, uid: &str, name: &str, category: &str) {
        let mut state = self.state.lock().expect("mock library state");
        state.next_mfn += 1;
        let mfn = state.next_mfn;
        let mut record = Record::new(mfn);
        record.add_field(TAG_READER_NAME, name);
        record.add_field(TAG_READER_CARD, uid);
        record.add_field(TAG_READER_CATEGORY, category);
        MockState::index_uid(&mut state.reader_index, uid, mfn);
        state.readers.insert(mfn, record);
    }

    /// Catalogues a book with one available exemplar.
    pub fn add_book(&self, rfid: &str, title: &str, author: &str) {
        let author_field = if author.is_empty() {
            String::new()
        } else {
            format!("^A{author}")
        };
        self.add_book_full(rfid, title, &author_field, "R2", "00000");
    }

    fn add_book_full(&self, rfid: &str, title: &str, author: &str, shelfmark: &str, inventory: &str) {
        let mut state = self.state.lock().expect("mock library state");
        state.next_mfn += 1;
        let mfn = state.next_mfn;
        let mut record = Record::new(mfn);
        record.add_field(TAG_TITLE, format!("^A{title}"));
        if !author.is_empty() {
            record.add_field(crate::record::TAG_AUTHOR, author);
        }
        record.add_field(TAG_SHELFMARK, shelfmark);
        record.add_field(
            TAG_EXEMPLAR,
            format!("^a0^b{inventory}^c20200101^dLending^h{rfid}"),
        );
        MockState::index_uid(&mut state.book_index, rfid, mfn);
        state.books.insert(mfn, record);
    }

    /// Exemplar status of a catalogued book, for test assertions.
    #[must_use]
    pub fn exemplar_status(&self, rfid: &str) -> Option<String> {
        let state = self.state.lock().expect("mock library state");
        let mfn = MockState::lookup(&state.book_index, rfid)?;
        find_exemplar(state.books.get(&mfn)?, rfid).map(|e| e.status)
    }
}

#[async_trait]
impl LibraryClient for MockLibrary {
    async fn connect(&self) -> Result<(), IrbisError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), IrbisError> {
        Ok(())
    }

    async fn get_user(&self, card_uid: &str) -> Result<Option<RemoteUser>, IrbisError> {
        let state = self.state.lock().expect("mock library state");
        let Some(mfn) = MockState::lookup(&state.reader_index, card_uid) else {
            return Ok(None);
        };
        let record = &state.readers[&mfn];
        let name_field = Subfields::parse(record.field(TAG_READER_NAME));
        let name = format!(
            "{} {} {}",
            name_field.get('a').unwrap_or(""),
            name_field.get('b').unwrap_or(""),
            name_field.get('g').unwrap_or(""),
        )
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
        Ok(Some(RemoteUser {
            mfn,
            uid: card_uid.to_string(),
            name,
            role: RemoteRole::from_category(record.field(TAG_READER_CATEGORY)),
        }))
    }

    async fn get_book(&self, rfid: &str) -> Result<Option<RemoteBook>, IrbisError> {
        let state = self.state.lock().expect("mock library state");
        let Some(mfn) = MockState::lookup(&state.book_index, rfid) else {
            return Ok(None);
        };
        let record = &state.books[&mfn];
        let status = match find_exemplar(record, rfid) {
            Some(exemplar) if exemplar.is_available() => RemoteBookStatus::Available,
            Some(exemplar) if exemplar.status == "1" => RemoteBookStatus::Issued,
            Some(exemplar) => RemoteBookStatus::Other(exemplar.status),
            None => RemoteBookStatus::Other(String::new()),
        };
        let brief = book_brief(record);
        let (author, title) = match brief.split_once(". ") {
            Some((author, title)) => (author.to_string(), title.to_string()),
            None => (String::new(), brief),
        };
        Ok(Some(RemoteBook {
            mfn,
            rfid: rfid.to_string(),
            title,
            author,
            status,
        }))
    }

    async fn get_loans(&self, card_uid: &str) -> Result<Vec<RemoteLoan>, IrbisError> {
        let state = self.state.lock().expect("mock library state");
        let Some(mfn) = MockState::lookup(&state.reader_index, card_uid) else {
            return Ok(Vec::new());
        };
        Ok(active_loans(&state.readers[&mfn])
            .into_iter()
            .map(|loan| RemoteLoan {
                rfid: loan.rfid,
                title: loan.title,
                due_date: loan.due_date,
            })
            .collect())
    }

    async fn register_issue(&self, book_rfid: &str, card_uid: &str) -> Result<String, IrbisError> {
        let mut state = self.state.lock().expect("mock library state");
        let reader_mfn =
            MockState::lookup(&state.reader_index, card_uid).ok_or_else(|| IrbisError::NotFound {
                what: format!("reader {card_uid}"),
            })?;
        let book_mfn =
            MockState::lookup(&state.book_index, book_rfid).ok_or_else(|| IrbisError::NotFound {
                what: format!("book {book_rfid}"),
            })?;

        let book = state.books[&book_mfn].clone();
        let exemplar = find_exemplar(&book, book_rfid).ok_or_else(|| IrbisError::NotFound {
            what: format!("exemplar {book_rfid}"),
        })?;
        if !exemplar.is_available() {
            return Err(IrbisError::ExemplarUnavailable {
                status: exemplar.status,
            });
        }

        let now = Local::now();
        let due = now + ChronoDuration::days(i64::from(self.loan_days));
        let mut loan = Subfields::default();
        loan.set('a', book.field(TAG_SHELFMARK));
        loan.set('b', exemplar.inventory.clone());
        let mut brief = book_brief(&book);
        brief.truncate(100);
        loan.set('c', brief);
        loan.set('d', now.format("%Y%m%d").to_string());
        loan.set('e', due.format("%Y%m%d").to_string());
        loan.set('f', OPEN_LOAN);
        loan.set('g', "IBIS");
        loan.set('h', normalize_uid(book_rfid).unwrap_or_default());
        loan.set('i', self.operator.clone());
        loan.set('k', exemplar.location.clone());
        loan.set('v', self.location_code.clone());
        loan.set('z', uuid::Uuid::new_v4().simple().to_string());
        loan.set('1', now.format("%H%M%S").to_string());

        state
            .readers
            .get_mut(&reader_mfn)
            .expect("indexed reader")
            .add_field(TAG_LOAN, loan.to_string());

        set_exemplar_status(state.books.get_mut(&book_mfn).expect("indexed book"), book_rfid, "1");

        let title = book_brief(&book);
        Ok(format!("issued: {title}"))
    }

    async fn register_return(&self, book_rfid: &str) -> Result<String, IrbisError> {
        let mut state = self.state.lock().expect("mock library state");

        let holder = state
            .readers
            .iter()
            .find_map(|(mfn, record)| find_open_loan(record, book_rfid).map(|idx| (*mfn, idx)));

        let Some((reader_mfn, loan_index)) = holder else {
            if let Some(book_mfn) = MockState::lookup(&state.book_index, book_rfid) {
                if let Some(exemplar) = find_exemplar(&state.books[&book_mfn], book_rfid) {
                    if exemplar.is_available() {
                        return Ok("already returned".to_string());
                    }
                }
            }
            return Err(IrbisError::NotOnLoan);
        };

        let now = Local::now();
        let reader = state.readers.get_mut(&reader_mfn).expect("indexed reader");
        let field = reader.field_values(TAG_LOAN)[loan_index].clone();
        let mut loan = Subfields::parse(&field);
        loan.remove('c');
        loan.set('f', now.format("%Y%m%d").to_string());
        loan.set('2', now.format("%H%M%S").to_string());
        loan.set('r', self.location_code.clone());
        loan.set('i', self.operator.clone());
        reader.set_field_at(TAG_LOAN, loan_index, loan.to_string());

        if let Some(book_mfn) = MockState::lookup(&state.book_index, book_rfid) {
            set_exemplar_status(
                state.books.get_mut(&book_mfn).expect("indexed book"),
                book_rfid,
                "0",
            );
        }
        Ok("returned".to_string())
    }
}

fn set_exemplar_status(record: &mut Record, rfid: &str, status: &str) {
    if let Some(exemplar) = find_exemplar(record, rfid) {
        let field = record.field_values(TAG_EXEMPLAR)[exemplar.index].clone();
        let mut subfields = Subfields::parse(&field);
        subfields.set('a', status);
        record.set_field_at(TAG_EXEMPLAR, exemplar.index, subfields.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_readers_resolve() {
        let mock = MockLibrary::seeded();
        let user = mock.get_user("CARD001").await.unwrap().unwrap();
        assert_eq!(user.role, RemoteRole::Reader);
        assert_eq!(user.name, "Ivanov Ivan Ivanovich");

        let admin = mock.get_user("ADMIN99").await.unwrap().unwrap();
        assert_eq!(admin.role, RemoteRole::Admin);

        assert!(mock.get_user("ZZZ999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_issue_then_return_round_trip() {
        let mock = MockLibrary::seeded();

        mock.register_issue("BOOK001", "CARD001").await.unwrap();
        assert_eq!(mock.exemplar_status("BOOK001").as_deref(), Some("1"));

        let loans = mock.get_loans("CARD001").await.unwrap();
        assert_eq!(loans.len(), 1);

        let book = mock.get_book("BOOK001").await.unwrap().unwrap();
        assert_eq!(book.status, RemoteBookStatus::Issued);

        mock.register_return("BOOK001").await.unwrap();
        assert_eq!(mock.exemplar_status("BOOK001").as_deref(), Some("0"));
        assert!(mock.get_loans("CARD001").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_double_issue_rejected() {
        let mock = MockLibrary::seeded();
        mock.register_issue("BOOK001", "CARD001").await.unwrap();
        let err = mock.register_issue("BOOK001", "CARD002").await.unwrap_err();
        assert!(matches!(err, IrbisError::ExemplarUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_return_is_idempotent_on_shelved_book() {
        let mock = MockLibrary::seeded();
        let message = mock.register_return("BOOK002").await.unwrap();
        assert_eq!(message, "already returned");
    }

    #[tokio::test]
    async fn test_return_of_unknown_book_fails() {
        let mock = MockLibrary::seeded();
        let err = mock.register_return("NOPE42").await.unwrap_err();
        assert!(matches!(err, IrbisError::NotOnLoan));
    }

    #[tokio::test]
    async fn test_added_book_found_by_variant() {
        let mock = MockLibrary::new();
        mock.add_book("AABBCCDD", "Walden", "Thoreau H.");
        let book = mock.get_book("aa:bb:cc:dd").await.unwrap().unwrap();
        assert_eq!(book.title, "Walden");
        assert_eq!(book.status, RemoteBookStatus::Available);
    }
}
