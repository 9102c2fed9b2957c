//! High-level library workflows over the wire client.
//!
//! The catalogue indexes grew organically: reader cards are enrolled
//! under `RI=` or `EKP=` prefixes, book tags under `H=`, `HI=`, `RF=` or
//! `RFID=`, each possibly in any historical UID shape. Searches sweep
//! pattern × variant and short-circuit on the first hit; the winning
//! pattern is cached per index class and tried first on later lookups.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local};

use bookmat_core::rfid::{normalize_uid, uid_variants};

use crate::connection::{IrbisConnection, IrbisConfig};
use crate::error::IrbisError;
use crate::record::{
    active_loans, book_brief, find_exemplar, find_open_loan, Record, Subfields, OPEN_LOAN,
    TAG_EXEMPLAR, TAG_LOAN, TAG_READER_CATEGORY, TAG_READER_NAME, TAG_SHELFMARK,
};

/// Index prefixes for reader-card lookups.
pub const READER_PATTERNS: [&str; 2] = ["RI=", "EKP="];
/// Index prefixes for book-tag lookups.
pub const BOOK_PATTERNS: [&str; 4] = ["H=", "HI=", "RF=", "RFID="];
/// Index prefix resolving which reader holds a book.
pub const HOLDER_PATTERN: &str = "HIN=";

/// Reader identity as the remote catalogue knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser {
    pub mfn: i32,
    pub uid: String,
    pub name: String,
    pub role: RemoteRole,
}

/// Coarse role derived from the reader-category field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRole {
    Reader,
    Librarian,
    Admin,
}

impl RemoteRole {
    /// Maps a free-form category string onto a role.
    #[must_use]
    pub fn from_category(category: &str) -> Self {
        let lowered = category.to_lowercase();
        if lowered.contains("admin") || lowered.contains("админ") {
            Self::Admin
        } else if lowered.contains("librar")
            || lowered.contains("staff")
            || lowered.contains("библиотек")
            || lowered.contains("сотрудник")
        {
            Self::Librarian
        } else {
            Self::Reader
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reader => "reader",
            Self::Librarian => "librarian",
            Self::Admin => "admin",
        }
    }
}

/// Exemplar availability as the remote catalogue reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteBookStatus {
    Available,
    Issued,
    Other(String),
}

/// Book identity and status from the remote catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBook {
    pub mfn: i32,
    pub rfid: String,
    pub title: String,
    pub author: String,
    pub status: RemoteBookStatus,
}

/// One open loan, as reported to the authentication snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLoan {
    pub rfid: String,
    pub title: String,
    pub due_date: String,
}

/// The remote-catalogue operations the transaction layer needs.
///
/// Implemented by the wire client ([`IrbisService`]) and by the
/// in-memory mock used for host operation and tests.
#[async_trait]
pub trait LibraryClient: Send + Sync {
    /// Registers on the server. Mock backends accept unconditionally.
    async fn connect(&self) -> Result<(), IrbisError>;

    /// Unregisters; best-effort.
    async fn disconnect(&self) -> Result<(), IrbisError>;

    /// Looks a reader up by card UID.
    async fn get_user(&self, card_uid: &str) -> Result<Option<RemoteUser>, IrbisError>;

    /// Looks a book up by RFID tag.
    async fn get_book(&self, rfid: &str) -> Result<Option<RemoteBook>, IrbisError>;

    /// Open loans held by a reader.
    async fn get_loans(&self, card_uid: &str) -> Result<Vec<RemoteLoan>, IrbisError>;

    /// Registers an issue: appends the loan to the reader record and
    /// marks the exemplar issued. Returns a human-readable confirmation.
    async fn register_issue(&self, book_rfid: &str, card_uid: &str) -> Result<String, IrbisError>;

    /// Registers a return. Idempotent: a book whose exemplar is already
    /// back on shelf reports success.
    async fn register_return(&self, book_rfid: &str) -> Result<String, IrbisError>;
}

#[derive(Debug, Default)]
struct PatternCache {
    reader: Option<&'static str>,
    book: Option<&'static str>,
}

/// [`LibraryClient`] over the real server.
pub struct IrbisService {
    conn: IrbisConnection,
    cache: Mutex<PatternCache>,
}

impl IrbisService {
    #[must_use]
    pub fn new(config: IrbisConfig) -> Self {
        Self {
            conn: IrbisConnection::new(config),
            cache: Mutex::new(PatternCache::default()),
        }
    }

    /// Sweeps `patterns × uid_variants(uid)` on `database`, reading the
    /// first hit. The winning pattern is reported back for caching.
    async fn search_read(
        &self,
        database: &str,
        patterns: &[&'static str],
        preferred: Option<&'static str>,
        uid: &str,
    ) -> Result<Option<(Record, &'static str)>, IrbisError> {
        let variants = uid_variants(uid);
        if variants.is_empty() {
            return Ok(None);
        }

        let ordered: Vec<&'static str> = preferred
            .into_iter()
            .chain(patterns.iter().copied().filter(|p| Some(*p) != preferred))
            .collect();

        for pattern in ordered {
            for variant in &variants {
                let mfns = self
                    .conn
                    .search(database, &format!("{pattern}{variant}"))
                    .await?;
                if let Some(&mfn) = mfns.first() {
                    let record = self.conn.read_record(database, mfn).await?;
                    return Ok(Some((record, pattern)));
                }
            }
        }
        Ok(None)
    }

    async fn find_reader_record(&self, card_uid: &str) -> Result<Option<Record>, IrbisError> {
        let preferred = self.cache.lock().expect("pattern cache").reader;
        let found = self
            .search_read(
                &self.conn.config().readers_database,
                &READER_PATTERNS,
                preferred,
                card_uid,
            )
            .await?;
        Ok(found.map(|(record, pattern)| {
            self.cache.lock().expect("pattern cache").reader = Some(pattern);
            record
        }))
    }

    async fn find_book_record(&self, rfid: &str) -> Result<Option<Record>, IrbisError> {
        let preferred = self.cache.lock().expect("pattern cache").book;
        let found = self
            .search_read(&self.conn.config().database, &BOOK_PATTERNS, preferred, rfid)
            .await?;
        Ok(found.map(|(record, pattern)| {
            self.cache.lock().expect("pattern cache").book = Some(pattern);
            record
        }))
    }

    /// Finds the reader currently holding a book.
    async fn find_holder_record(&self, book_rfid: &str) -> Result<Option<Record>, IrbisError> {
        let found = self
            .search_read(
                &self.conn.config().readers_database,
                &[HOLDER_PATTERN],
                None,
                book_rfid,
            )
            .await?;
        Ok(found.map(|(record, _)| record))
    }

    fn user_from_record(record: &Record, uid: &str) -> RemoteUser {
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
        RemoteUser {
            mfn: record.mfn,
            // The caller's shape, not the canonical form: card UIDs are
            // enrolled as free text (`CARD001`) and the local store keys
            // on the same shape.
            uid: uid.to_string(),
            name: if name.is_empty() {
                "Reader".to_string()
            } else {
                name
            },
            role: RemoteRole::from_category(record.field(TAG_READER_CATEGORY)),
        }
    }

    fn book_from_record(record: &Record, rfid: &str) -> RemoteBook {
        let status = match find_exemplar(record, rfid) {
            Some(exemplar) if exemplar.is_available() => RemoteBookStatus::Available,
            Some(exemplar) if exemplar.status == "1" => RemoteBookStatus::Issued,
            Some(exemplar) => RemoteBookStatus::Other(exemplar.status),
            None => RemoteBookStatus::Other(String::new()),
        };
        let brief = book_brief(record);
        let (author, title) = match brief.split_once(". ") {
            Some((author, title)) => (author.to_string(), title.to_string()),
            None => (String::new(), brief.clone()),
        };
        RemoteBook {
            mfn: record.mfn,
            rfid: rfid.to_string(),
            title,
            author,
            status,
        }
    }

    /// Builds the loan entry appended to a reader's 40 field.
    fn build_loan_entry(&self, book: &Record, rfid: &str) -> String {
        let config = self.conn.config();
        let exemplar = find_exemplar(book, rfid);
        let now = Local::now();
        let due = now + ChronoDuration::days(i64::from(config.loan_days));

        let mut loan = Subfields::default();
        loan.set('a', book.field(TAG_SHELFMARK));
        if let Some(exemplar) = &exemplar {
            loan.set('b', exemplar.inventory.clone());
        }
        let mut brief = book_brief(book);
        brief.truncate(100);
        loan.set('c', brief);
        loan.set('d', now.format("%Y%m%d").to_string());
        loan.set('e', due.format("%Y%m%d").to_string());
        loan.set('f', OPEN_LOAN);
        loan.set('g', config.database.clone());
        loan.set('h', normalize_uid(rfid).unwrap_or_default());
        loan.set('i', config.username.clone());
        if let Some(exemplar) = &exemplar {
            loan.set('k', exemplar.location.clone());
        }
        loan.set('v', config.location_code.clone());
        loan.set('z', uuid::Uuid::new_v4().simple().to_string());
        loan.set('1', now.format("%H%M%S").to_string());
        loan.to_string()
    }

    /// Flips the matched exemplar's status and writes the book record.
    /// A failure here is the tolerated half of the dual write: the
    /// reader record is already committed, so the error is downgraded.
    async fn write_exemplar_status(&self, mut book: Record, rfid: &str, status: &str) {
        let Some(exemplar) = find_exemplar(&book, rfid) else {
            return;
        };
        let field = book.field_values(TAG_EXEMPLAR)[exemplar.index].clone();
        let mut subfields = Subfields::parse(&field);
        subfields.set('a', status);
        book.set_field_at(TAG_EXEMPLAR, exemplar.index, subfields.to_string());

        if let Err(err) = self
            .conn
            .write_record(&self.conn.config().database, &book)
            .await
        {
            tracing::warn!(
                mfn = book.mfn,
                status,
                %err,
                "exemplar status write failed after reader record committed"
            );
        }
    }
}

#[async_trait]
impl LibraryClient for IrbisService {
    async fn connect(&self) -> Result<(), IrbisError> {
        self.conn.register().await
    }

    async fn disconnect(&self) -> Result<(), IrbisError> {
        self.conn.unregister().await
    }

    async fn get_user(&self, card_uid: &str) -> Result<Option<RemoteUser>, IrbisError> {
        Ok(self
            .find_reader_record(card_uid)
            .await?
            .map(|record| Self::user_from_record(&record, card_uid)))
    }

    async fn get_book(&self, rfid: &str) -> Result<Option<RemoteBook>, IrbisError> {
        Ok(self
            .find_book_record(rfid)
            .await?
            .map(|record| Self::book_from_record(&record, rfid)))
    }

    async fn get_loans(&self, card_uid: &str) -> Result<Vec<RemoteLoan>, IrbisError> {
        let Some(record) = self.find_reader_record(card_uid).await? else {
            return Ok(Vec::new());
        };
        Ok(active_loans(&record)
            .into_iter()
            .map(|loan| RemoteLoan {
                rfid: loan.rfid,
                title: loan.title,
                due_date: loan.due_date,
            })
            .collect())
    }

    async fn register_issue(&self, book_rfid: &str, card_uid: &str) -> Result<String, IrbisError> {
        let mut reader = self
            .find_reader_record(card_uid)
            .await?
            .ok_or_else(|| IrbisError::NotFound {
                what: format!("reader {card_uid}"),
            })?;
        let book = self
            .find_book_record(book_rfid)
            .await?
            .ok_or_else(|| IrbisError::NotFound {
                what: format!("book {book_rfid}"),
            })?;

        let exemplar = find_exemplar(&book, book_rfid).ok_or_else(|| IrbisError::NotFound {
            what: format!("exemplar {book_rfid}"),
        })?;
        if !exemplar.is_available() {
            return Err(IrbisError::ExemplarUnavailable {
                status: exemplar.status,
            });
        }

        reader.add_field(TAG_LOAN, self.build_loan_entry(&book, book_rfid));
        self.conn
            .write_record(&self.conn.config().readers_database, &reader)
            .await?;

        let title = book_brief(&book);
        self.write_exemplar_status(book, book_rfid, "1").await;
        Ok(format!("issued: {title}"))
    }

    async fn register_return(&self, book_rfid: &str) -> Result<String, IrbisError> {
        let config = self.conn.config();
        let Some(mut reader) = self.find_holder_record(book_rfid).await? else {
            // No reader holds it. If the exemplar is already on shelf
            // the return is an idempotent success.
            if let Some(book) = self.find_book_record(book_rfid).await? {
                if let Some(exemplar) = find_exemplar(&book, book_rfid) {
                    if exemplar.is_available() {
                        return Ok("already returned".to_string());
                    }
                }
            }
            return Err(IrbisError::NotOnLoan);
        };

        let index = find_open_loan(&reader, book_rfid).ok_or(IrbisError::NotOnLoan)?;
        let now = Local::now();
        let field = reader.field_values(TAG_LOAN)[index].clone();
        let mut loan = Subfields::parse(&field);
        // The brief is redundant on a closed loan and bloats the record.
        loan.remove('c');
        loan.set('f', now.format("%Y%m%d").to_string());
        loan.set('2', now.format("%H%M%S").to_string());
        loan.set('r', config.location_code.clone());
        loan.set('i', config.username.clone());
        reader.set_field_at(TAG_LOAN, index, loan.to_string());

        self.conn
            .write_record(&config.readers_database, &reader)
            .await?;

        if let Some(book) = self.find_book_record(book_rfid).await? {
            self.write_exemplar_status(book, book_rfid, "0").await;
        }
        Ok("returned".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_mapping() {
        assert_eq!(RemoteRole::from_category("Reader"), RemoteRole::Reader);
        assert_eq!(RemoteRole::from_category(""), RemoteRole::Reader);
        assert_eq!(
            RemoteRole::from_category("Librarian"),
            RemoteRole::Librarian
        );
        assert_eq!(RemoteRole::from_category("staff"), RemoteRole::Librarian);
        assert_eq!(
            RemoteRole::from_category("Administrator"),
            RemoteRole::Admin
        );
    }

    #[test]
    fn test_user_from_record_joins_name_parts() {
        let mut record = Record::new(4);
        record.add_field(TAG_READER_NAME, "^AIvanov^BIvan^GIvanovich");
        record.add_field(TAG_READER_CATEGORY, "Reader");
        let user = IrbisService::user_from_record(&record, "CARD001");
        assert_eq!(user.name, "Ivanov Ivan Ivanovich");
        assert_eq!(user.uid, "CARD001");
        assert_eq!(user.role, RemoteRole::Reader);
    }

    #[test]
    fn test_book_from_record_status() {
        let mut record = Record::new(9);
        record.add_field(crate::record::TAG_TITLE, "^ADune");
        record.add_field(TAG_EXEMPLAR, "^a1^b0001^hAABB");
        let book = IrbisService::book_from_record(&record, "AABB");
        assert_eq!(book.status, RemoteBookStatus::Issued);
        assert_eq!(book.title, "Dune");
    }

    #[test]
    fn test_loan_entry_has_required_subfields() {
        let service = IrbisService::new(IrbisConfig::default());
        let mut book = Record::new(1);
        book.add_field(TAG_SHELFMARK, "R2");
        book.add_field(crate::record::TAG_TITLE, "^AWalden");
        book.add_field(TAG_EXEMPLAR, "^a0^b00009^dLending^hAABBCCDD");

        let entry = service.build_loan_entry(&book, "AABBCCDD");
        let subfields = Subfields::parse(&entry);
        assert_eq!(subfields.get('a'), Some("R2"));
        assert_eq!(subfields.get('b'), Some("00009"));
        assert_eq!(subfields.get('f'), Some(OPEN_LOAN));
        assert_eq!(subfields.get('h'), Some("AABBCCDD"));
        assert_eq!(subfields.get('k'), Some("Lending"));
        assert_eq!(subfields.get('g'), Some("IBIS"));
        assert_eq!(subfields.get('v'), Some("09"));
        // Loan GUID: 32 hex characters.
        assert_eq!(subfields.get('z').unwrap().len(), 32);
        assert_eq!(subfields.get('d').unwrap().len(), 8);
        assert_eq!(subfields.get('e').unwrap().len(), 8);
    }
}
