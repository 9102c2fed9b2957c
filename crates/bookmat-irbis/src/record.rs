//! Bibliographic record representation.
//!
//! A record is a flat mapping from a numeric tag to an ordered list of
//! field values; each value is a run of `^<code><text>` subfields. The
//! representation stays flat and string-typed (that is what travels on
//! the wire); structured views are parsed on demand:
//!
//! - field 910 repeats one entry per physical **exemplar** (`^a` status,
//!   `^b` inventory number, `^c` acquisition date, `^d` location, `^h`
//!   RFID tag);
//! - field 40 on a reader record repeats one entry per **loan**, with
//!   `******` in `^f` marking an open loan.

use std::collections::BTreeMap;
use std::fmt;

use bookmat_core::rfid::{normalize_uid, uid_variants};

/// Open-loan marker in the return-date subfield.
pub const OPEN_LOAN: &str = "******";
/// Exemplar field tag.
pub const TAG_EXEMPLAR: u32 = 910;
/// Loan field tag on reader records.
pub const TAG_LOAN: u32 = 40;
/// Reader display-name tag.
pub const TAG_READER_NAME: u32 = 10;
/// Reader card-identifier tag.
pub const TAG_READER_CARD: u32 = 30;
/// Reader category tag.
pub const TAG_READER_CATEGORY: u32 = 50;
/// Title tag.
pub const TAG_TITLE: u32 = 200;
/// Primary author tag.
pub const TAG_AUTHOR: u32 = 700;
/// Secondary author tag.
pub const TAG_AUTHOR_ALT: u32 = 701;
/// Shelfmark tag.
pub const TAG_SHELFMARK: u32 = 903;

/// One parsed record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub mfn: i32,
    pub status: i32,
    pub version: i32,
    pub fields: BTreeMap<u32, Vec<String>>,
}

impl Record {
    #[must_use]
    pub fn new(mfn: i32) -> Self {
        Self {
            mfn,
            ..Self::default()
        }
    }

    /// Parses the `tag#value` line format. Tag `0` carries the MFN.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if text.trim().is_empty() {
            return None;
        }
        let mut record = Self::default();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let Some((tag, value)) = line.split_once('#') else {
                continue;
            };
            let Ok(tag) = tag.trim().parse::<u32>() else {
                continue;
            };
            if tag == 0 {
                record.mfn = value.trim().parse().unwrap_or(0);
            } else {
                record.fields.entry(tag).or_default().push(value.to_string());
            }
        }
        Some(record)
    }

    /// First value of a field, or empty.
    #[must_use]
    pub fn field(&self, tag: u32) -> &str {
        self.fields
            .get(&tag)
            .and_then(|values| values.first())
            .map_or("", String::as_str)
    }

    /// All values of a repeating field.
    #[must_use]
    pub fn field_values(&self, tag: u32) -> &[String] {
        self.fields.get(&tag).map_or(&[], Vec::as_slice)
    }

    pub fn add_field(&mut self, tag: u32, value: impl Into<String>) {
        self.fields.entry(tag).or_default().push(value.into());
    }

    /// Replaces one occurrence of a repeating field.
    pub fn set_field_at(&mut self, tag: u32, index: usize, value: impl Into<String>) {
        if let Some(values) = self.fields.get_mut(&tag) {
            if let Some(slot) = values.get_mut(index) {
                *slot = value.into();
            }
        }
    }
}

impl fmt::Display for Record {
    /// Serializes back to the `tag#value` line format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "0#{}", self.mfn)?;
        for (tag, values) in &self.fields {
            for value in values {
                writeln!(f, "{tag}#{value}")?;
            }
        }
        Ok(())
    }
}

/// Ordered subfield list of one field value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subfields(Vec<(char, String)>);

impl Subfields {
    /// Parses `^Avalue^Bvalue` runs. Text before the first `^` is
    /// dropped; codes are upper-cased.
    #[must_use]
    pub fn parse(field: &str) -> Self {
        let mut subfields = Vec::new();
        for part in field.split('^').skip(1) {
            let mut chars = part.chars();
            let Some(code) = chars.next() else {
                continue;
            };
            subfields.push((code.to_ascii_uppercase(), chars.as_str().to_string()));
        }
        Self(subfields)
    }

    #[must_use]
    pub fn get(&self, code: char) -> Option<&str> {
        let code = code.to_ascii_uppercase();
        self.0
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a subfield, appending when absent.
    pub fn set(&mut self, code: char, value: impl Into<String>) {
        let code = code.to_ascii_uppercase();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(c, _)| *c == code) {
            slot.1 = value;
        } else {
            self.0.push((code, value));
        }
    }

    pub fn remove(&mut self, code: char) {
        let code = code.to_ascii_uppercase();
        self.0.retain(|(c, _)| *c != code);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Subfields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (code, value) in &self.0 {
            write!(f, "^{code}{value}")?;
        }
        Ok(())
    }
}

/// Structured view of one 910 entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exemplar {
    /// Index into the record's repeating 910 field.
    pub index: usize,
    /// `"0"` on shelf, `"1"` issued, other codes are write-offs.
    pub status: String,
    pub inventory: String,
    pub date: String,
    pub location: String,
    /// Normalized tag as stored on the record.
    pub rfid: String,
}

impl Exemplar {
    /// Whether this exemplar may be issued.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status.is_empty() || self.status == "0"
    }
}

/// Finds the exemplar whose `^h` matches the RFID (canonical form or any
/// historical variant).
#[must_use]
pub fn find_exemplar(record: &Record, rfid: &str) -> Option<Exemplar> {
    let target = normalize_uid(rfid)?;
    let variants = uid_variants(rfid);

    for (index, field) in record.field_values(TAG_EXEMPLAR).iter().enumerate() {
        let subfields = Subfields::parse(field);
        let Some(stored) = subfields.get('h').and_then(normalize_uid) else {
            continue;
        };
        let matched = stored == target
            || variants
                .iter()
                .any(|variant| variant.to_ascii_uppercase() == stored);
        if matched {
            return Some(Exemplar {
                index,
                status: subfields.get('a').unwrap_or("").to_string(),
                inventory: subfields.get('b').unwrap_or("").to_string(),
                date: subfields.get('c').unwrap_or("").to_string(),
                location: subfields.get('d').unwrap_or("").to_string(),
                rfid: stored,
            });
        }
    }
    None
}

/// Structured view of one open or closed loan entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loan {
    pub rfid: String,
    pub title: String,
    pub shelfmark: String,
    pub inventory: String,
    pub issue_date: String,
    pub due_date: String,
    pub return_date: String,
    pub operator: String,
    pub location: String,
    pub guid: String,
}

impl Loan {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.return_date == OPEN_LOAN
    }
}

fn parse_loan(field: &str) -> Loan {
    let subfields = Subfields::parse(field);
    let get = |code| subfields.get(code).unwrap_or("").to_string();
    Loan {
        rfid: get('h'),
        title: get('c'),
        shelfmark: get('a'),
        inventory: get('b'),
        issue_date: get('d'),
        due_date: get('e'),
        return_date: get('f'),
        operator: get('i'),
        location: get('k'),
        guid: get('z'),
    }
}

/// Open loans on a reader record.
#[must_use]
pub fn active_loans(record: &Record) -> Vec<Loan> {
    record
        .field_values(TAG_LOAN)
        .iter()
        .map(|field| parse_loan(field))
        .filter(Loan::is_open)
        .collect()
}

/// Index of the open loan for an RFID within the repeating 40 field.
///
/// Matches canonical form, historical variants, and suffix overlap (a
/// truncated enrollment against a full EPC or vice versa).
#[must_use]
pub fn find_open_loan(record: &Record, rfid: &str) -> Option<usize> {
    let target = normalize_uid(rfid)?;
    let variants = uid_variants(rfid);

    for (index, field) in record.field_values(TAG_LOAN).iter().enumerate() {
        let subfields = Subfields::parse(field);
        if subfields.get('f') != Some(OPEN_LOAN) {
            continue;
        }
        let Some(stored) = subfields.get('h').and_then(normalize_uid) else {
            continue;
        };
        if stored == target
            || variants
                .iter()
                .any(|variant| variant.to_ascii_uppercase() == stored)
            || target.ends_with(&stored)
            || stored.ends_with(&target)
        {
            return Some(index);
        }
    }
    None
}

/// Short `Author. Title` line from a book record.
#[must_use]
pub fn book_brief(record: &Record) -> String {
    let mut author = record.field(TAG_AUTHOR);
    if author.is_empty() {
        author = record.field(TAG_AUTHOR_ALT);
    }
    let author = {
        let subfields = Subfields::parse(author);
        let surname = subfields.get('a').unwrap_or("");
        let initials = subfields.get('b').unwrap_or("");
        format!("{surname} {initials}").trim().to_string()
    };
    let title = Subfields::parse(record.field(TAG_TITLE))
        .get('a')
        .unwrap_or("")
        .to_string();

    match (author.is_empty(), title.is_empty()) {
        (false, false) => format!("{author}. {title}"),
        (true, false) => title,
        (false, true) => author,
        (true, true) => "Unknown book".to_string(),
    }
}
