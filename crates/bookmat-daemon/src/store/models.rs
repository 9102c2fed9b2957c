//! Row types of the local catalogue.
//!
//! The store owns the authoritative physical state: which cell holds
//! which book, who a book is reserved for or issued to, and the
//! append-only operation and system logs. Books reference cells by id;
//! cells carry the authoritative `book_rfid`. Neither side owns the
//! other; the relation is walked through the store.

use std::fmt;
use std::str::FromStr;

use bookmat_core::cabinet::CellCoord;
use chrono::{DateTime, Utc};
use serde::Serialize;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

string_enum! {
    /// Physical occupancy of a cell.
    CellStatus {
        Empty => "empty",
        Occupied => "occupied",
        Blocked => "blocked",
    }
}

string_enum! {
    /// Lifecycle of a book row.
    BookStatus {
        InCabinet => "in_cabinet",
        Reserved => "reserved",
        Issued => "issued",
        Returned => "returned",
        Extracted => "extracted",
    }
}

string_enum! {
    /// Patron roles, each carrying a fixed permission set.
    UserRole {
        Reader => "reader",
        Librarian => "librarian",
        Admin => "admin",
    }
}

string_enum! {
    /// Kinds of logged operations.
    OperationKind {
        Init => "INIT",
        Take => "TAKE",
        Give => "GIVE",
        Issue => "ISSUE",
        Return => "RETURN",
        Load => "LOAD",
        Extract => "EXTRACT",
    }
}

string_enum! {
    /// Outcome of a logged operation.
    OperationResult {
        Ok => "OK",
        Error => "ERROR",
    }
}

string_enum! {
    /// System-log severities.
    LogLevel {
        Info => "INFO",
        Warning => "WARNING",
        Error => "ERROR",
    }
}

/// Actions gated by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Issue,
    Return,
    Load,
    Unload,
    Inventory,
    Calibrate,
    Settings,
    Maintenance,
}

impl UserRole {
    /// Whether the role carries a permission. Librarian subsumes reader,
    /// admin subsumes librarian.
    #[must_use]
    pub const fn permits(self, permission: Permission) -> bool {
        match permission {
            Permission::Issue | Permission::Return => true,
            Permission::Load | Permission::Unload | Permission::Inventory => {
                matches!(self, Self::Librarian | Self::Admin)
            }
            Permission::Calibrate | Permission::Settings | Permission::Maintenance => {
                matches!(self, Self::Admin)
            }
        }
    }
}

/// One storage cell row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub id: i64,
    #[serde(flatten)]
    pub coord: CellCoord,
    pub status: CellStatus,
    pub book_rfid: Option<String>,
    pub book_title: Option<String>,
    pub reserved_for: Option<String>,
    pub needs_extraction: bool,
    pub updated_at: DateTime<Utc>,
}

/// One book row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Book {
    pub id: i64,
    pub rfid: String,
    pub title: String,
    pub author: Option<String>,
    pub isbn: Option<String>,
    pub status: BookStatus,
    pub cell_id: Option<i64>,
    pub reserved_by: Option<String>,
    pub issued_to: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
}

/// One enrolled user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub rfid: String,
    pub name: String,
    pub role: UserRole,
    pub card_type: String,
    pub active: bool,
}

/// Append-only operation record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: OperationKind,
    pub cell: Option<CellCoord>,
    pub book_rfid: Option<String>,
    pub user_rfid: Option<String>,
    pub result: OperationResult,
    pub duration_ms: i64,
    pub details: Option<String>,
}

/// Append-only system-log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemLogRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: Option<String>,
    pub message: String,
}

/// Aggregate counters for the status panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub occupied_cells: i64,
    /// Cells usable for storage (everything not blocked).
    pub total_cells: i64,
    pub needs_extraction: i64,
    pub issues_total: i64,
    pub issues_today: i64,
    pub returns_total: i64,
    pub returns_today: i64,
}

/// Partial update of a cell row. `None` leaves a column untouched;
/// `Some(None)` on an optional column clears it.
#[derive(Debug, Clone, Default)]
pub struct CellPatch {
    pub status: Option<CellStatus>,
    pub book_rfid: Option<Option<String>>,
    pub book_title: Option<Option<String>>,
    pub reserved_for: Option<Option<String>>,
    pub needs_extraction: Option<bool>,
}

impl CellPatch {
    /// A patch that clears the cell back to empty.
    #[must_use]
    pub fn cleared() -> Self {
        Self {
            status: Some(CellStatus::Empty),
            book_rfid: Some(None),
            book_title: Some(None),
            reserved_for: Some(None),
            needs_extraction: Some(false),
        }
    }
}

/// Partial update of a book row.
#[derive(Debug, Clone, Default)]
pub struct BookPatch {
    pub title: Option<String>,
    pub author: Option<Option<String>>,
    pub status: Option<BookStatus>,
    pub cell_id: Option<Option<i64>>,
    pub reserved_by: Option<Option<String>>,
    pub issued_to: Option<Option<String>>,
    pub issued_at: Option<Option<DateTime<Utc>>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
}

/// Everything needed to append one operation record.
#[derive(Debug, Clone)]
pub struct OperationDraft {
    pub kind: OperationKind,
    pub cell: Option<CellCoord>,
    pub book_rfid: Option<String>,
    pub user_rfid: Option<String>,
    pub result: OperationResult,
    pub duration_ms: i64,
    pub details: Option<String>,
}

impl OperationDraft {
    #[must_use]
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            cell: None,
            book_rfid: None,
            user_rfid: None,
            result: OperationResult::Ok,
            duration_ms: 0,
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        for status in [CellStatus::Empty, CellStatus::Occupied, CellStatus::Blocked] {
            assert_eq!(status.as_str().parse::<CellStatus>().unwrap(), status);
        }
        for status in [
            BookStatus::InCabinet,
            BookStatus::Reserved,
            BookStatus::Issued,
            BookStatus::Returned,
            BookStatus::Extracted,
        ] {
            assert_eq!(status.as_str().parse::<BookStatus>().unwrap(), status);
        }
        assert!("nonsense".parse::<BookStatus>().is_err());
    }

    #[test]
    fn test_role_permissions_nest() {
        assert!(UserRole::Reader.permits(Permission::Issue));
        assert!(!UserRole::Reader.permits(Permission::Load));
        assert!(UserRole::Librarian.permits(Permission::Inventory));
        assert!(!UserRole::Librarian.permits(Permission::Calibrate));
        assert!(UserRole::Admin.permits(Permission::Maintenance));
        assert!(UserRole::Admin.permits(Permission::Return));
    }
}
