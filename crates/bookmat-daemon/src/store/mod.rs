//! Local catalogue over `SQLite`.
//!
//! One connection behind a mutex; every query returns owned value
//! copies, never live cursors. On first boot the store materializes the
//! 126 cells of the cabinet grid and marks the configured blocked set.
//! All writes are serialized by the connection lock.

pub mod models;

use std::path::Path;
use std::sync::{Arc, Mutex};

use bookmat_core::cabinet::{self, CellCoord, Row};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row as SqlRow};

use models::{
    Book, BookPatch, BookStatus, Cell, CellPatch, CellStatus, LogLevel, OperationDraft,
    OperationKind, OperationRecord, Statistics, SystemLogRecord, User, UserRole,
};

/// Rows kept in the system log before old entries are pruned.
const SYSTEM_LOG_RETENTION: i64 = 10_000;

/// Store-layer failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row carried a value the schema does not allow.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("no such cell: {0}")]
    CellNotFound(i64),

    #[error("no such book: {0}")]
    BookNotFound(String),
}

/// Handle over the catalogue database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (and if necessary creates) the catalogue at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// A throwaway in-memory catalogue.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_schema(&conn)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.materialize_cells()?;
        Ok(store)
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cells (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                row TEXT NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'empty',
                book_rfid TEXT,
                book_title TEXT,
                reserved_for TEXT,
                needs_extraction INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_cells_position ON cells(row, x, y);

            CREATE TABLE IF NOT EXISTS books (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rfid TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                author TEXT,
                isbn TEXT,
                status TEXT NOT NULL DEFAULT 'in_cabinet',
                cell_id INTEGER REFERENCES cells(id),
                reserved_by TEXT,
                issued_to TEXT,
                issued_at TEXT,
                due_date TEXT
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rfid TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'reader',
                card_type TEXT NOT NULL DEFAULT 'library',
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                operation TEXT NOT NULL,
                cell_row TEXT,
                cell_x INTEGER,
                cell_y INTEGER,
                book_rfid TEXT,
                user_rfid TEXT,
                result TEXT NOT NULL DEFAULT 'OK',
                duration_ms INTEGER NOT NULL DEFAULT 0,
                details TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_operations_kind ON operations(operation);

            CREATE TABLE IF NOT EXISTS system_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                component TEXT
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Creates the 126 cell rows on first boot, blocked set included.
    fn materialize_cells(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cells", [], |row| row.get(0))?;
        if count > 0 {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut insert = conn.prepare(
            "INSERT INTO cells (row, x, y, status, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for coord in cabinet::all_cells() {
            let status = if coord.is_blocked() {
                CellStatus::Blocked
            } else {
                CellStatus::Empty
            };
            insert.execute(params![
                coord.row.as_str(),
                coord.x,
                coord.y,
                status.as_str(),
                now
            ])?;
        }
        tracing::info!(cells = cabinet::TOTAL_CELLS, "cell grid materialized");
        Ok(())
    }

    /// Seeds the bring-up fixtures (mock mode only): four users and five
    /// books, the reserved ones matching the remote mock catalogue.
    pub fn seed_demo_data(&self) -> Result<(), StoreError> {
        {
            let conn = self.lock();
            let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            if users > 0 {
                return Ok(());
            }
            for (rfid, name, role) in [
                ("CARD001", "Ivanov I.I.", UserRole::Reader),
                ("CARD002", "Petrova M.S.", UserRole::Reader),
                ("ADMIN01", "Sidorova A.V.", UserRole::Librarian),
                ("ADMIN99", "Administrator", UserRole::Admin),
            ] {
                conn.execute(
                    "INSERT INTO users (rfid, name, role) VALUES (?1, ?2, ?3)",
                    params![rfid, name, role.as_str()],
                )?;
            }
        }

        let books = [
            ("BOOK001", "War and Peace", "Tolstoy L.N.", Some("CARD001")),
            ("BOOK002", "The Master and Margarita", "Bulgakov M.A.", None),
            ("BOOK003", "1984", "Orwell G.", Some("CARD002")),
            ("BOOK004", "Crime and Punishment", "Dostoevsky F.M.", None),
            ("BOOK005", "Anna Karenina", "Tolstoy L.N.", None),
        ];
        for (rfid, title, author, reserved_by) in books {
            let Some(cell) = self.find_empty_cell()? else {
                break;
            };
            let status = if reserved_by.is_some() {
                BookStatus::Reserved
            } else {
                BookStatus::InCabinet
            };
            {
                let conn = self.lock();
                conn.execute(
                    "INSERT INTO books (rfid, title, author, status, cell_id, reserved_by)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![rfid, title, author, status.as_str(), cell.id, reserved_by],
                )?;
            }
            self.update_cell(
                cell.id,
                &CellPatch {
                    status: Some(CellStatus::Occupied),
                    book_rfid: Some(Some(rfid.to_string())),
                    book_title: Some(Some(title.to_string())),
                    reserved_for: Some(reserved_by.map(str::to_string)),
                    needs_extraction: None,
                },
            )?;
        }
        tracing::info!("demo data seeded");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection")
    }

    // Cells.

    pub fn get_all_cells(&self) -> Result<Vec<Cell>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM cells ORDER BY row, x, y")?;
        let cells = stmt
            .query_map([], map_cell)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cells)
    }

    pub fn get_cell(&self, id: i64) -> Result<Option<Cell>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row("SELECT * FROM cells WHERE id = ?1", params![id], map_cell)
            .optional()?)
    }

    pub fn get_cell_by_position(&self, coord: CellCoord) -> Result<Option<Cell>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT * FROM cells WHERE row = ?1 AND x = ?2 AND y = ?3",
                params![coord.row.as_str(), coord.x, coord.y],
                map_cell,
            )
            .optional()?)
    }

    /// Applies a partial update; bumps `updated_at`.
    pub fn update_cell(&self, id: i64, patch: &CellPatch) -> Result<(), StoreError> {
        let mut sets: Vec<String> = vec!["updated_at = ?".into()];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(Utc::now().to_rfc3339())];

        if let Some(status) = patch.status {
            sets.push("status = ?".into());
            values.push(Box::new(status.as_str().to_string()));
        }
        if let Some(book_rfid) = &patch.book_rfid {
            sets.push("book_rfid = ?".into());
            values.push(Box::new(book_rfid.clone()));
        }
        if let Some(book_title) = &patch.book_title {
            sets.push("book_title = ?".into());
            values.push(Box::new(book_title.clone()));
        }
        if let Some(reserved_for) = &patch.reserved_for {
            sets.push("reserved_for = ?".into());
            values.push(Box::new(reserved_for.clone()));
        }
        if let Some(needs_extraction) = patch.needs_extraction {
            sets.push("needs_extraction = ?".into());
            values.push(Box::new(needs_extraction));
        }

        values.push(Box::new(id));
        let sql = format!("UPDATE cells SET {} WHERE id = ?", sets.join(", "));
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|value| value.as_ref()).collect();
        let conn = self.lock();
        let updated = conn.execute(&sql, refs.as_slice())?;
        if updated == 0 {
            return Err(StoreError::CellNotFound(id));
        }
        Ok(())
    }

    /// First empty cell in store order.
    pub fn find_empty_cell(&self) -> Result<Option<Cell>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT * FROM cells WHERE status = 'empty' ORDER BY id LIMIT 1",
                [],
                map_cell,
            )
            .optional()?)
    }

    pub fn get_cells_needing_extraction(&self) -> Result<Vec<Cell>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM cells WHERE needs_extraction = 1 ORDER BY id")?;
        let cells = stmt
            .query_map([], map_cell)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cells)
    }

    // Users.

    pub fn get_user_by_rfid(&self, rfid: &str) -> Result<Option<User>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT * FROM users WHERE rfid = ?1 AND active = 1",
                params![rfid],
                map_user,
            )
            .optional()?)
    }

    pub fn create_user(&self, rfid: &str, name: &str, role: UserRole) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (rfid, name, role) VALUES (?1, ?2, ?3)",
            params![rfid, name, role.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // Books.

    pub fn get_book_by_rfid(&self, rfid: &str) -> Result<Option<Book>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row("SELECT * FROM books WHERE rfid = ?1", params![rfid], map_book)
            .optional()?)
    }

    pub fn create_book(
        &self,
        rfid: &str,
        title: &str,
        author: Option<&str>,
        cell_id: Option<i64>,
    ) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO books (rfid, title, author, status, cell_id)
             VALUES (?1, ?2, ?3, 'in_cabinet', ?4)",
            params![rfid, title, author, cell_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_book(&self, id: i64, patch: &BookPatch) -> Result<(), StoreError> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(title) = &patch.title {
            sets.push("title = ?".into());
            values.push(Box::new(title.clone()));
        }
        if let Some(author) = &patch.author {
            sets.push("author = ?".into());
            values.push(Box::new(author.clone()));
        }
        if let Some(status) = patch.status {
            sets.push("status = ?".into());
            values.push(Box::new(status.as_str().to_string()));
        }
        if let Some(cell_id) = &patch.cell_id {
            sets.push("cell_id = ?".into());
            values.push(Box::new(*cell_id));
        }
        if let Some(reserved_by) = &patch.reserved_by {
            sets.push("reserved_by = ?".into());
            values.push(Box::new(reserved_by.clone()));
        }
        if let Some(issued_to) = &patch.issued_to {
            sets.push("issued_to = ?".into());
            values.push(Box::new(issued_to.clone()));
        }
        if let Some(issued_at) = &patch.issued_at {
            sets.push("issued_at = ?".into());
            values.push(Box::new(issued_at.map(|t| t.to_rfc3339())));
        }
        if let Some(due_date) = &patch.due_date {
            sets.push("due_date = ?".into());
            values.push(Box::new(due_date.map(|t| t.to_rfc3339())));
        }
        if sets.is_empty() {
            return Ok(());
        }

        values.push(Box::new(id));
        let sql = format!("UPDATE books SET {} WHERE id = ?", sets.join(", "));
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|value| value.as_ref()).collect();
        let conn = self.lock();
        conn.execute(&sql, refs.as_slice())?;
        Ok(())
    }

    /// Books reserved for a patron, newest reservation first.
    pub fn get_user_reservations(&self, user_rfid: &str) -> Result<Vec<Book>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM books WHERE reserved_by = ?1 AND status = 'reserved' ORDER BY id DESC",
        )?;
        let books = stmt
            .query_map(params![user_rfid], map_book)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(books)
    }

    // Logs.

    pub fn log_operation(&self, draft: &OperationDraft) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO operations
                 (timestamp, operation, cell_row, cell_x, cell_y, book_rfid, user_rfid,
                  result, duration_ms, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                Utc::now().to_rfc3339(),
                draft.kind.as_str(),
                draft.cell.map(|c| c.row.as_str()),
                draft.cell.map(|c| c.x),
                draft.cell.map(|c| c.y),
                draft.book_rfid,
                draft.user_rfid,
                draft.result.as_str(),
                draft.duration_ms,
                draft.details,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn log_system(
        &self,
        level: LogLevel,
        component: &str,
        message: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO system_logs (timestamp, level, message, component)
             VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), level.as_str(), message, component],
        )?;
        let id = conn.last_insert_rowid();
        // Bounded retention, pruned opportunistically.
        conn.execute(
            "DELETE FROM system_logs WHERE id <= ?1",
            params![id - SYSTEM_LOG_RETENTION],
        )?;
        Ok(id)
    }

    pub fn recent_logs(&self, limit: u32) -> Result<Vec<SystemLogRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM system_logs ORDER BY id DESC LIMIT ?1")?;
        let logs = stmt
            .query_map(params![limit], map_system_log)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    pub fn recent_operations(
        &self,
        limit: u32,
        kind: Option<OperationKind>,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM operations
             WHERE (?1 IS NULL OR operation = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let operations = stmt
            .query_map(params![kind.map(OperationKind::as_str), limit], map_operation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(operations)
    }

    // Settings.

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                           updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // Statistics.

    pub fn statistics(&self) -> Result<Statistics, StoreError> {
        let conn = self.lock();
        let count = |sql: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(sql, [], |row| row.get(0))
        };
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let count_today = |kind: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(
                "SELECT COUNT(*) FROM operations WHERE operation = ?1 AND timestamp LIKE ?2",
                params![kind, format!("{today}%")],
                |row| row.get(0),
            )
        };

        Ok(Statistics {
            occupied_cells: count("SELECT COUNT(*) FROM cells WHERE status = 'occupied'")?,
            total_cells: count("SELECT COUNT(*) FROM cells WHERE status != 'blocked'")?,
            needs_extraction: count("SELECT COUNT(*) FROM cells WHERE needs_extraction = 1")?,
            issues_total: count("SELECT COUNT(*) FROM operations WHERE operation = 'ISSUE'")?,
            issues_today: count_today("ISSUE")?,
            returns_total: count("SELECT COUNT(*) FROM operations WHERE operation = 'RETURN'")?,
            returns_today: count_today("RETURN")?,
        })
    }
}

// Row mappers. Column order follows the schema.

fn parse_timestamp(text: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_enum<T: std::str::FromStr>(text: String) -> rusqlite::Result<T> {
    text.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad enum value: {text}").into(),
        )
    })
}

fn map_cell(row: &SqlRow<'_>) -> rusqlite::Result<Cell> {
    let row_name: String = row.get("row")?;
    let cabinet_row = parse_enum::<Row>(row_name)?;
    Ok(Cell {
        id: row.get("id")?,
        coord: CellCoord {
            row: cabinet_row,
            x: row.get("x")?,
            y: row.get("y")?,
        },
        status: parse_enum(row.get::<_, String>("status")?)?,
        book_rfid: row.get("book_rfid")?,
        book_title: row.get("book_title")?,
        reserved_for: row.get("reserved_for")?,
        needs_extraction: row.get("needs_extraction")?,
        updated_at: parse_timestamp(row.get("updated_at")?)?,
    })
}

fn map_book(row: &SqlRow<'_>) -> rusqlite::Result<Book> {
    let issued_at: Option<String> = row.get("issued_at")?;
    let due_date: Option<String> = row.get("due_date")?;
    Ok(Book {
        id: row.get("id")?,
        rfid: row.get("rfid")?,
        title: row.get("title")?,
        author: row.get("author")?,
        isbn: row.get("isbn")?,
        status: parse_enum(row.get::<_, String>("status")?)?,
        cell_id: row.get("cell_id")?,
        reserved_by: row.get("reserved_by")?,
        issued_to: row.get("issued_to")?,
        issued_at: issued_at.map(parse_timestamp).transpose()?,
        due_date: due_date.map(parse_timestamp).transpose()?,
    })
}

fn map_user(row: &SqlRow<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        rfid: row.get("rfid")?,
        name: row.get("name")?,
        role: parse_enum(row.get::<_, String>("role")?)?,
        card_type: row.get("card_type")?,
        active: row.get("active")?,
    })
}

fn map_operation(row: &SqlRow<'_>) -> rusqlite::Result<OperationRecord> {
    let cell_row: Option<String> = row.get("cell_row")?;
    let cell = match cell_row {
        Some(name) => Some(CellCoord {
            row: parse_enum::<Row>(name)?,
            x: row.get("cell_x")?,
            y: row.get("cell_y")?,
        }),
        None => None,
    };
    Ok(OperationRecord {
        id: row.get("id")?,
        timestamp: parse_timestamp(row.get("timestamp")?)?,
        kind: parse_enum(row.get::<_, String>("operation")?)?,
        cell,
        book_rfid: row.get("book_rfid")?,
        user_rfid: row.get("user_rfid")?,
        result: parse_enum(row.get::<_, String>("result")?)?,
        duration_ms: row.get("duration_ms")?,
        details: row.get("details")?,
    })
}

fn map_system_log(row: &SqlRow<'_>) -> rusqlite::Result<SystemLogRecord> {
    Ok(SystemLogRecord {
        id: row.get("id")?,
        timestamp: parse_timestamp(row.get("timestamp")?)?,
        level: parse_enum(row.get::<_, String>("level")?)?,
        component: row.get("component")?,
        message: row.get("message")?,
    })
}
