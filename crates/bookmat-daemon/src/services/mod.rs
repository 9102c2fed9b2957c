//! Transaction workflows.
//!
//! Five workflows compose motion, the local catalogue, and the remote
//! library client: authenticate, issue, return, load, and
//! extract/inventory. Each assigns a start timestamp, emits progress
//! through the event bus (the motion layer does that for its phases),
//! appends an operation record, and writes a system-log line.
//!
//! The physical cabinet is one exclusive resource: a tokio mutex is
//! held across every motion-performing transaction, so exactly one
//! transaction is in flight and nothing new starts while a shelf is
//! waiting at the window.
//!
//! Dual-write policy: the local store is the source of truth for
//! physical state. Local writes commit first; a remote failure after
//! that is a WARNING, never a rollback.

mod auth;
mod extract;
mod issue;
mod load;
mod return_book;

pub use auth::{AuthOutcome, ReservationView};
pub use extract::{
    ExtractAllOutcome, ExtractOutcome, InventoryEntry, InventoryReport, InventoryVerdict,
};
pub use issue::IssueOutcome;
pub use load::LoadOutcome;
pub use return_book::ReturnOutcome;

use std::sync::{Arc, Mutex};

use bookmat_core::motion::{Algorithms, MotionError};
use bookmat_core::rfid::BookReader;
use bookmat_core::EventBus;
use bookmat_irbis::LibraryClient;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Timeouts;
use crate::store::models::{
    LogLevel, OperationDraft, OperationKind, OperationResult, Permission, User,
};
use crate::store::{Store, StoreError};

/// Transaction-layer failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransactionError {
    #[error("unknown card")]
    UnknownCard,

    #[error("book not found")]
    BookNotFound,

    #[error("book already issued")]
    AlreadyIssued,

    #[error("reserved by other reader")]
    ReservedByOther,

    #[error("book is not in the cabinet")]
    BookNotInCabinet,

    #[error("no empty cell")]
    NoEmptyCell,

    #[error("cell not found")]
    CellNotFound,

    #[error("cell unavailable")]
    CellUnavailable,

    #[error("cell is empty")]
    CellIsEmpty,

    #[error("book title required")]
    TitleRequired,

    #[error("no authenticated session")]
    SessionAbsent,

    #[error("insufficient permission")]
    PermissionDenied,

    /// The cabinet mechanics failed; the motion layer already published
    /// the coded error event.
    #[error("cabinet mechanics failed: {0}")]
    Mechanics(#[from] MotionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The transaction service facade.
///
/// One per process, owning the session state and the exclusive cabinet
/// guard; constructed by the system context.
pub struct Transactions {
    store: Store,
    library: Arc<dyn LibraryClient>,
    algorithms: Arc<Algorithms>,
    events: EventBus,
    book_reader: Option<Arc<BookReader>>,
    timeouts: Timeouts,
    /// Loan horizon used for locally computed due dates.
    loan_days: u32,
    cabinet: AsyncMutex<()>,
    session: Mutex<Option<User>>,
}

impl Transactions {
    #[must_use]
    pub fn new(
        store: Store,
        library: Arc<dyn LibraryClient>,
        algorithms: Arc<Algorithms>,
        events: EventBus,
        book_reader: Option<Arc<BookReader>>,
        timeouts: Timeouts,
        loan_days: u32,
    ) -> Self {
        Self {
            store,
            library,
            algorithms,
            events,
            book_reader,
            timeouts,
            loan_days,
            cabinet: AsyncMutex::new(()),
            session: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn algorithms(&self) -> &Arc<Algorithms> {
        &self.algorithms
    }

    /// The authenticated user, if any.
    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.session.lock().expect("session state").clone()
    }

    /// Clears the session.
    pub fn logout(&self) {
        *self.session.lock().expect("session state") = None;
    }

    /// Requires an authenticated user carrying `permission`.
    pub fn require_permission(&self, permission: Permission) -> Result<User, TransactionError> {
        let user = self.current_user().ok_or(TransactionError::SessionAbsent)?;
        if user.role.permits(permission) {
            Ok(user)
        } else {
            Err(TransactionError::PermissionDenied)
        }
    }

    /// Best-effort system-log write; a full log never blocks a
    /// transaction.
    pub(crate) fn log_system(&self, level: LogLevel, component: &str, message: &str) {
        if let Err(err) = self.store.log_system(level, component, message) {
            tracing::warn!(%err, component, "system log write failed");
        }
    }

    /// Best-effort operation-record append.
    pub(crate) fn log_operation(&self, draft: OperationDraft) {
        if let Err(err) = self.store.log_operation(&draft) {
            tracing::warn!(%err, kind = draft.kind.as_str(), "operation log write failed");
        }
    }

    /// Records a failed mechanics phase against an operation kind.
    pub(crate) fn log_mechanics_failure(
        &self,
        kind: OperationKind,
        cell: Option<bookmat_core::CellCoord>,
        err: &MotionError,
        started: std::time::Instant,
    ) {
        let mut draft = OperationDraft::new(kind);
        draft.cell = cell;
        draft.result = OperationResult::Error;
        draft.duration_ms = started.elapsed().as_millis() as i64;
        draft.details = Some(err.to_string());
        self.log_operation(draft);
        self.log_system(
            LogLevel::Warning,
            "mechanics",
            &format!("{} failed: {err}", kind.as_str()),
        );
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Shared rig for the transaction tests: mock hardware, in-memory
    //! store, seeded mock library.

    use std::sync::Arc;

    use bookmat_core::calibration::CalibrationStore;
    use bookmat_core::gpio::{Gpio, Level, PinMap};
    use bookmat_core::motion::Algorithms;
    use bookmat_core::motors::MotorDriver;
    use bookmat_core::sensors::{SensorFilter, SensorId, DEBOUNCE};
    use bookmat_core::servos::LatchDriver;
    use bookmat_core::shutters::ShutterDriver;
    use bookmat_core::EventBus;
    use bookmat_irbis::MockLibrary;

    use super::Transactions;
    use crate::config::Timeouts;
    use crate::store::Store;

    pub(crate) struct TestRig {
        pub transactions: Arc<Transactions>,
        pub library: Arc<MockLibrary>,
        pub events: EventBus,
    }

    pub(crate) fn rig() -> TestRig {
        let (gpio, mock) = Gpio::mock();
        let pins = PinMap::default();
        let sensors = Arc::new(SensorFilter::new(gpio.clone(), &pins).unwrap());
        let calibration = Arc::new(CalibrationStore::in_memory("unused.json"));
        let motors = Arc::new(
            MotorDriver::new(gpio.clone(), pins, calibration.clone(), sensors.clone()).unwrap(),
        );
        let latches =
            Arc::new(LatchDriver::new(gpio.clone(), &pins, calibration.clone()).unwrap());
        let shutters = Arc::new(ShutterDriver::new(gpio, &pins).unwrap());
        let events = EventBus::default();
        let algorithms = Arc::new(Algorithms::new(
            motors,
            latches,
            shutters,
            sensors.clone(),
            calibration,
            events.clone(),
        ));

        // Tray switches armed so full-travel phases complete.
        for (id, pin) in [
            (SensorId::TrayBegin, pins.sensor_tray_begin),
            (SensorId::TrayEnd, pins.sensor_tray_end),
        ] {
            mock.set_input_level(pin, Level::High);
            for _ in 0..=DEBOUNCE {
                sensors.read(id).unwrap();
            }
        }

        let store = Store::open_in_memory().unwrap();
        store.seed_demo_data().unwrap();
        let library = Arc::new(MockLibrary::seeded());
        let transactions = Arc::new(Transactions::new(
            store,
            library.clone(),
            algorithms,
            events.clone(),
            None,
            Timeouts {
                user_wait_ms: 50,
                ..Timeouts::default()
            },
            30,
        ));

        TestRig {
            transactions,
            library,
            events,
        }
    }
}
