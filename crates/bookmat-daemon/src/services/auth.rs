//! Card authentication.
//!
//! Local users win; the remote catalogue is the fallback for readers
//! enrolled only there. The outcome snapshots the patron's reservations
//! (local rows unioned with remote open loans, deduplicated by RFID)
//! and the count of cells waiting for extraction, which the staff UI
//! surfaces after login.

use bookmat_core::cabinet::CellCoord;
use bookmat_core::Event;
use bookmat_irbis::{LibraryClient as _, RemoteRole};
use serde::Serialize;

use crate::store::models::{LogLevel, User, UserRole};

use super::{TransactionError, Transactions};

/// One reserved or on-loan book in the authentication snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservationView {
    pub rfid: String,
    pub title: String,
    /// Present when the book sits in this cabinet.
    pub cell: Option<CellCoord>,
    pub due_date: Option<String>,
}

/// Result of a successful authentication.
#[derive(Debug, Clone, Serialize)]
pub struct AuthOutcome {
    pub user: User,
    pub reservations: Vec<ReservationView>,
    /// Cells flagged for extraction; relevant to staff roles.
    pub needs_extraction: usize,
}

const fn role_from_remote(role: RemoteRole) -> UserRole {
    match role {
        RemoteRole::Reader => UserRole::Reader,
        RemoteRole::Librarian => UserRole::Librarian,
        RemoteRole::Admin => UserRole::Admin,
    }
}

impl Transactions {
    /// Authenticates a card tap and opens the session.
    pub async fn authenticate(&self, card_rfid: &str) -> Result<AuthOutcome, TransactionError> {
        let local = self.store.get_user_by_rfid(card_rfid)?;

        let user = match local {
            Some(user) => Some(user),
            None => match self.library.get_user(card_rfid).await {
                Ok(Some(remote)) => Some(User {
                    id: 0,
                    rfid: card_rfid.to_string(),
                    name: remote.name,
                    role: role_from_remote(remote.role),
                    card_type: "library".to_string(),
                    active: true,
                }),
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(%err, "remote user lookup failed during authentication");
                    None
                }
            },
        };

        let Some(user) = user else {
            self.log_system(
                LogLevel::Warning,
                "auth",
                &format!("unknown card {card_rfid}"),
            );
            self.events.publish(Event::AuthResult {
                success: false,
                user: None,
                error: Some("unknown card".to_string()),
            });
            return Err(TransactionError::UnknownCard);
        };

        // Local reservations first, then remote open loans the local
        // store does not know about.
        let mut reservations: Vec<ReservationView> = Vec::new();
        for book in self.store.get_user_reservations(card_rfid)? {
            let cell = match book.cell_id {
                Some(cell_id) => self.store.get_cell(cell_id)?.map(|c| c.coord),
                None => None,
            };
            reservations.push(ReservationView {
                rfid: book.rfid,
                title: book.title,
                cell,
                due_date: book.due_date.map(|d| d.to_rfc3339()),
            });
        }
        match self.library.get_loans(card_rfid).await {
            Ok(loans) => {
                for loan in loans {
                    if !reservations.iter().any(|r| r.rfid == loan.rfid) {
                        reservations.push(ReservationView {
                            rfid: loan.rfid,
                            title: loan.title,
                            cell: None,
                            due_date: Some(loan.due_date),
                        });
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%err, "remote loan snapshot failed; using local only");
            }
        }

        let needs_extraction = self.store.get_cells_needing_extraction()?.len();

        *self.session.lock().expect("session state") = Some(user.clone());
        self.log_system(
            LogLevel::Info,
            "auth",
            &format!("authenticated {} ({})", user.name, user.role),
        );
        self.events.publish(Event::AuthResult {
            success: true,
            user: Some(user.name.clone()),
            error: None,
        });

        Ok(AuthOutcome {
            user,
            reservations,
            needs_extraction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::rig;
    use super::*;
    use bookmat_core::Event;

    #[tokio::test(start_paused = true)]
    async fn test_known_reader_authenticates() {
        let rig = rig();
        let outcome = rig.transactions.authenticate("CARD001").await.unwrap();
        assert_eq!(outcome.user.role, UserRole::Reader);
        assert_eq!(outcome.needs_extraction, 0);
        // BOOK001 is reserved for this card in the seed data.
        assert!(outcome.reservations.iter().any(|r| r.rfid == "BOOK001"));
        assert!(rig.transactions.current_user().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_card_rejected_with_warning() {
        let rig = rig();
        let mut rx = rig.events.subscribe();
        let err = rig.transactions.authenticate("ZZZ999").await.unwrap_err();
        assert!(matches!(err, TransactionError::UnknownCard));
        assert!(rig.transactions.current_user().is_none());

        // WARNING tagged `auth` in the system log.
        let logs = rig.transactions.store().recent_logs(5).unwrap();
        assert!(logs.iter().any(|log| {
            log.level == crate::store::models::LogLevel::Warning
                && log.component.as_deref() == Some("auth")
        }));

        // Failure broadcast on the bus.
        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::AuthResult { success: false, .. } = event {
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_only_reader_falls_back() {
        let rig = rig();
        rig.library.add_reader("REMOTE77", "^ARemote^BReader", "Reader");
        let outcome = rig.transactions.authenticate("REMOTE77").await.unwrap();
        assert_eq!(outcome.user.name, "Remote Reader");
        assert_eq!(outcome.user.role, UserRole::Reader);
        assert_eq!(outcome.user.id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_session() {
        let rig = rig();
        rig.transactions.authenticate("ADMIN99").await.unwrap();
        assert!(rig.transactions.current_user().is_some());
        rig.transactions.logout();
        assert!(rig.transactions.current_user().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_gate() {
        let rig = rig();
        use crate::store::models::Permission;

        assert!(matches!(
            rig.transactions.require_permission(Permission::Load),
            Err(TransactionError::SessionAbsent)
        ));

        rig.transactions.authenticate("CARD001").await.unwrap();
        assert!(rig.transactions.require_permission(Permission::Issue).is_ok());
        assert!(matches!(
            rig.transactions.require_permission(Permission::Load),
            Err(TransactionError::PermissionDenied)
        ));

        rig.transactions.authenticate("ADMIN01").await.unwrap();
        assert!(rig.transactions.require_permission(Permission::Load).is_ok());
        assert!(matches!(
            rig.transactions.require_permission(Permission::Settings),
            Err(TransactionError::PermissionDenied)
        ));
    }
}
